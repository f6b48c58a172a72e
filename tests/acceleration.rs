//! Numeric behavior of the quasi-Newton acceleration methods.

use nalgebra::DVector;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tandem::accel::{
    Filter, Imvj, IqnIls, Preconditioner, QnCore, RestartMode, Weighting,
};
use tandem::com::group::GroupComm;
use tandem::scheme::data::{CouplingData, DataMap};
use tandem::testing::{assert_approx_eq_tol, assert_slices_approx_eq};

fn field(values: &[f64]) -> CouplingData {
    let shared = Rc::new(RefCell::new(DVector::from_row_slice(values)));
    CouplingData::new(shared, 1, false)
}

fn qn_core(filter: Filter, timesteps_reused: usize, data_ids: Vec<i32>) -> QnCore {
    let group = Arc::new(GroupComm::single());
    let preconditioner = Preconditioner::new(
        Weighting::Constant {
            factors: vec![1.0; data_ids.len()],
        },
        -1,
        Arc::clone(&group),
    );
    QnCore::new(
        0.01,
        false,
        50,
        timesteps_reused,
        filter,
        1e-10,
        data_ids,
        preconditioner,
        group,
    )
    .unwrap()
}

/// The two-field setup exercised by both quasi-Newton variants:
/// displacements start at (1,2,3,4) over an old iterate of ones, forces at
/// 0.1 over an old iterate of 0.2.
fn displacement_force_map() -> DataMap {
    let mut data = DataMap::new();
    data.insert(0, field(&[1.0, 2.0, 3.0, 4.0]));
    data.insert(1, field(&[0.1, 0.1, 0.1, 0.1]));
    data
}

fn set_old(data: &mut DataMap, id: i32, values: &[f64]) {
    data.get_mut(&id)
        .unwrap()
        .old_values
        .set_column(0, &DVector::from_row_slice(values));
}

fn values_of(data: &DataMap, id: i32) -> Vec<f64> {
    data[&id].values().as_slice().to_vec()
}

const SECOND_ITERATION_D: [f64; 4] = [
    -5.63401340929692295845e-01,
    6.10309919173607440257e-01,
    1.78402117927690717636e+00,
    2.95773243938020513610e+00,
];
const SECOND_ITERATION_F: f64 = 8.28025852497733944046e-02;

#[test]
fn iqn_ils_underrelaxes_then_takes_a_least_squares_step() {
    let mut data = displacement_force_map();
    let mut ils = IqnIls::new(qn_core(Filter::Qr1, 6, vec![0, 1]));
    ils.initialize(&mut data).unwrap();
    set_old(&mut data, 0, &[1.0, 1.0, 1.0, 1.0]);
    set_old(&mut data, 1, &[0.2, 0.2, 0.2, 0.2]);

    ils.perform(&mut data).unwrap();
    for (i, expected) in [1.00, 1.01, 1.02, 1.03].iter().enumerate() {
        assert_approx_eq_tol(values_of(&data, 0)[i], *expected, 1e-14);
    }
    for v in values_of(&data, 1) {
        assert_approx_eq_tol(v, 0.199, 1e-14);
    }

    // The solver answers the relaxed iterate with a constant field.
    data.get_mut(&0)
        .unwrap()
        .set_values(Rc::new(RefCell::new(DVector::from_element(4, 10.0))));
    ils.perform(&mut data).unwrap();
    for (i, expected) in SECOND_ITERATION_D.iter().enumerate() {
        assert_approx_eq_tol(values_of(&data, 0)[i], *expected, 1e-13);
    }
    for v in values_of(&data, 1) {
        assert_approx_eq_tol(v, SECOND_ITERATION_F, 1e-13);
    }
}

#[test]
fn imvj_matches_iqn_ils_on_the_first_time_step() {
    let mut data = displacement_force_map();
    let mut imvj = Imvj::new(
        qn_core(Filter::Qr1, 6, vec![0, 1]),
        false,
        RestartMode::NoRestart,
        0,
        0,
        0.0,
        None,
    )
    .unwrap();
    imvj.initialize(&mut data).unwrap();
    set_old(&mut data, 0, &[1.0, 1.0, 1.0, 1.0]);
    set_old(&mut data, 1, &[0.2, 0.2, 0.2, 0.2]);

    imvj.perform(&mut data).unwrap();
    for (i, expected) in [1.00, 1.01, 1.02, 1.03].iter().enumerate() {
        assert_approx_eq_tol(values_of(&data, 0)[i], *expected, 1e-14);
    }
    for v in values_of(&data, 1) {
        assert_approx_eq_tol(v, 0.199, 1e-14);
    }

    data.get_mut(&0)
        .unwrap()
        .set_values(Rc::new(RefCell::new(DVector::from_element(4, 10.0))));
    imvj.perform(&mut data).unwrap();
    // With an empty previous Jacobian the multi-vector update coincides
    // with the least-squares one to ten decimal places.
    for (i, expected) in SECOND_ITERATION_D.iter().enumerate() {
        assert_approx_eq_tol(values_of(&data, 0)[i], *expected, 1e-10);
    }
    for v in values_of(&data, 1) {
        assert_approx_eq_tol(v, SECOND_ITERATION_F, 1e-10);
    }
}

#[test]
fn qr2_filter_that_drops_everything_falls_back_to_relaxation() {
    let mut data = displacement_force_map();
    // A huge threshold wipes every column out of the decomposition.
    let group = Arc::new(GroupComm::single());
    let preconditioner = Preconditioner::new(
        Weighting::Constant {
            factors: vec![1.0, 1.0],
        },
        -1,
        Arc::clone(&group),
    );
    let core = QnCore::new(
        0.01,
        false,
        50,
        6,
        Filter::Qr2,
        1e9,
        vec![0, 1],
        preconditioner,
        group,
    )
    .unwrap();
    let mut ils = IqnIls::new(core);
    ils.initialize(&mut data).unwrap();
    set_old(&mut data, 0, &[1.0, 1.0, 1.0, 1.0]);
    set_old(&mut data, 1, &[0.2, 0.2, 0.2, 0.2]);

    ils.perform(&mut data).unwrap();
    data.get_mut(&0)
        .unwrap()
        .set_values(Rc::new(RefCell::new(DVector::from_element(4, 10.0))));
    ils.perform(&mut data).unwrap();

    assert_eq!(ils.history_columns(), 0);
    // Under-relaxation of (10,10,10,10) against the old iterate of ones.
    let expected: Vec<f64> = [10.0, 10.0, 10.0, 10.0]
        .iter()
        .map(|v| 1.0 + 0.01 * (v - 1.0))
        .collect();
    assert_slices_approx_eq(&values_of(&data, 0), &expected);
}

#[test]
fn history_columns_stay_within_the_configured_bounds() {
    // max-used-iterations of 3 and one reused time step.
    let group = Arc::new(GroupComm::single());
    let preconditioner =
        Preconditioner::new(Weighting::Constant { factors: vec![1.0] }, -1, Arc::clone(&group));
    let core = QnCore::new(
        0.5,
        false,
        3,
        1,
        Filter::Qr1,
        1e-12,
        vec![0],
        preconditioner,
        group,
    )
    .unwrap();
    let mut ils = IqnIls::new(core);
    let mut data = DataMap::new();
    data.insert(0, field(&[0.0; 8]));
    ils.initialize(&mut data).unwrap();

    let mut stimulus = 1.0;
    for step in 0..4 {
        for iteration in 0..5 {
            // A fresh direction every iteration keeps the columns
            // independent until the cap kicks in.
            let mut values = vec![0.0; 8];
            values[(step * 5 + iteration) % 8] = stimulus;
            values[(step * 3 + iteration) % 8] += 0.5 * stimulus;
            stimulus *= 1.3;
            *data[&0].values_mut() = DVector::from_row_slice(&values);
            ils.perform(&mut data).unwrap();
            assert!(ils.history_columns() <= 3, "cap violated");
            data.get_mut(&0).unwrap().store_iteration();
        }
        ils.iterations_converged(&mut data).unwrap();
        data.get_mut(&0).unwrap().shift_old_values();
        // Current step plus one reused step at most.
        assert!(ils.history_per_timestep().len() <= 2);
    }
}

// --- restart invariants -----------------------------------------------------

/// Feed both instances the identical (old iterate, new iterate) stream so
/// their factor histories agree and only the restart policy differs.
fn drive_steps(imvj: &mut Imvj, data: &mut DataMap, steps: &[[Vec<f64>; 3]]) {
    for step in steps {
        for values in step.iter().take(2) {
            *data[&0].values_mut() = DVector::from_row_slice(values);
            imvj.perform(data).unwrap();
        }
        *data[&0].values_mut() = DVector::from_row_slice(&step[2]);
        imvj.iterations_converged(data).unwrap();
        data.get_mut(&0).unwrap().shift_old_values();
    }
}

fn restart_fixture(mode: RestartMode, chunk_size: usize) -> (Imvj, DataMap) {
    let mut imvj = Imvj::new(
        qn_core(Filter::None, 10, vec![0]),
        false,
        mode,
        chunk_size,
        4,
        0.0,
        None,
    )
    .unwrap();
    let mut data = DataMap::new();
    data.insert(0, field(&[0.0; 6]));
    imvj.initialize(&mut data).unwrap();
    (imvj, data)
}

fn two_step_stream() -> Vec<[Vec<f64>; 3]> {
    vec![
        [
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            vec![2.0, 1.0, 4.0, 3.0, 6.0, 5.0],
            vec![0.0, 1.0, 0.0, 2.0, 0.0, 3.0],
        ],
        [
            vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0],
            vec![0.5, 0.25, 0.125, 1.0, 2.0, 4.0],
            vec![3.0, 0.0, -1.0, 0.5, 1.5, -2.5],
        ],
    ]
}

#[test]
fn rs_zero_discards_the_whole_history() {
    let (mut imvj, mut data) = restart_fixture(RestartMode::Zero, 1);
    drive_steps(&mut imvj, &mut data, &two_step_stream());
    // The second completed step triggered the restart.
    assert_eq!(imvj.stored_pairs(), 0);
    let probe = DVector::from_row_slice(&[1.0, -2.0, 0.5, 0.0, 3.0, 1.0]);
    let action = imvj.jacobian_action(&probe).unwrap();
    assert_eq!(action, DVector::zeros(6));
}

#[test]
fn rs_slide_preserves_the_jacobian_action() {
    let (mut reference, mut data_a) = restart_fixture(RestartMode::Zero, 10);
    let (mut slide, mut data_b) = restart_fixture(RestartMode::Slide, 1);
    let stream = two_step_stream();
    drive_steps(&mut reference, &mut data_a, &stream);
    drive_steps(&mut slide, &mut data_b, &stream);

    assert_eq!(reference.stored_pairs(), 2);
    assert_eq!(slide.stored_pairs(), 1);
    // The reused history makes the older pair's span a subset of the newer
    // one's, so folding is exact.
    let probe = DVector::from_row_slice(&[0.3, -1.2, 2.2, 0.0, -0.7, 1.9]);
    let expected = reference.jacobian_action(&probe).unwrap();
    let folded = slide.jacobian_action(&probe).unwrap();
    for (a, e) in folded.iter().zip(expected.iter()) {
        assert_approx_eq_tol(*a, *e, 1e-10);
    }
}

#[test]
fn rs_svd_with_zero_truncation_preserves_the_jacobian_action() {
    let (mut reference, mut data_a) = restart_fixture(RestartMode::Zero, 10);
    let (mut svd, mut data_b) = restart_fixture(RestartMode::Svd, 1);
    let stream = two_step_stream();
    drive_steps(&mut reference, &mut data_a, &stream);
    drive_steps(&mut svd, &mut data_b, &stream);

    assert_eq!(svd.stored_pairs(), 1);
    let probe = DVector::from_row_slice(&[1.0, 0.0, -1.0, 2.0, 0.5, -0.5]);
    let expected = reference.jacobian_action(&probe).unwrap();
    let compressed = svd.jacobian_action(&probe).unwrap();
    for (a, e) in compressed.iter().zip(expected.iter()) {
        assert_approx_eq_tol(*a, *e, 1e-10);
    }
}

#[test]
fn dense_jacobian_matches_the_factor_representation() {
    let (mut chunked, mut data_a) = restart_fixture(RestartMode::Zero, 10);
    let (mut dense, mut data_b) = restart_fixture(RestartMode::NoRestart, 0);
    let stream = two_step_stream();
    drive_steps(&mut chunked, &mut data_a, &stream);
    drive_steps(&mut dense, &mut data_b, &stream);

    let probe = DVector::from_row_slice(&[-1.0, 0.5, 2.0, 1.5, 0.0, -3.0]);
    let from_pairs = chunked.jacobian_action(&probe).unwrap();
    let from_dense = dense.jacobian_action(&probe).unwrap();
    for (a, e) in from_dense.iter().zip(from_pairs.iter()) {
        assert_approx_eq_tol(*a, *e, 1e-10);
    }
}

#[test]
fn rs_ls_restarts_into_a_single_least_squares_pair() {
    let (mut ls, mut data) = restart_fixture(RestartMode::LeastSquares, 1);
    drive_steps(&mut ls, &mut data, &two_step_stream());
    assert_eq!(ls.stored_pairs(), 1);
    // The condensed pair still acts like an inverse-Jacobian approximation:
    // non-zero on a probe inside the retained span.
    let probe = DVector::from_row_slice(&[1.0, -1.0, 2.0, 0.0, 1.0, 0.5]);
    let action = ls.jacobian_action(&probe).unwrap();
    assert!(action.norm() > 0.0);
}
