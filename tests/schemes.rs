//! Two-participant coupling schemes driven end to end on threads.

use nalgebra::DVector;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tandem::Error;
use tandem::actions::{
    READ_ITERATION_CHECKPOINT, WRITE_INITIAL_DATA, WRITE_ITERATION_CHECKPOINT,
};
use tandem::com::ChannelFactory;
use tandem::com::group::GroupComm;
use tandem::m2n::{DistributionKind, M2N};
use tandem::scheme::{
    ConvergenceMeasure, CouplingData, CouplingMode, CouplingScheme, MeasureEntry,
    ParallelCouplingScheme, SchemeCore, SerialCouplingScheme,
};
use tandem::testing::{assert_slices_approx_eq, run_participants};

fn connected_m2n(
    local: &str,
    peer: &str,
    accept: bool,
    vertex_counts: &[(i32, usize)],
    group: &Arc<GroupComm>,
    factory: &ChannelFactory,
) -> anyhow::Result<M2N> {
    let mut m2n = M2N::new(
        local,
        peer,
        DistributionKind::GatherScatter,
        Arc::clone(group),
        factory.clone(),
    );
    if accept {
        m2n.accept_master_connection()?;
    } else {
        m2n.request_master_connection()?;
    }
    for &(mesh_id, count) in vertex_counts {
        m2n.register_mesh(mesh_id, count)?;
    }
    if accept {
        m2n.accept_slaves_connection()?;
    } else {
        m2n.request_slaves_connection()?;
    }
    Ok(m2n)
}

fn shared(values: &[f64]) -> Rc<RefCell<DVector<f64>>> {
    Rc::new(RefCell::new(DVector::from_row_slice(values)))
}

/// Parallel-implicit bootstrap: both sides provide initial data, three
/// min-iteration passes per step, three steps.
#[test]
fn parallel_implicit_initialize_data() {
    let body = |first: bool| {
        move |factory: ChannelFactory| -> anyhow::Result<()> {
            let (local, peer) = if first {
                ("Participant0", "Participant1")
            } else {
                ("Participant1", "Participant0")
            };
            let group = Arc::new(GroupComm::single());
            let m2n = connected_m2n(local, peer, !first, &[(0, 1)], &group, &factory)?;

            let scalar = shared(&[0.0]);
            let vector = shared(&[0.0, 0.0, 0.0]);
            let mut core = SchemeCore::new(
                1.0,
                3,
                0.1,
                "Participant0",
                "Participant1",
                local,
                m2n,
                CouplingMode::Implicit,
                100,
                Arc::clone(&group),
            )?;
            if first {
                core.add_data_to_send(CouplingData::new(Rc::clone(&scalar), 1, true), 0, 0);
                core.add_data_to_receive(CouplingData::new(Rc::clone(&vector), 3, true), 1, 0);
            } else {
                core.add_data_to_send(CouplingData::new(Rc::clone(&vector), 3, true), 1, 0);
                core.add_data_to_receive(CouplingData::new(Rc::clone(&scalar), 1, true), 0, 0);
            }
            core.add_convergence_measure(MeasureEntry::new(
                1,
                false,
                ConvergenceMeasure::MinIterations { count: 3 },
            ));
            core.add_convergence_measure(MeasureEntry::new(
                0,
                false,
                ConvergenceMeasure::MinIterations { count: 3 },
            ));
            let mut scheme = ParallelCouplingScheme::new(core);
            scheme.initialize(0.0, 1)?;

            assert!(scheme.is_action_required(WRITE_INITIAL_DATA));
            if first {
                *scalar.borrow_mut() = DVector::from_row_slice(&[4.0]);
            } else {
                assert_eq!(scalar.borrow()[0], 0.0);
                *vector.borrow_mut() = DVector::from_row_slice(&[1.0, 2.0, 3.0]);
            }
            scheme.performed_action(WRITE_INITIAL_DATA)?;
            scheme.initialize_data()?;
            assert!(scheme.has_data_been_exchanged());
            if first {
                assert_slices_approx_eq(vector.borrow().as_slice(), &[1.0, 2.0, 3.0]);
            } else {
                assert_eq!(scalar.borrow()[0], 4.0);
            }

            let mut advances = 0;
            while scheme.is_coupling_ongoing() {
                if scheme.is_action_required(WRITE_ITERATION_CHECKPOINT) {
                    scheme.performed_action(WRITE_ITERATION_CHECKPOINT)?;
                }
                scheme.add_computed_time(0.1)?;
                scheme.advance()?;
                advances += 1;
                if scheme.is_action_required(READ_ITERATION_CHECKPOINT) {
                    scheme.performed_action(READ_ITERATION_CHECKPOINT)?;
                } else {
                    assert!(scheme.is_coupling_timestep_complete());
                }
            }
            // Three steps of three iterations each.
            assert_eq!(advances, 9);
            assert!((scheme.time() - 0.3).abs() < 1e-12);
            scheme.finalize()?;
            Ok(())
        }
    };
    run_participants(vec![
        Box::new(body(true)) as Box<dyn FnOnce(ChannelFactory) -> anyhow::Result<()> + Send>,
        Box::new(body(false)),
    ]);
}

/// Serial-explicit data flow: what the sender wrote during a step is what
/// the receiver holds after it.
#[test]
fn serial_explicit_exchanges_fresh_data() {
    let steps = 5usize;
    let first = move |factory: ChannelFactory| -> anyhow::Result<()> {
        let group = Arc::new(GroupComm::single());
        let m2n = connected_m2n("A", "B", false, &[(0, 2)], &group, &factory)?;
        let forces = shared(&[0.0, 0.0]);
        let displacements = shared(&[0.0, 0.0]);
        let mut core = SchemeCore::new(
            f64::INFINITY,
            steps,
            1.0,
            "A",
            "B",
            "A",
            m2n,
            CouplingMode::Explicit,
            1,
            Arc::clone(&group),
        )?;
        core.add_data_to_send(CouplingData::new(Rc::clone(&forces), 1, false), 0, 0);
        core.add_data_to_receive(CouplingData::new(Rc::clone(&displacements), 1, false), 1, 0);
        let mut scheme = SerialCouplingScheme::new(core);
        scheme.initialize(0.0, 1)?;
        let mut step = 0.0;
        while scheme.is_coupling_ongoing() {
            step += 1.0;
            *forces.borrow_mut() = DVector::from_row_slice(&[step, -step]);
            scheme.add_computed_time(1.0)?;
            scheme.advance()?;
            assert!(scheme.has_data_been_exchanged());
            // B echoes the forces scaled by ten within the same step.
            assert_slices_approx_eq(displacements.borrow().as_slice(), &[10.0 * step, -10.0 * step]);
        }
        scheme.finalize()?;
        Ok(())
    };
    let second = move |factory: ChannelFactory| -> anyhow::Result<()> {
        let group = Arc::new(GroupComm::single());
        let m2n = connected_m2n("B", "A", true, &[(0, 2)], &group, &factory)?;
        let forces = shared(&[0.0, 0.0]);
        let displacements = shared(&[0.0, 0.0]);
        let mut core = SchemeCore::new(
            f64::INFINITY,
            steps,
            1.0,
            "A",
            "B",
            "B",
            m2n,
            CouplingMode::Explicit,
            1,
            Arc::clone(&group),
        )?;
        core.add_data_to_send(CouplingData::new(Rc::clone(&displacements), 1, false), 1, 0);
        core.add_data_to_receive(CouplingData::new(Rc::clone(&forces), 1, false), 0, 0);
        let mut scheme = SerialCouplingScheme::new(core);
        // The staggered second participant receives A's first step already
        // during initialization.
        scheme.initialize(0.0, 1)?;
        assert!(scheme.has_data_been_exchanged());
        while scheme.is_coupling_ongoing() {
            // Compute with the partner's fresh data.
            let received = forces.borrow().clone_owned();
            assert!(received[0] > 0.0);
            *displacements.borrow_mut() = received * 10.0;
            scheme.add_computed_time(1.0)?;
            scheme.advance()?;
        }
        scheme.finalize()?;
        Ok(())
    };
    run_participants(vec![
        Box::new(first) as Box<dyn FnOnce(ChannelFactory) -> anyhow::Result<()> + Send>,
        Box::new(second),
    ]);
}

/// An unacknowledged required action fails the next advance before any
/// exchange happens.
#[test]
fn missing_checkpoint_acknowledgement_is_a_protocol_error() {
    let body = |first: bool| {
        move |factory: ChannelFactory| -> anyhow::Result<()> {
            let (local, peer) = if first { ("A", "B") } else { ("B", "A") };
            let group = Arc::new(GroupComm::single());
            let m2n = connected_m2n(local, peer, !first, &[(0, 1)], &group, &factory)?;
            let field = shared(&[0.0]);
            let mut core = SchemeCore::new(
                f64::INFINITY,
                2,
                1.0,
                "A",
                "B",
                local,
                m2n,
                CouplingMode::Implicit,
                5,
                Arc::clone(&group),
            )?;
            if first {
                core.add_data_to_send(CouplingData::new(Rc::clone(&field), 1, false), 0, 0);
                core.add_data_to_receive(CouplingData::new(shared(&[0.0]), 1, false), 1, 0);
            } else {
                core.add_data_to_send(CouplingData::new(shared(&[0.0]), 1, false), 1, 0);
                core.add_data_to_receive(CouplingData::new(Rc::clone(&field), 1, false), 0, 0);
            }
            core.add_convergence_measure(MeasureEntry::new(
                0,
                false,
                ConvergenceMeasure::MinIterations { count: 2 },
            ));
            let mut scheme = ParallelCouplingScheme::new(core);
            scheme.initialize(0.0, 1)?;
            assert!(scheme.is_action_required(WRITE_ITERATION_CHECKPOINT));

            scheme.add_computed_time(1.0)?;
            match scheme.advance() {
                Err(Error::Protocol(_)) => {}
                other => panic!("expected a protocol error, got {other:?}"),
            }
            scheme.finalize()?;
            Ok(())
        }
    };
    run_participants(vec![
        Box::new(body(true)) as Box<dyn FnOnce(ChannelFactory) -> anyhow::Result<()> + Send>,
        Box::new(body(false)),
    ]);
}

/// Subcycling: two solver steps per coupling step; nothing is exchanged
/// until the coupling step is full.
#[test]
fn subcycling_exchanges_only_on_full_coupling_steps() {
    let body = |first: bool| {
        move |factory: ChannelFactory| -> anyhow::Result<()> {
            let (local, peer) = if first { ("A", "B") } else { ("B", "A") };
            let group = Arc::new(GroupComm::single());
            let m2n = connected_m2n(local, peer, !first, &[(0, 1)], &group, &factory)?;
            let field = shared(&[0.0]);
            let mut core = SchemeCore::new(
                f64::INFINITY,
                3,
                0.2,
                "A",
                "B",
                local,
                m2n,
                CouplingMode::Explicit,
                1,
                Arc::clone(&group),
            )?;
            if first {
                core.add_data_to_send(CouplingData::new(Rc::clone(&field), 1, false), 0, 0);
                core.add_data_to_receive(CouplingData::new(shared(&[0.0]), 1, false), 1, 0);
            } else {
                core.add_data_to_send(CouplingData::new(shared(&[0.0]), 1, false), 1, 0);
                core.add_data_to_receive(CouplingData::new(Rc::clone(&field), 1, false), 0, 0);
            }
            let mut scheme = ParallelCouplingScheme::new(core);
            scheme.initialize(0.0, 1)?;
            let mut exchanges = 0;
            while scheme.is_coupling_ongoing() {
                assert!(!scheme.will_data_be_exchanged(0.05));
                assert!(scheme.will_data_be_exchanged(0.2));
                // First half of the coupling step.
                scheme.add_computed_time(0.1)?;
                scheme.advance()?;
                assert!(!scheme.has_data_been_exchanged());
                assert!(!scheme.is_coupling_timestep_complete());
                assert!((scheme.next_timestep_max_length() - 0.1).abs() < 1e-12);
                // Second half.
                scheme.add_computed_time(scheme.next_timestep_max_length())?;
                scheme.advance()?;
                assert!(scheme.has_data_been_exchanged());
                assert!(scheme.is_coupling_timestep_complete());
                exchanges += 1;
            }
            assert_eq!(exchanges, 3);
            scheme.finalize()?;
            Ok(())
        }
    };
    run_participants(vec![
        Box::new(body(true)) as Box<dyn FnOnce(ChannelFactory) -> anyhow::Result<()> + Send>,
        Box::new(body(false)),
    ]);
}
