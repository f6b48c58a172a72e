//! Compositions of dummy sub-schemes: the advance/checkpoint cadence for
//! every mix of explicit and implicit members.

use tandem::CouplingScheme;
use tandem::actions::{READ_ITERATION_CHECKPOINT, WRITE_ITERATION_CHECKPOINT};
use tandem::scheme::CompositionalCouplingScheme;
use tandem::testing::DummyCouplingScheme;

fn composition_of(iteration_counts: &[usize]) -> CompositionalCouplingScheme {
    let mut composition = CompositionalCouplingScheme::new();
    for &iterations in iteration_counts {
        composition.add_coupling_scheme(Box::new(DummyCouplingScheme::new(iterations, 10)));
    }
    composition.initialize(0.0, 1).unwrap();
    composition
}

fn run(composition: &mut CompositionalCouplingScheme) -> usize {
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
    }
    composition.finalize().unwrap();
    advances
}

fn timesteps(composition: &CompositionalCouplingScheme, index: usize) -> usize {
    composition.schemes().nth(index).unwrap().timesteps() - 1
}

fn requires(composition: &CompositionalCouplingScheme, index: usize, action: &str) -> bool {
    composition
        .schemes()
        .nth(index)
        .unwrap()
        .is_action_required(action)
}

#[test]
fn one_explicit_scheme() {
    let mut composition = composition_of(&[1]);
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
        // An explicit member never asks for checkpoints.
        assert!(!composition.is_action_required(WRITE_ITERATION_CHECKPOINT));
        assert!(!composition.is_action_required(READ_ITERATION_CHECKPOINT));
    }
    composition.finalize().unwrap();
    assert_eq!(advances, 10);
    assert_eq!(timesteps(&composition, 0), 10);
}

#[test]
fn one_implicit_scheme() {
    let mut composition = composition_of(&[2]);
    let advances = run(&mut composition);
    assert_eq!(advances, 20);
    assert_eq!(timesteps(&composition, 0), 10);
}

#[test]
fn two_explicit_schemes() {
    let mut composition = composition_of(&[1, 1]);
    let advances = run(&mut composition);
    assert_eq!(advances, 10);
    assert_eq!(timesteps(&composition, 0), 10);
    assert_eq!(timesteps(&composition, 1), 10);
}

#[test]
fn three_explicit_schemes() {
    let mut composition = composition_of(&[1, 1, 1]);
    let advances = run(&mut composition);
    assert_eq!(advances, 10);
    for index in 0..3 {
        assert_eq!(timesteps(&composition, index), 10);
    }
}

#[test]
fn two_implicit_schemes() {
    let mut composition = composition_of(&[2, 2]);
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
        if advances % 2 == 1 {
            assert!(requires(&composition, 0, READ_ITERATION_CHECKPOINT));
            assert!(requires(&composition, 1, READ_ITERATION_CHECKPOINT));
        } else {
            assert!(requires(&composition, 0, WRITE_ITERATION_CHECKPOINT));
            assert!(requires(&composition, 1, WRITE_ITERATION_CHECKPOINT));
        }
    }
    composition.finalize().unwrap();
    assert_eq!(advances, 20);
    assert_eq!(timesteps(&composition, 0), 10);
    assert_eq!(timesteps(&composition, 1), 10);
}

#[test]
fn two_implicit_schemes_with_different_iterations() {
    let mut composition = composition_of(&[2, 3]);
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
        match advances % 3 {
            1 => {
                assert!(requires(&composition, 0, READ_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 1, READ_ITERATION_CHECKPOINT));
            }
            2 => {
                assert!(requires(&composition, 0, WRITE_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 1, READ_ITERATION_CHECKPOINT));
            }
            _ => {
                assert!(requires(&composition, 0, WRITE_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 1, WRITE_ITERATION_CHECKPOINT));
            }
        }
    }
    composition.finalize().unwrap();
    assert_eq!(advances, 30);
    assert_eq!(timesteps(&composition, 0), 10);
    assert_eq!(timesteps(&composition, 1), 10);
}

#[test]
fn three_implicit_schemes() {
    let mut composition = composition_of(&[2, 2, 2]);
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
        let action = if advances % 2 == 0 {
            WRITE_ITERATION_CHECKPOINT
        } else {
            READ_ITERATION_CHECKPOINT
        };
        for index in 0..3 {
            assert!(requires(&composition, index, action));
        }
    }
    composition.finalize().unwrap();
    assert_eq!(advances, 20);
}

#[test]
fn three_implicit_schemes_with_different_iterations() {
    let mut composition = composition_of(&[3, 4, 2]);
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
        match advances % 4 {
            0 => {
                assert!(requires(&composition, 0, WRITE_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 1, WRITE_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 2, WRITE_ITERATION_CHECKPOINT));
            }
            1 => {
                assert!(requires(&composition, 0, READ_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 1, READ_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 2, READ_ITERATION_CHECKPOINT));
            }
            2 => {
                assert!(requires(&composition, 0, READ_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 1, READ_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 2, WRITE_ITERATION_CHECKPOINT));
            }
            _ => {
                assert!(requires(&composition, 0, WRITE_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 1, READ_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 2, WRITE_ITERATION_CHECKPOINT));
            }
        }
    }
    composition.finalize().unwrap();
    assert_eq!(advances, 40);
    for index in 0..3 {
        assert_eq!(timesteps(&composition, index), 10);
    }
}

#[test]
fn explicit_then_implicit() {
    let mut composition = composition_of(&[1, 2]);
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
        if advances % 2 == 0 {
            assert!(requires(&composition, 1, WRITE_ITERATION_CHECKPOINT));
            assert_eq!(timesteps(&composition, 0), advances / 2);
        } else {
            assert!(requires(&composition, 1, READ_ITERATION_CHECKPOINT));
            // The explicit member has already advanced its step while the
            // implicit one starts iterating.
            assert_eq!(timesteps(&composition, 0), (advances + 1) / 2);
        }
    }
    composition.finalize().unwrap();
    assert_eq!(advances, 20);
    assert_eq!(timesteps(&composition, 0), 10);
    assert_eq!(timesteps(&composition, 1), 10);
}

#[test]
fn implicit_then_explicit() {
    let mut composition = composition_of(&[2, 1]);
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
        if advances % 2 == 0 {
            assert!(requires(&composition, 0, WRITE_ITERATION_CHECKPOINT));
            assert_eq!(timesteps(&composition, 0), advances / 2);
        } else {
            assert!(requires(&composition, 0, READ_ITERATION_CHECKPOINT));
            // The explicit member waits behind the iterating implicit one.
            assert_eq!(timesteps(&composition, 0), (advances - 1) / 2);
        }
    }
    composition.finalize().unwrap();
    assert_eq!(advances, 20);
    assert_eq!(timesteps(&composition, 0), 10);
    assert_eq!(timesteps(&composition, 1), 10);
}

#[test]
fn explicit_then_implicit_with_three_iterations() {
    let mut composition = composition_of(&[1, 3]);
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
        if advances % 3 == 0 {
            assert!(requires(&composition, 1, WRITE_ITERATION_CHECKPOINT));
            assert_eq!(timesteps(&composition, 0), advances / 3);
        } else {
            assert!(requires(&composition, 1, READ_ITERATION_CHECKPOINT));
            assert_eq!(timesteps(&composition, 0), (advances + (3 - advances % 3)) / 3);
        }
    }
    composition.finalize().unwrap();
    assert_eq!(advances, 30);
    assert_eq!(timesteps(&composition, 0), 10);
    assert_eq!(timesteps(&composition, 1), 10);
}

#[test]
fn implicit_with_three_iterations_then_explicit() {
    let mut composition = composition_of(&[3, 1]);
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
        if advances % 3 == 0 {
            assert!(requires(&composition, 0, WRITE_ITERATION_CHECKPOINT));
            assert_eq!(timesteps(&composition, 0), advances / 3);
        } else {
            assert!(requires(&composition, 0, READ_ITERATION_CHECKPOINT));
            assert_eq!(timesteps(&composition, 0), (advances - advances % 3) / 3);
        }
    }
    composition.finalize().unwrap();
    assert_eq!(advances, 30);
    assert_eq!(timesteps(&composition, 0), 10);
    assert_eq!(timesteps(&composition, 1), 10);
}

#[test]
fn explicit_then_two_implicit() {
    let mut composition = composition_of(&[1, 2, 2]);
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
        if advances % 2 == 0 {
            assert!(requires(&composition, 1, WRITE_ITERATION_CHECKPOINT));
            assert!(requires(&composition, 2, WRITE_ITERATION_CHECKPOINT));
            assert_eq!(timesteps(&composition, 0), advances / 2);
        } else {
            assert!(requires(&composition, 1, READ_ITERATION_CHECKPOINT));
            assert!(requires(&composition, 2, READ_ITERATION_CHECKPOINT));
            assert_eq!(timesteps(&composition, 0), (advances + 1) / 2);
        }
    }
    composition.finalize().unwrap();
    assert_eq!(advances, 20);
    for index in 0..3 {
        assert_eq!(timesteps(&composition, index), 10);
    }
}

#[test]
fn explicit_then_implicit_two_and_three_iterations() {
    let mut composition = composition_of(&[1, 2, 3]);
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
        match advances % 3 {
            0 => {
                assert_eq!(timesteps(&composition, 0), advances / 3);
                assert!(requires(&composition, 1, WRITE_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 2, WRITE_ITERATION_CHECKPOINT));
            }
            1 => {
                assert!(requires(&composition, 1, READ_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 2, READ_ITERATION_CHECKPOINT));
                assert_eq!(timesteps(&composition, 0), (advances + 2) / 3);
            }
            _ => {
                assert!(requires(&composition, 1, WRITE_ITERATION_CHECKPOINT));
                assert!(requires(&composition, 2, READ_ITERATION_CHECKPOINT));
                assert_eq!(timesteps(&composition, 0), (advances + 1) / 3);
            }
        }
    }
    composition.finalize().unwrap();
    assert_eq!(advances, 30);
    for index in 0..3 {
        assert_eq!(timesteps(&composition, index), 10);
    }
}

#[test]
fn two_implicit_then_explicit() {
    let mut composition = composition_of(&[2, 2, 1]);
    let mut advances = 0;
    while composition.is_coupling_ongoing() {
        composition.advance().unwrap();
        advances += 1;
        if advances % 2 == 0 {
            assert!(requires(&composition, 0, WRITE_ITERATION_CHECKPOINT));
            assert!(requires(&composition, 1, WRITE_ITERATION_CHECKPOINT));
            for index in 0..3 {
                assert_eq!(timesteps(&composition, index), advances / 2);
            }
        } else {
            assert!(requires(&composition, 0, READ_ITERATION_CHECKPOINT));
            assert!(requires(&composition, 1, READ_ITERATION_CHECKPOINT));
            for index in 0..3 {
                assert_eq!(timesteps(&composition, index), (advances - 1) / 2);
            }
        }
    }
    composition.finalize().unwrap();
    assert_eq!(advances, 20);
    for index in 0..3 {
        assert_eq!(timesteps(&composition, index), 10);
    }
}
