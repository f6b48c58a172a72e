//! Utilities for testing coupled setups.
//!
//! Coupled behavior needs at least two participants running at once; the
//! [`run_participants`] harness spawns one thread per participant, hands
//! each a channel factory wired to one shared in-process hub, and fails the
//! test if any participant errors or panics. Numeric assertions compare with
//! the tolerance used throughout the coupling tests, and
//! [`DummyCouplingScheme`] stands in for a real scheme when only the
//! composition logic is under test.

use crate::actions;
use crate::com::ChannelFactory;
use crate::com::direct::Hub;
use crate::error::Result;
use crate::scheme::CouplingScheme;
use std::sync::Arc;
use std::thread;

/// Tolerance of [`assert_approx_eq`]; matched to double-precision coupling
/// arithmetic with a little slack for reductions.
pub const NUMERICAL_TOLERANCE: f64 = 1e-13;

/// Assert that two floats agree within [`NUMERICAL_TOLERANCE`].
///
/// # Panics
///
/// Panics with both values and their difference if they disagree.
pub fn assert_approx_eq(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() <= NUMERICAL_TOLERANCE,
        "value mismatch:\n  expected: {expected:?}\n  actual:   {actual:?}\n  difference: {:?}",
        actual - expected
    );
}

/// Assert element-wise approximate equality of two slices.
///
/// # Panics
///
/// Panics on a length mismatch or any element pair out of tolerance.
pub fn assert_slices_approx_eq(actual: &[f64], expected: &[f64]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch:\n  expected: {expected:?}\n  actual:   {actual:?}"
    );
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= NUMERICAL_TOLERANCE,
            "mismatch at index {i}:\n  expected: {e:?}\n  actual:   {a:?}\n  full expected: {expected:?}\n  full actual:   {actual:?}"
        );
    }
}

/// Like [`assert_approx_eq`] with a caller-chosen tolerance.
pub fn assert_approx_eq_tol(actual: f64, expected: f64, tolerance: f64) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "value mismatch:\n  expected: {expected:?}\n  actual:   {actual:?}\n  tolerance: {tolerance:?}"
    );
}

/// Run one closure per participant, each on its own thread, sharing one
/// in-process hub. Panics and errors of any participant fail the call.
pub fn run_participants<F>(participants: Vec<F>)
where
    F: FnOnce(ChannelFactory) -> anyhow::Result<()> + Send + 'static,
{
    let hub = Hub::new();
    let handles: Vec<_> = participants
        .into_iter()
        .enumerate()
        .map(|(index, run)| {
            let factory = ChannelFactory::Direct(Arc::clone(&hub));
            thread::Builder::new()
                .name(format!("participant-{index}"))
                .spawn(move || run(factory))
                .expect("spawning a participant thread")
        })
        .collect();
    let mut failures = Vec::new();
    for (index, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => failures.push(format!("participant {index} failed: {err:#}")),
            Err(_) => failures.push(format!("participant {index} panicked")),
        }
    }
    assert!(failures.is_empty(), "{}", failures.join("\n"));
}

/// A stand-in scheme with a fixed iteration count per step. One iteration
/// models an explicit scheme, more an implicit one. Only the composition
/// logic looks at it; it moves no data.
pub struct DummyCouplingScheme {
    number_iterations: usize,
    max_timesteps: usize,
    iterations: usize,
    timesteps: usize,
    initialized: bool,
    ongoing: bool,
}

impl DummyCouplingScheme {
    pub fn new(number_iterations: usize, max_timesteps: usize) -> Self {
        Self {
            number_iterations,
            max_timesteps,
            iterations: 0,
            timesteps: 0,
            initialized: false,
            ongoing: false,
        }
    }
}

impl CouplingScheme for DummyCouplingScheme {
    fn initialize(&mut self, _start_time: f64, start_timestep: usize) -> Result<()> {
        self.timesteps = start_timestep;
        self.initialized = true;
        self.ongoing = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn initialize_data(&mut self) -> Result<()> {
        Ok(())
    }

    fn add_computed_time(&mut self, _dt: f64) -> Result<()> {
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        assert!(self.initialized && self.ongoing);
        self.iterations += 1;
        if self.iterations == self.number_iterations {
            if self.timesteps == self.max_timesteps {
                self.ongoing = false;
            }
            self.timesteps += 1;
            self.iterations = 0;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_coupling_ongoing(&self) -> bool {
        self.ongoing
    }

    fn is_coupling_timestep_complete(&self) -> bool {
        self.iterations == 0
    }

    fn has_data_been_exchanged(&self) -> bool {
        false
    }

    fn is_action_required(&self, action: &str) -> bool {
        if self.number_iterations > 1 {
            if action == actions::WRITE_ITERATION_CHECKPOINT {
                return self.iterations == 0;
            }
            if action == actions::READ_ITERATION_CHECKPOINT {
                return self.iterations != 0;
            }
        }
        false
    }

    fn performed_action(&mut self, _action: &str) -> Result<()> {
        Ok(())
    }

    fn time(&self) -> f64 {
        0.0
    }

    fn timesteps(&self) -> usize {
        self.timesteps
    }

    fn next_timestep_max_length(&self) -> f64 {
        1.0
    }

    fn will_data_be_exchanged(&self, _last_solver_dt: f64) -> bool {
        true
    }
}
