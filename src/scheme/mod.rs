//! Coupling schemes: the state machines that drive the coupled simulation.
//!
//! A coupling scheme decides when each participant sends and receives data,
//! whether an implicit iteration has converged, and when a coupling time
//! step is complete. The solver drives it through a small protocol:
//!
//! ```text
//! initialize(t0, 1)
//! [write initial data, initialize_data()]
//! while is_coupling_ongoing():
//!     [perform required checkpoint actions]
//!     add_computed_time(dt)
//!     advance()
//! finalize()
//! ```
//!
//! Between `advance` calls the scheme may require actions from the solver
//! (writing or reading an iteration checkpoint); failing to acknowledge a
//! required action fails the next `advance` with a protocol error.
//!
//! Four concrete schemes exist: [`SerialCouplingScheme`] (staggered),
//! [`ParallelCouplingScheme`] (Jacobi), [`MultiCouplingScheme`] (a
//! controller coupled with several partners), and
//! [`CompositionalCouplingScheme`] (a list of sub-schemes driven as one).

pub mod base;
pub mod composition;
pub mod convergence;
pub mod data;
pub mod multi;
pub mod parallel;
pub mod serial;

pub use base::{CouplingMode, Exchange, SchemeCore};
pub use composition::CompositionalCouplingScheme;
pub use convergence::{ConvergenceMeasure, MeasureEntry, combined_verdict};
pub use data::{CouplingData, DataMap};
pub use multi::{MultiCouplingScheme, PartnerLink};
pub use parallel::ParallelCouplingScheme;
pub use serial::SerialCouplingScheme;

use crate::error::Result;

/// The operations every coupling scheme offers to the solver.
pub trait CouplingScheme {
    /// Set up data structures and, where the scheme demands it, perform the
    /// first data exchange. May block on the partner.
    fn initialize(&mut self, start_time: f64, start_timestep: usize) -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// Exchange user-provided initial data. Must be called between
    /// `initialize` and the first `advance` whenever an exchange is
    /// configured with initialization.
    fn initialize_data(&mut self) -> Result<()>;

    /// Account solver progress within the current coupling step.
    fn add_computed_time(&mut self, dt: f64) -> Result<()>;

    /// Exchange data, evaluate convergence, and either complete the step or
    /// demand another iteration. May block on the partner.
    fn advance(&mut self) -> Result<()>;

    /// Close all channels. Safe to call after errors.
    fn finalize(&mut self) -> Result<()>;

    fn is_coupling_ongoing(&self) -> bool;

    fn is_coupling_timestep_complete(&self) -> bool;

    fn has_data_been_exchanged(&self) -> bool;

    fn is_action_required(&self, action: &str) -> bool;

    /// Acknowledge a required action.
    fn performed_action(&mut self, action: &str) -> Result<()>;

    fn time(&self) -> f64;

    /// The current coupling step number; starts at the value handed to
    /// `initialize` and increments per completed step.
    fn timesteps(&self) -> usize;

    /// Upper bound for the solver's next time-step length.
    fn next_timestep_max_length(&self) -> f64;

    /// Whether data will be exchanged if the solver computes the given
    /// remaining step length.
    fn will_data_be_exchanged(&self, last_solver_dt: f64) -> bool;
}
