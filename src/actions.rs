//! Names of the actions a solver may be required to perform between
//! `advance` calls.
//!
//! A scheme declares a required action by token; the solver performs it and
//! acknowledges with `fulfilled_action`. An unacknowledged required action
//! fails the next `advance` with a protocol error.

/// The solver must write its initial coupling data before `initialize_data`.
pub const WRITE_INITIAL_DATA: &str = "write-initial-data";

/// The solver must save a checkpoint of its own state; the coupling step may
/// be repeated from here.
pub const WRITE_ITERATION_CHECKPOINT: &str = "write-iteration-checkpoint";

/// The coupling iteration did not converge; the solver must restore the last
/// checkpoint and recompute the step.
pub const READ_ITERATION_CHECKPOINT: &str = "read-iteration-checkpoint";

/// All action names understood by the library.
pub const ALL: [&str; 3] = [
    WRITE_INITIAL_DATA,
    WRITE_ITERATION_CHECKPOINT,
    READ_ITERATION_CHECKPOINT,
];
