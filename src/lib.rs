//! # Tandem
//!
//! A **coupling library** for partitioned multi-physics simulations. Two or
//! more independently written solvers (say, a fluid and a structure code)
//! keep their own time stepping and exchange boundary data through Tandem at
//! mesh interfaces: each solver process calls the library in-process to
//! declare its interface meshes and data fields, drive a coupling scheme,
//! and obtain the partner's values.
//!
//! ## Key Features
//!
//! - **Coupling schemes** - serial (staggered), parallel (Jacobi), multi
//!   (one controller, many partners), and compositions of several schemes
//! - **Implicit iteration** - per-field convergence measures, iteration
//!   checkpoint actions, subcycling
//! - **Quasi-Newton acceleration** - IQN-ILS and IQN-IMVJ with restart
//!   strategies, plus constant, Aitken, and hierarchical Aitken relaxation
//! - **Block preconditioning** - constant, value, residual, and residual-sum
//!   weighting of the coupled fields
//! - **Parallel participants** - master/slave process groups, gather-scatter
//!   or point-to-point data paths between them, and a cyclic slave ring for
//!   distributed Jacobian products
//! - **Transport-agnostic channels** - in-process for single-launcher runs
//!   and tests, TCP with address publication across jobs
//!
//! ## Quick Start
//!
//! ```no_run
//! use tandem::{CouplingInterface, com::ChannelFactory};
//! use tandem::actions::{READ_ITERATION_CHECKPOINT, WRITE_ITERATION_CHECKPOINT};
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let factory = ChannelFactory::Sockets("./exchange".into());
//! let mut tandem = CouplingInterface::new("Fluid", 0, 1, factory);
//! tandem.configure("coupling.xml")?;
//!
//! let mesh = tandem.mesh_id("Surface")?;
//! tandem.set_mesh_vertices(mesh, &[0.0, 0.0, 1.0, 0.0])?;
//! let forces = tandem.data_id("Forces", mesh)?;
//! let displacements = tandem.data_id("Displacements", mesh)?;
//!
//! let mut dt = tandem.initialize()?;
//! let mut state = 0.0;
//! let mut checkpoint = state;
//! while tandem.is_coupling_ongoing() {
//!     if tandem.is_action_required(WRITE_ITERATION_CHECKPOINT) {
//!         checkpoint = state;
//!         tandem.fulfilled_action(WRITE_ITERATION_CHECKPOINT)?;
//!     }
//!     let d = tandem.read_block_vector_data(displacements, &[0, 1])?;
//!     state = solve_own_physics(dt, &d);
//!     tandem.write_block_vector_data(forces, &[0, 1], &forces_of(state))?;
//!     dt = tandem.advance(dt)?;
//!     if tandem.is_action_required(READ_ITERATION_CHECKPOINT) {
//!         state = checkpoint;
//!         tandem.fulfilled_action(READ_ITERATION_CHECKPOINT)?;
//!     }
//! }
//! tandem.finalize()?;
//! # Ok(())
//! # }
//! # fn solve_own_physics(_dt: f64, _d: &[f64]) -> f64 { 0.0 }
//! # fn forces_of(_state: f64) -> Vec<f64> { vec![0.0; 4] }
//! ```
//!
//! ## Core Concepts
//!
//! ### Participants and groups
//!
//! Each solver is a *participant* running as one or more processes; one rank
//! per group is the master and anchors the collectives. A size-one group
//! behaves exactly like a serial solver.
//!
//! ### Coupling schemes
//!
//! A [`scheme::CouplingScheme`] is a state machine around the solver loop:
//! it exchanges data through [`m2n::M2N`] channels, evaluates convergence
//! measures, and tells the solver what to do next through named *actions*
//! (write or read an iteration checkpoint, write initial data).
//!
//! ### Acceleration
//!
//! Implicit couplings are fixed-point iterations; the [`accel`] module
//! improves their convergence with relaxation or quasi-Newton methods that
//! approximate the inverse Jacobian of the coupling residual from the
//! history of iterates.
//!
//! ## Module Overview
//!
//! - [`interface`] - the solver-facing facade
//! - [`scheme`] - coupling schemes, coupling data, convergence measures
//! - [`accel`] - relaxation and quasi-Newton acceleration
//! - [`m2n`] - participant-to-participant data channels
//! - [`com`] - point-to-point channels, group collectives, the slave ring
//! - [`mesh`] - the consumed mesh handle
//! - [`config`] - the XML configuration surface
//! - [`testing`] - assertions and harnesses for coupled tests

pub mod accel;
pub mod actions;
pub mod com;
pub mod config;
pub mod error;
pub mod interface;
pub mod m2n;
pub mod mesh;
pub mod scheme;
pub mod testing;

// General re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use interface::CouplingInterface;
pub use mesh::{DataId, Mesh, MeshId, VertexId};
pub use scheme::{CompositionalCouplingScheme, CouplingScheme};
