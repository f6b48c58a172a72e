//! Acceleration of the implicit coupling iteration.
//!
//! After every iteration of an implicit scheme, the acceleration transforms
//! the solver's latest iterate in place, using the history of residuals and
//! iterate differences from earlier iterations and time steps. The variants
//! form a closed set, from plain under-relaxation to the two quasi-Newton
//! methods:
//!
//! | Variant | Idea |
//! |---|---|
//! | [`ConstantRelaxation`] | fixed blend with the previous iterate |
//! | [`AitkenRelaxation`] | secant-based dynamic relaxation factor |
//! | [`HierarchicalAitken`] | level-wise Aitken on a binary hierarchy |
//! | [`IqnIls`] | least-squares inverse-Jacobian from the residual history |
//! | [`Imvj`] | multi-vector inverse-Jacobian carried across time steps |
//!
//! All variants share the first-iteration rule: the very first iterate of a
//! simulation is always plain under-relaxation with the configured initial
//! factor, whatever the method.

pub mod aitken;
pub mod constant;
pub mod hierarchical;
pub mod imvj;
pub mod iqn_ils;
pub mod parmat;
pub mod preconditioner;
pub mod qn;
pub mod qr;
pub mod svd;

pub use aitken::AitkenRelaxation;
pub use constant::ConstantRelaxation;
pub use hierarchical::HierarchicalAitken;
pub use imvj::{Imvj, RestartMode};
pub use iqn_ils::IqnIls;
pub use preconditioner::{Preconditioner, Weighting};
pub use qn::{Filter, QnCore};
pub use svd::TruncatedSvd;

use crate::error::Result;
use crate::mesh::DataId;
use crate::scheme::data::DataMap;
use nalgebra::DVector;

/// One of the closed set of acceleration methods.
pub enum Acceleration {
    Constant(ConstantRelaxation),
    Aitken(AitkenRelaxation),
    HierarchicalAitken(HierarchicalAitken),
    IqnIls(IqnIls),
    Imvj(Imvj),
}

impl Acceleration {
    /// The primary data fields this acceleration drives.
    pub fn data_ids(&self) -> &[DataId] {
        match self {
            Acceleration::Constant(a) => a.data_ids(),
            Acceleration::Aitken(a) => a.data_ids(),
            Acceleration::HierarchicalAitken(a) => a.data_ids(),
            Acceleration::IqnIls(a) => a.data_ids(),
            Acceleration::Imvj(a) => a.data_ids(),
        }
    }

    /// Size internal state to the coupled data. Called once, before the
    /// first iteration.
    pub fn initialize(&mut self, data: &mut DataMap) -> Result<()> {
        match self {
            Acceleration::Constant(a) => a.initialize(data),
            Acceleration::Aitken(a) => a.initialize(data),
            Acceleration::HierarchicalAitken(a) => a.initialize(data),
            Acceleration::IqnIls(a) => a.initialize(data),
            Acceleration::Imvj(a) => a.initialize(data),
        }
    }

    /// Transform the current iterate in place.
    pub fn perform(&mut self, data: &mut DataMap) -> Result<()> {
        match self {
            Acceleration::Constant(a) => a.perform(data),
            Acceleration::Aitken(a) => a.perform(data),
            Acceleration::HierarchicalAitken(a) => a.perform(data),
            Acceleration::IqnIls(a) => a.perform(data),
            Acceleration::Imvj(a) => a.perform(data),
        }
    }

    /// The scheme declared the current time step converged.
    pub fn iterations_converged(&mut self, data: &mut DataMap) -> Result<()> {
        match self {
            Acceleration::Constant(a) => a.iterations_converged(data),
            Acceleration::Aitken(a) => a.iterations_converged(data),
            Acceleration::HierarchicalAitken(a) => a.iterations_converged(data),
            Acceleration::IqnIls(a) => a.iterations_converged(data),
            Acceleration::Imvj(a) => a.iterations_converged(data),
        }
    }

    /// A non-zero design specification is not supported by any variant;
    /// zero is accepted everywhere so the call sites stay uniform.
    pub fn set_design_specification(&mut self, q: &DVector<f64>) -> Result<()> {
        match self {
            Acceleration::Constant(a) => a.set_design_specification(q),
            Acceleration::Aitken(a) => a.set_design_specification(q),
            Acceleration::HierarchicalAitken(a) => a.set_design_specification(q),
            Acceleration::IqnIls(a) => a.set_design_specification(q),
            Acceleration::Imvj(a) => a.set_design_specification(q),
        }
    }

    /// Release transport resources (the multi-vector ring). Idempotent.
    pub fn close(&mut self) {
        if let Acceleration::Imvj(a) = self {
            a.close();
        }
    }
}
