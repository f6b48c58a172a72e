//! Convergence measures for implicit coupling iterations.
//!
//! A measure is a predicate over the previous and current iterate of one
//! coupled field. All norms are globally reduced over the participant group,
//! so every rank arrives at the same verdict without an extra broadcast.

use crate::com::group::GroupComm;
use crate::error::Result;
use crate::mesh::DataId;
use nalgebra::DVector;
use tracing::debug;

/// The measure variants, a closed set.
#[derive(Clone, Debug, PartialEq)]
pub enum ConvergenceMeasure {
    /// `‖new − old‖₂ < limit`.
    Absolute { limit: f64 },
    /// `‖new − old‖₂ / ‖new‖₂ < limit`.
    Relative { limit: f64 },
    /// `‖new − old‖₂ / ‖new − old at iteration 1‖₂ < limit`.
    ResidualRelative { limit: f64 },
    /// Passes once the iteration counter reaches the given count.
    MinIterations { count: usize },
}

/// One configured measure bound to a data field.
pub struct MeasureEntry {
    pub data_id: DataId,
    /// A passing `suffices` measure can conclude the verdict on its own
    /// (see [`combined_verdict`]).
    pub suffices: bool,
    pub measure: ConvergenceMeasure,
    first_residual_norm: Option<f64>,
    pub converged: bool,
    pub last_norm: f64,
}

impl MeasureEntry {
    pub fn new(data_id: DataId, suffices: bool, measure: ConvergenceMeasure) -> Self {
        Self {
            data_id,
            suffices,
            measure,
            first_residual_norm: None,
            converged: false,
            last_norm: 0.0,
        }
    }

    /// Evaluate the predicate for the current iteration.
    pub fn measure(
        &mut self,
        old: &DVector<f64>,
        new: &DVector<f64>,
        iteration: usize,
        group: &GroupComm,
    ) -> Result<()> {
        let difference = new - old;
        let norm = group.l2_norm(&difference)?;
        self.last_norm = norm;
        self.converged = match self.measure {
            ConvergenceMeasure::Absolute { limit } => norm < limit,
            ConvergenceMeasure::Relative { limit } => {
                let new_norm = group.l2_norm(new)?;
                new_norm > 0.0 && norm / new_norm < limit
            }
            ConvergenceMeasure::ResidualRelative { limit } => {
                let first = *self.first_residual_norm.get_or_insert(norm);
                first > 0.0 && norm / first < limit
            }
            ConvergenceMeasure::MinIterations { count } => iteration >= count,
        };
        debug!(
            data = self.data_id,
            norm,
            converged = self.converged,
            "convergence measure"
        );
        Ok(())
    }

    /// Forget per-step state when a new time step starts.
    pub fn new_timestep(&mut self) {
        self.first_residual_norm = None;
        self.converged = false;
        self.last_norm = 0.0;
    }
}

/// Combine the individual verdicts: every non-`suffices` measure must pass,
/// and when any `suffices` measures exist, at least one of them must pass
/// as well.
pub fn combined_verdict(entries: &[MeasureEntry]) -> bool {
    let strict_ok = entries
        .iter()
        .filter(|e| !e.suffices)
        .all(|e| e.converged);
    let any_suffices = entries.iter().any(|e| e.suffices);
    let suffices_ok = !any_suffices || entries.iter().any(|e| e.suffices && e.converged);
    strict_ok && suffices_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> GroupComm {
        GroupComm::single()
    }

    fn vec(values: &[f64]) -> DVector<f64> {
        DVector::from_row_slice(values)
    }

    #[test]
    fn absolute_measure_compares_the_difference_norm() {
        let mut m = MeasureEntry::new(0, false, ConvergenceMeasure::Absolute { limit: 0.5 });
        m.measure(&vec(&[1.0, 1.0]), &vec(&[1.1, 1.2]), 1, &local()).unwrap();
        assert!(m.converged);
        m.measure(&vec(&[0.0, 0.0]), &vec(&[1.0, 0.0]), 2, &local()).unwrap();
        assert!(!m.converged);
    }

    #[test]
    fn residual_relative_measure_normalizes_by_the_first_iteration() {
        let mut m =
            MeasureEntry::new(0, false, ConvergenceMeasure::ResidualRelative { limit: 0.1 });
        m.measure(&vec(&[0.0]), &vec(&[10.0]), 1, &local()).unwrap();
        assert!(!m.converged); // ratio is 1 on the first iteration
        m.measure(&vec(&[0.0]), &vec(&[0.5]), 2, &local()).unwrap();
        assert!(m.converged); // 0.5 / 10 < 0.1
        m.new_timestep();
        m.measure(&vec(&[0.0]), &vec(&[0.5]), 1, &local()).unwrap();
        assert!(!m.converged); // baseline reset
    }

    #[test]
    fn min_iterations_counts_iterations_not_norms() {
        let mut m = MeasureEntry::new(0, false, ConvergenceMeasure::MinIterations { count: 3 });
        m.measure(&vec(&[0.0]), &vec(&[100.0]), 2, &local()).unwrap();
        assert!(!m.converged);
        m.measure(&vec(&[0.0]), &vec(&[100.0]), 3, &local()).unwrap();
        assert!(m.converged);
    }

    #[test]
    fn verdict_combines_strict_and_suffices_measures() {
        let mut strict = MeasureEntry::new(0, false, ConvergenceMeasure::Absolute { limit: 1.0 });
        let mut lenient = MeasureEntry::new(1, true, ConvergenceMeasure::Absolute { limit: 1.0 });
        let g = local();
        strict.measure(&vec(&[0.0]), &vec(&[0.5]), 1, &g).unwrap();
        lenient.measure(&vec(&[0.0]), &vec(&[2.0]), 1, &g).unwrap();
        // Strict passes, but the suffices set exists and none of it passed.
        assert!(!combined_verdict(&[strict, lenient]));

        let mut strict = MeasureEntry::new(0, false, ConvergenceMeasure::Absolute { limit: 1.0 });
        let mut lenient = MeasureEntry::new(1, true, ConvergenceMeasure::Absolute { limit: 1.0 });
        strict.measure(&vec(&[0.0]), &vec(&[0.5]), 1, &g).unwrap();
        lenient.measure(&vec(&[0.0]), &vec(&[0.5]), 1, &g).unwrap();
        assert!(combined_verdict(&[strict, lenient]));
    }
}
