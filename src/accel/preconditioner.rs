//! Row scaling of the quasi-Newton system.
//!
//! Coupled fields can differ by many orders of magnitude (pressures against
//! displacements), which skews the least-squares system. The preconditioner
//! assigns one weight per sub-vector (one coupled field); `apply` takes
//! physical values to balanced values, `revert` takes them back. Weights may
//! be refreshed per iteration or per completed time step depending on the
//! variant, and freeze permanently after a configurable number of
//! non-constant time steps. Whenever the weights change, the QR decomposition
//! of the scaled history matrix has to be rebuilt; [`Preconditioner::requires_new_qr`]
//! reports that.

use crate::com::group::GroupComm;
use crate::error::{Error, Result};
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;
use tracing::debug;

/// How the per-field weights are derived.
#[derive(Clone, Debug, PartialEq)]
pub enum Weighting {
    /// User-given factors; `w_k = 1 / factor_k`, frozen from the start.
    Constant { factors: Vec<f64> },
    /// `w_k = 1 / ‖x_k‖∞` from the current values, refreshed on every
    /// completed time step.
    Value,
    /// `w_k = 1 / ‖r_k‖∞` from the current residual, refreshed on every
    /// iteration.
    Residual,
    /// Running sum of `‖r_k‖₂²` per field, square-rooted into the weight.
    /// Robust when the residual collapses over the iterations.
    ResidualSum,
}

/// Sub-vector scaling with freeze bookkeeping.
pub struct Preconditioner {
    weighting: Weighting,
    weights: Vec<f64>,
    inv_weights: Vec<f64>,
    sub_sizes: Vec<usize>,
    /// After this many completed steps with changing weights the
    /// preconditioner freezes; -1 means it never does.
    max_non_const_timesteps: i64,
    non_const_timesteps: i64,
    frozen: bool,
    require_new_qr: bool,
    residual_sums: Vec<f64>,
    group: Arc<GroupComm>,
}

impl Preconditioner {
    pub fn new(weighting: Weighting, max_non_const_timesteps: i64, group: Arc<GroupComm>) -> Self {
        Self {
            weighting,
            weights: Vec::new(),
            inv_weights: Vec::new(),
            sub_sizes: Vec::new(),
            max_non_const_timesteps,
            non_const_timesteps: 0,
            frozen: false,
            require_new_qr: false,
            residual_sums: Vec::new(),
            group,
        }
    }

    /// Size the weights once the sub-vector layout is known.
    pub fn initialize(&mut self, sub_sizes: Vec<usize>) -> Result<()> {
        let n: usize = sub_sizes.iter().sum();
        self.weights = vec![1.0; n];
        self.inv_weights = vec![1.0; n];
        self.residual_sums = vec![0.0; sub_sizes.len()];
        if let Weighting::Constant { factors } = &self.weighting {
            if factors.len() != sub_sizes.len() {
                return Err(Error::config(format!(
                    "constant preconditioner has {} factors for {} coupled fields",
                    factors.len(),
                    sub_sizes.len()
                )));
            }
            let mut offset = 0;
            for (k, &size) in sub_sizes.iter().enumerate() {
                for i in 0..size {
                    self.weights[offset + i] = 1.0 / factors[k];
                    self.inv_weights[offset + i] = factors[k];
                }
                offset += size;
            }
            // Constant by definition.
            self.frozen = true;
        }
        self.sub_sizes = sub_sizes;
        Ok(())
    }

    /// Refresh the weights after an iteration. `timestep_complete` marks the
    /// iteration that also finished the time step.
    pub fn update(
        &mut self,
        timestep_complete: bool,
        values: &DVector<f64>,
        residual: &DVector<f64>,
    ) -> Result<()> {
        if self.frozen {
            return Ok(());
        }
        if timestep_complete {
            self.non_const_timesteps += 1;
            if self.max_non_const_timesteps > 0
                && self.non_const_timesteps >= self.max_non_const_timesteps
            {
                debug!(
                    steps = self.non_const_timesteps,
                    "preconditioner weights frozen"
                );
                self.frozen = true;
            }
        }
        match self.weighting {
            Weighting::Constant { .. } => {}
            Weighting::Value => {
                if timestep_complete {
                    let norms = self.sub_norms_inf(values)?;
                    self.set_weights_from(&norms);
                }
            }
            Weighting::Residual => {
                let norms = self.sub_norms_inf(residual)?;
                self.set_weights_from(&norms);
            }
            Weighting::ResidualSum => {
                let mut norms = Vec::with_capacity(self.sub_sizes.len());
                let mut offset = 0;
                for (k, &size) in self.sub_sizes.iter().enumerate() {
                    let local: f64 = residual
                        .as_slice()[offset..offset + size]
                        .iter()
                        .map(|r| r * r)
                        .sum();
                    self.residual_sums[k] += self.group.allreduce_sum_f64(local)?;
                    norms.push(self.residual_sums[k].sqrt());
                    offset += size;
                }
                self.set_weights_from(&norms);
                if timestep_complete {
                    self.residual_sums.iter_mut().for_each(|s| *s = 0.0);
                }
            }
        }
        Ok(())
    }

    fn sub_norms_inf(&self, v: &DVector<f64>) -> Result<Vec<f64>> {
        let mut norms = Vec::with_capacity(self.sub_sizes.len());
        let mut offset = 0;
        for &size in &self.sub_sizes {
            let local = v.as_slice()[offset..offset + size]
                .iter()
                .fold(0.0f64, |m, x| m.max(x.abs()));
            norms.push(self.group.allreduce_max_f64(local)?);
            offset += size;
        }
        Ok(norms)
    }

    /// Weight each sub-vector by the reciprocal of its norm; a vanishing
    /// norm keeps the previous weight for that field.
    fn set_weights_from(&mut self, norms: &[f64]) {
        let mut offset = 0;
        let mut changed = false;
        for (k, &size) in self.sub_sizes.iter().enumerate() {
            if norms[k] > 0.0 {
                let w = 1.0 / norms[k];
                for i in 0..size {
                    if self.weights[offset + i] != w {
                        changed = true;
                    }
                    self.weights[offset + i] = w;
                    self.inv_weights[offset + i] = norms[k];
                }
            }
            offset += size;
        }
        if changed {
            self.require_new_qr = true;
        }
    }

    /// True while the scaled QR decomposition is stale.
    pub fn requires_new_qr(&self) -> bool {
        self.require_new_qr
    }

    /// Acknowledge that the QR decomposition has been rebuilt.
    pub fn new_qr_fulfilled(&mut self) {
        self.require_new_qr = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn apply_vector(&self, v: &mut DVector<f64>) {
        for (x, w) in v.iter_mut().zip(&self.weights) {
            *x *= w;
        }
    }

    pub fn revert_vector(&self, v: &mut DVector<f64>) {
        for (x, w) in v.iter_mut().zip(&self.inv_weights) {
            *x *= w;
        }
    }

    /// Row scaling of a matrix (the rows follow the sub-vector layout).
    pub fn apply_matrix(&self, m: &mut DMatrix<f64>) {
        for c in 0..m.ncols() {
            for (r, w) in self.weights.iter().enumerate() {
                m[(r, c)] *= w;
            }
        }
    }

    pub fn revert_matrix(&self, m: &mut DMatrix<f64>) {
        for c in 0..m.ncols() {
            for (r, w) in self.inv_weights.iter().enumerate() {
                m[(r, c)] *= w;
            }
        }
    }

    /// Column scaling (scaling "from the right"): column `j` is weighted by
    /// entry `j` of the weight vector.
    pub fn apply_matrix_transposed(&self, m: &mut DMatrix<f64>) {
        for (c, w) in self.weights.iter().enumerate() {
            for r in 0..m.nrows() {
                m[(r, c)] *= w;
            }
        }
    }

    pub fn revert_matrix_transposed(&self, m: &mut DMatrix<f64>) {
        for (c, w) in self.inv_weights.iter().enumerate() {
            for r in 0..m.nrows() {
                m[(r, c)] *= w;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single() -> Arc<GroupComm> {
        Arc::new(GroupComm::single())
    }

    #[test]
    fn constant_weights_are_reciprocal_factors() {
        let mut p = Preconditioner::new(
            Weighting::Constant {
                factors: vec![2.0, 4.0],
            },
            -1,
            single(),
        );
        p.initialize(vec![2, 1]).unwrap();
        let mut v = DVector::from_row_slice(&[2.0, 4.0, 8.0]);
        p.apply_vector(&mut v);
        assert_eq!(v.as_slice(), &[1.0, 2.0, 2.0]);
        p.revert_vector(&mut v);
        assert_eq!(v.as_slice(), &[2.0, 4.0, 8.0]);
        assert!(p.is_frozen());
    }

    #[test]
    fn apply_revert_roundtrip_is_exact_for_powers_of_two() {
        let mut p = Preconditioner::new(
            Weighting::Constant {
                factors: vec![0.25, 8.0],
            },
            -1,
            single(),
        );
        p.initialize(vec![3, 3]).unwrap();
        let original = DVector::from_row_slice(&[1.1, -2.3, 0.0, 4.5, 1e-12, 7.7]);
        let mut v = original.clone();
        p.apply_vector(&mut v);
        p.revert_vector(&mut v);
        assert_eq!(v, original);
    }

    #[test]
    fn residual_weighting_refreshes_every_iteration() {
        let mut p = Preconditioner::new(Weighting::Residual, -1, single());
        p.initialize(vec![2]).unwrap();
        let values = DVector::zeros(2);
        let r = DVector::from_row_slice(&[0.0, -4.0]);
        p.update(false, &values, &r).unwrap();
        assert!(p.requires_new_qr());
        let mut v = DVector::from_row_slice(&[4.0, 4.0]);
        p.apply_vector(&mut v);
        assert_eq!(v.as_slice(), &[1.0, 1.0]);
    }

    #[test]
    fn freeze_after_max_non_const_timesteps() {
        let mut p = Preconditioner::new(Weighting::Residual, 2, single());
        p.initialize(vec![1]).unwrap();
        let values = DVector::zeros(1);
        for step in 0..3 {
            let r = DVector::from_row_slice(&[2.0f64.powi(step)]);
            p.update(true, &values, &r).unwrap();
        }
        assert!(p.is_frozen());
        // Weight stays at the value of the second completed step.
        let mut v = DVector::from_row_slice(&[2.0]);
        p.apply_vector(&mut v);
        assert_eq!(v.as_slice(), &[1.0]);
    }
}
