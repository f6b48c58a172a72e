//! Truncated singular value decomposition of the inverse-Jacobian
//! approximation.
//!
//! The SVD restart mode never materializes the dense Jacobian; it keeps
//! `J ≈ Ψ Σ Φᵀ` with `Ψ` and `Φ` block-row distributed and updates the
//! factorization by low-rank contributions `J ← J + A·Bᵀ` (one per retained
//! factor pair). Each update orthogonalizes `A` against `Ψ` and `B` against
//! `Φ`, solves a small replicated core SVD, and drops singular values below
//! `eps · σ_max`.

use super::qr::QrFactorization;
use crate::com::group::GroupComm;
use crate::error::Result;
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;
use tracing::debug;

pub struct TruncatedSvd {
    psi: DMatrix<f64>,
    sigma: DVector<f64>,
    phi: DMatrix<f64>,
    truncation_eps: f64,
    group: Arc<GroupComm>,
}

impl TruncatedSvd {
    pub fn new(local_rows: usize, truncation_eps: f64, group: Arc<GroupComm>) -> Self {
        Self {
            psi: DMatrix::zeros(local_rows, 0),
            sigma: DVector::zeros(0),
            phi: DMatrix::zeros(local_rows, 0),
            truncation_eps,
            group,
        }
    }

    pub fn rank(&self) -> usize {
        self.sigma.len()
    }

    pub fn psi(&self) -> &DMatrix<f64> {
        &self.psi
    }

    /// `Σ·Φ_localᵀ`, the local column block of the right factor.
    pub fn sigma_phi_t(&self) -> DMatrix<f64> {
        let mut m = self.phi.transpose();
        for i in 0..self.sigma.len() {
            let s = self.sigma[i];
            m.row_mut(i).scale_mut(s);
        }
        m
    }

    /// Low-rank update `J ← J + A·Bᵀ` with `A`, `B` block-row distributed.
    pub fn update(&mut self, a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<()> {
        let m = a.ncols();
        if m == 0 {
            return Ok(());
        }
        let k = self.rank();

        // Project the update into and out of the current column spaces.
        let psi_t_a = super::parmat::transpose_product(&self.psi, a, &self.group)?;
        let a_perp = a - &self.psi * &psi_t_a;
        let (qr_a, _) = QrFactorization::decompose(&a_perp, &self.group, None)?;

        let phi_t_b = super::parmat::transpose_product(&self.phi, b, &self.group)?;
        let b_perp = b - &self.phi * &phi_t_b;
        let (qr_b, _) = QrFactorization::decompose(&b_perp, &self.group, None)?;

        // Core matrix in the enlarged bases.
        let mut top_left = &psi_t_a * phi_t_b.transpose();
        for i in 0..k {
            top_left[(i, i)] += self.sigma[i];
        }
        let mut core = DMatrix::zeros(k + m, k + m);
        core.view_mut((0, 0), (k, k)).copy_from(&top_left);
        core.view_mut((0, k), (k, m))
            .copy_from(&(&psi_t_a * qr_b.r().transpose()));
        core.view_mut((k, 0), (m, k))
            .copy_from(&(qr_a.r() * phi_t_b.transpose()));
        core.view_mut((k, k), (m, m))
            .copy_from(&(qr_a.r() * qr_b.r().transpose()));

        let svd = core.svd(true, true);
        let u = svd.u.expect("requested U factor");
        let v_t = svd.v_t.expect("requested Vᵀ factor");

        // Keep the singular values above the relative truncation threshold,
        // largest first.
        let sigma_max = svd.singular_values.iter().cloned().fold(0.0f64, f64::max);
        let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
        order.sort_by(|&a, &b| {
            svd.singular_values[b]
                .partial_cmp(&svd.singular_values[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let kept: Vec<usize> = order
            .into_iter()
            .filter(|&i| {
                let s = svd.singular_values[i];
                s > 0.0 && s > self.truncation_eps * sigma_max
            })
            .collect();

        let psi_ext = stack_columns(&self.psi, qr_a.q());
        let phi_ext = stack_columns(&self.phi, qr_b.q());
        let v = v_t.transpose();
        let mut psi = DMatrix::zeros(psi_ext.nrows(), kept.len());
        let mut phi = DMatrix::zeros(phi_ext.nrows(), kept.len());
        let mut sigma = DVector::zeros(kept.len());
        for (j, &i) in kept.iter().enumerate() {
            psi.set_column(j, &(&psi_ext * u.column(i)));
            phi.set_column(j, &(&phi_ext * v.column(i)));
            sigma[j] = svd.singular_values[i];
        }
        debug!(rank = kept.len(), dropped = k + m - kept.len(), "truncated SVD updated");
        self.psi = psi;
        self.phi = phi;
        self.sigma = sigma;
        Ok(())
    }

    /// `J·v` for a block-row distributed vector.
    pub fn apply(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        let local = self.phi.transpose() * v;
        let summed = self.group.allreduce_sum_f64s(local.as_slice().to_vec())?;
        let mut scaled = DVector::from_vec(summed);
        for i in 0..self.rank() {
            scaled[i] *= self.sigma[i];
        }
        Ok(&self.psi * scaled)
    }
}

fn stack_columns(left: &DMatrix<f64>, right: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(left.nrows(), left.ncols() + right.ncols());
    out.view_mut((0, 0), (left.nrows(), left.ncols())).copy_from(left);
    out.view_mut((0, left.ncols()), (right.nrows(), right.ncols()))
        .copy_from(right);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single() -> Arc<GroupComm> {
        Arc::new(GroupComm::single())
    }

    #[test]
    fn accumulates_rank_one_updates_exactly() {
        let mut svd = TruncatedSvd::new(3, 0.0, single());
        let a1 = DMatrix::from_column_slice(3, 1, &[1.0, 0.0, 1.0]);
        let b1 = DMatrix::from_column_slice(3, 1, &[2.0, 1.0, 0.0]);
        let a2 = DMatrix::from_column_slice(3, 1, &[0.0, 1.0, -1.0]);
        let b2 = DMatrix::from_column_slice(3, 1, &[1.0, 1.0, 1.0]);
        svd.update(&a1, &b1).unwrap();
        svd.update(&a2, &b2).unwrap();

        let expected = &a1 * b1.transpose() + &a2 * b2.transpose();
        let v = DVector::from_row_slice(&[0.5, -1.5, 2.0]);
        let got = svd.apply(&v).unwrap();
        assert!((got - expected * v).norm() < 1e-12);
    }

    #[test]
    fn truncation_drops_small_singular_values() {
        let mut svd = TruncatedSvd::new(2, 1e-3, single());
        let a = DMatrix::from_column_slice(2, 2, &[1.0, 0.0, 0.0, 1e-9]);
        let b = DMatrix::from_column_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        svd.update(&a, &b).unwrap();
        assert_eq!(svd.rank(), 1);
    }
}
