//! QR decomposition of the residual-history matrix.
//!
//! The history matrix is block-row distributed over the participant group, so
//! all inner products are globally reduced through the group coordinator. The
//! decomposition is an iterated modified Gram-Schmidt: each column is
//! orthogonalized twice against the running basis, which keeps `Q` orthogonal
//! to working precision even for ill-conditioned histories.
//!
//! Column filtering happens here. `QR2` rejects a column during
//! decomposition when its orthogonal remainder drops below a threshold
//! relative to its own norm; `QR1` is applied afterwards on the diagonal of
//! `R` (see the quasi-Newton core). Either way the caller learns which
//! columns fell out and drops them from the unscaled history.

use crate::com::group::GroupComm;
use crate::error::{Error, Result};
use nalgebra::{DMatrix, DVector};

/// Thin QR factorization `M = Q R` with globally reduced inner products.
pub struct QrFactorization {
    q: DMatrix<f64>,
    r: DMatrix<f64>,
}

impl QrFactorization {
    /// Factorization of a matrix with no columns.
    pub fn empty(rows: usize) -> Self {
        Self {
            q: DMatrix::zeros(rows, 0),
            r: DMatrix::zeros(0, 0),
        }
    }

    /// Decompose `m` column by column. With `qr2_eps` set, a column whose
    /// orthogonal remainder is at most `eps` times its own norm is rejected;
    /// the indices of rejected columns (into `m`) are returned alongside.
    pub fn decompose(
        m: &DMatrix<f64>,
        group: &GroupComm,
        qr2_eps: Option<f64>,
    ) -> Result<(Self, Vec<usize>)> {
        let rows = m.nrows();
        let mut q = DMatrix::<f64>::zeros(rows, 0);
        let mut r_cols: Vec<DVector<f64>> = Vec::new();
        let mut dropped = Vec::new();

        for j in 0..m.ncols() {
            let mut u = m.column(j).clone_owned();
            let rho0 = group.l2_norm(&u)?;
            let mut coeffs = DVector::zeros(q.ncols());
            // Two Gram-Schmidt passes.
            for _ in 0..2 {
                for i in 0..q.ncols() {
                    let qi = q.column(i).clone_owned();
                    let h = group.dot(&qi, &u)?;
                    coeffs[i] += h;
                    u.axpy(-h, &qi, 1.0);
                }
            }
            let rho = group.l2_norm(&u)?;
            if let Some(eps) = qr2_eps {
                if rho <= eps * rho0 {
                    dropped.push(j);
                    continue;
                }
            }
            let k = q.ncols();
            q = q.insert_column(k, 0.0);
            if rho > 0.0 {
                q.set_column(k, &(u / rho));
            }
            let mut r_col = DVector::zeros(k + 1);
            r_col.rows_mut(0, k).copy_from(&coeffs);
            r_col[k] = rho;
            r_cols.push(r_col);
        }

        let cols = r_cols.len();
        let mut r = DMatrix::zeros(cols, cols);
        for (j, col) in r_cols.iter().enumerate() {
            r.view_mut((0, j), (j + 1, 1)).copy_from(&col.rows(0, j + 1));
        }
        Ok((Self { q, r }, dropped))
    }

    pub fn cols(&self) -> usize {
        self.r.ncols()
    }

    /// The orthonormal factor (local row block).
    pub fn q(&self) -> &DMatrix<f64> {
        &self.q
    }

    /// The replicated triangular factor.
    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    pub fn r_diagonal(&self, i: usize) -> f64 {
        self.r[(i, i)]
    }

    /// Frobenius norm of `R`; `R` is replicated, so this needs no reduction.
    pub fn r_norm(&self) -> f64 {
        self.r.norm()
    }

    /// `Qᵀ y` with globally reduced dot products.
    pub fn q_transpose_times(&self, y: &DVector<f64>, group: &GroupComm) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.cols());
        for i in 0..self.cols() {
            let qi = self.q.column(i).clone_owned();
            out[i] = group.dot(&qi, y)?;
        }
        Ok(out)
    }

    /// Solve `R x = b` by back substitution.
    pub fn back_substitute(&self, b: &DVector<f64>) -> Result<DVector<f64>> {
        let k = self.cols();
        let mut x = DVector::zeros(k);
        for i in (0..k).rev() {
            let mut sum = b[i];
            for j in i + 1..k {
                sum -= self.r[(i, j)] * x[j];
            }
            let diag = self.r[(i, i)];
            if diag == 0.0 || !diag.is_finite() {
                return Err(Error::Numerical(
                    "singular least-squares system beyond the filter's reach".into(),
                ));
            }
            x[i] = sum / diag;
        }
        Ok(x)
    }
}
