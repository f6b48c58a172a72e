//! Interface quasi-Newton with multi-vector Jacobian approximation.
//!
//! The method keeps an approximation of the inverse Jacobian,
//! `J = J_prev + (W − J_prev V)(VᵀV)⁻¹Vᵀ`, and updates the iterate with
//! `Δx = −J·r`. Two representations exist:
//!
//! - **Normal mode** materializes `J` as a dense block-row distributed
//!   matrix once per completed time step. Building it multiplies two
//!   distributed blocks, which is where the slave ring comes in.
//! - **Restart mode** never materializes `J`. It stacks one factor pair
//!   `(W̃_q, Z_q)` per completed step and evaluates `J_prev·v` as
//!   `Σ_q W̃_q (Z_q v)`. When the stack reaches `chunk_size + 1` pairs, a
//!   restart compresses or discards it.

use super::parmat;
use super::qn::QnCore;
use super::qr::QrFactorization;
use super::svd::TruncatedSvd;
use crate::com::ChannelFactory;
use crate::com::ring::SlaveRing;
use crate::error::{Error, Result};
use crate::mesh::DataId;
use crate::scheme::data::DataMap;
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;
use tracing::debug;

/// What happens when the factor-pair stack is full.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RestartMode {
    /// Keep the dense Jacobian instead of factor pairs (normal mode).
    NoRestart,
    /// Drop all pairs; the next chunk starts from zero.
    Zero,
    /// Condense the last completed steps into one least-squares pair.
    LeastSquares,
    /// Maintain a truncated SVD of the Jacobian and restart from it.
    Svd,
    /// Fold the oldest pair into the remaining ones, then drop it.
    Slide,
}

struct FactorPair {
    wtil: DMatrix<f64>,
    z: DMatrix<f64>,
    v: DMatrix<f64>,
}

pub struct Imvj {
    core: QnCore,
    always_build_jacobian: bool,
    restart: RestartMode,
    chunk_size: usize,
    rsls_reused_timesteps: usize,

    // Normal mode: the dense inverse-Jacobian approximation, block rows.
    jacobian: DMatrix<f64>,
    old_jacobian: DMatrix<f64>,
    ring: Option<SlaveRing>,
    factory: Option<ChannelFactory>,

    // Restart mode: factor pairs, newest last.
    chunk: Vec<FactorPair>,
    /// True once the first chunk entry is the compressed SVD pair.
    chunk_has_svd_head: bool,
    svd: Option<TruncatedSvd>,
    svd_truncation_eps: f64,

    // History for the least-squares restart.
    v_rsls: DMatrix<f64>,
    w_rsls: DMatrix<f64>,
    rsls_cols: std::collections::VecDeque<usize>,

    offsets: Vec<usize>,
}

impl Imvj {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: QnCore,
        always_build_jacobian: bool,
        restart: RestartMode,
        chunk_size: usize,
        rsls_reused_timesteps: usize,
        svd_truncation_eps: f64,
        factory: Option<ChannelFactory>,
    ) -> Result<Self> {
        if restart != RestartMode::NoRestart && chunk_size == 0 {
            return Err(Error::config("imvj chunk size has to be at least 1"));
        }
        Ok(Self {
            core,
            always_build_jacobian,
            restart,
            chunk_size,
            rsls_reused_timesteps,
            jacobian: DMatrix::zeros(0, 0),
            old_jacobian: DMatrix::zeros(0, 0),
            ring: None,
            factory,
            chunk: Vec::new(),
            chunk_has_svd_head: false,
            svd: None,
            svd_truncation_eps,
            v_rsls: DMatrix::zeros(0, 0),
            w_rsls: DMatrix::zeros(0, 0),
            rsls_cols: std::collections::VecDeque::new(),
            offsets: Vec::new(),
        })
    }

    pub fn data_ids(&self) -> &[DataId] {
        &self.core.data_ids
    }

    /// Number of retained factor pairs (restart modes only).
    pub fn stored_pairs(&self) -> usize {
        self.chunk.len()
    }

    /// Action of the retained inverse-Jacobian approximation on a vector.
    /// Diagnostic; the restart invariants are stated in terms of it.
    pub fn jacobian_action(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        self.apply_old_jacobian(v)
    }

    pub fn initialize(&mut self, data: &mut DataMap) -> Result<()> {
        self.core.initialize(data)?;
        if let Some(extra) = data.keys().find(|id| !self.core.data_ids.contains(id)) {
            return Err(Error::config(format!(
                "multi-vector quasi-Newton requires every coupled field in its data \
                 list, but data {extra} is not in it"
            )));
        }
        let n = self.core.local_rows();
        self.offsets = self.core.group.offsets(n)?;
        match self.restart {
            RestartMode::NoRestart => {
                let n_global = self.core.global_rows();
                self.jacobian = DMatrix::zeros(n, n_global);
                self.old_jacobian = DMatrix::zeros(n, n_global);
                // The dense build pipelines blocks around the slave ring;
                // a single-rank group multiplies locally.
                if self.core.group.size() > 1 {
                    let factory = self.factory.as_ref().ok_or_else(|| {
                        Error::config(
                            "distributed multi-vector quasi-Newton needs a channel factory \
                             for the slave ring",
                        )
                    })?;
                    self.ring = Some(SlaveRing::connect(
                        "imvj",
                        self.core.group.rank(),
                        self.core.group.size(),
                        factory,
                    )?);
                }
            }
            RestartMode::Svd => {
                self.svd = Some(TruncatedSvd::new(
                    n,
                    self.svd_truncation_eps,
                    Arc::clone(&self.core.group),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn perform(&mut self, data: &mut DataMap) -> Result<()> {
        self.core.concatenate(data)?;
        self.core.update_difference_matrices()?;

        if self.core.use_initial_relaxation() {
            self.core.underrelax();
        } else {
            self.core.maybe_restore_backup()?;
            self.core.refresh_qr()?;
            match self.core.solve_alpha()? {
                Some(alpha) => {
                    let x_update = if self.always_build_jacobian
                        && self.restart == RestartMode::NoRestart
                    {
                        self.build_jacobian()?;
                        let r_global =
                            parmat::allgather_vector(&self.core.residual, &self.offsets, &self.core.group)?;
                        -(&self.jacobian * r_global)
                    } else {
                        // Efficient form: Δx = −(J_prev r + W̃ (Z r)).
                        let wtil = self.compute_wtil()?;
                        let jprev_r = self.apply_old_jacobian(&self.core.residual)?;
                        let z_r = -alpha;
                        -(jprev_r + wtil * z_r)
                    };
                    self.core.apply_update(x_update);
                }
                None => self.core.underrelax(),
            }
        }
        self.core.split(data);
        self.core.end_iteration();
        Ok(())
    }

    pub fn iterations_converged(&mut self, data: &mut DataMap) -> Result<()> {
        self.core.converged_prologue(data)?;
        self.core.rebuild_unfiltered_qr()?;

        if self.restart == RestartMode::LeastSquares {
            self.append_rsls_history();
        }

        match self.restart {
            RestartMode::NoRestart => {
                self.build_jacobian()?;
                self.old_jacobian = self.jacobian.clone();
            }
            _ => {
                if self.core.qr.cols() > 0 {
                    let wtil = self.compute_wtil()?;
                    let z = self.build_z()?;
                    let v = self.core.v.clone();
                    self.chunk.push(FactorPair { wtil, z, v });
                }
                if self.chunk.len() >= self.chunk_size + 1 {
                    self.restart_chunk()?;
                }
            }
        }

        let _ = self.core.converged_epilogue();
        Ok(())
    }

    pub fn set_design_specification(&mut self, q: &DVector<f64>) -> Result<()> {
        if q.iter().any(|x| *x != 0.0) {
            return Err(Error::NotImplemented(
                "design specification for quasi-Newton acceleration".into(),
            ));
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(ring) = self.ring.as_mut() {
            ring.close();
        }
        self.ring = None;
    }

    /// `J_prev · v` in whichever representation is active.
    fn apply_old_jacobian(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        match self.restart {
            RestartMode::NoRestart => {
                let v_global = parmat::allgather_vector(v, &self.offsets, &self.core.group)?;
                Ok(&self.old_jacobian * v_global)
            }
            _ => {
                let mut out = DVector::zeros(self.core.local_rows());
                for pair in &self.chunk {
                    let local = &pair.z * v;
                    let zv = DVector::from_vec(
                        self.core.group.allreduce_sum_f64s(local.as_slice().to_vec())?,
                    );
                    out += &pair.wtil * zv;
                }
                Ok(out)
            }
        }
    }

    /// `W̃ = W − J_prev V`, column by column.
    fn compute_wtil(&self) -> Result<DMatrix<f64>> {
        let k = self.core.v.ncols();
        let mut wtil = self.core.w.clone();
        for j in 0..k {
            let jv = self.apply_old_jacobian(&self.core.v.column(j).clone_owned())?;
            let updated = wtil.column(j) - jv;
            wtil.set_column(j, &updated);
        }
        Ok(wtil)
    }

    /// `Z = R⁻¹ Qᵀ P`: the pseudo-inverse of the (scaled) history, reverted
    /// to act on physical residuals. Local column block, `k × n_local`.
    fn build_z(&mut self) -> Result<DMatrix<f64>> {
        self.core.rebuild_unfiltered_qr()?;
        let k = self.core.qr.cols();
        let n = self.core.local_rows();
        let mut z = DMatrix::zeros(k, n);
        for j in 0..n {
            let q_row = self.core.qr.q().row(j).transpose();
            let col = self.core.qr.back_substitute(&q_row)?;
            z.set_column(j, &col);
        }
        self.core.preconditioner.apply_matrix_transposed(&mut z);
        Ok(z)
    }

    /// Normal mode: materialize `J = J_prev + W̃ Z`.
    fn build_jacobian(&mut self) -> Result<()> {
        if self.core.qr.cols() == 0 {
            self.jacobian = self.old_jacobian.clone();
            return Ok(());
        }
        let wtil = self.compute_wtil()?;
        let z = self.build_z()?;
        let product =
            parmat::pipelined_product(&wtil, &z, &self.offsets, self.ring.as_ref(), &self.core.group)?;
        self.jacobian = &self.old_jacobian + product;
        Ok(())
    }

    /// Keep this step's raw history for the least-squares restart.
    fn append_rsls_history(&mut self) {
        let step_cols = self.core.matrix_cols.front().copied().unwrap_or(0);
        if step_cols == 0 {
            return;
        }
        let n = self.core.local_rows();
        if self.v_rsls.ncols() == 0 {
            self.v_rsls = DMatrix::zeros(n, 0);
            self.w_rsls = DMatrix::zeros(n, 0);
        }
        for j in (0..step_cols).rev() {
            self.v_rsls = self.v_rsls.clone().insert_column(0, 0.0);
            self.v_rsls.set_column(0, &self.core.v.column(j));
            self.w_rsls = self.w_rsls.clone().insert_column(0, 0.0);
            self.w_rsls.set_column(0, &self.core.w.column(j));
        }
        self.rsls_cols.push_front(step_cols);
        while self.rsls_cols.len() > self.rsls_reused_timesteps {
            let drop = self.rsls_cols.pop_back().unwrap();
            for _ in 0..drop {
                let last = self.v_rsls.ncols() - 1;
                self.v_rsls = self.v_rsls.clone().remove_column(last);
                self.w_rsls = self.w_rsls.clone().remove_column(last);
            }
        }
    }

    fn restart_chunk(&mut self) -> Result<()> {
        debug!(pairs = self.chunk.len(), mode = ?self.restart, "restarting the multi-vector history");
        match self.restart {
            RestartMode::NoRestart => unreachable!("normal mode keeps no chunk"),
            RestartMode::Zero => {
                self.chunk.clear();
                self.chunk_has_svd_head = false;
            }
            RestartMode::LeastSquares => {
                self.chunk.clear();
                self.chunk_has_svd_head = false;
                if self.v_rsls.ncols() > 0 {
                    // Filtered QR of the retained history; dependent columns
                    // fall out of both matrices.
                    let mut scaled = self.v_rsls.clone();
                    self.core.preconditioner.apply_matrix(&mut scaled);
                    let (qr, dropped) = QrFactorization::decompose(
                        &scaled,
                        &self.core.group,
                        Some(self.core.singularity_limit),
                    )?;
                    let mut v = self.v_rsls.clone();
                    let mut w = self.w_rsls.clone();
                    for &i in dropped.iter().rev() {
                        v = v.remove_column(i);
                        w = w.remove_column(i);
                    }
                    let k = qr.cols();
                    if k > 0 {
                        let n = self.core.local_rows();
                        let mut z = DMatrix::zeros(k, n);
                        for j in 0..n {
                            let q_row = qr.q().row(j).transpose();
                            z.set_column(j, &qr.back_substitute(&q_row)?);
                        }
                        self.core.preconditioner.apply_matrix_transposed(&mut z);
                        self.chunk.push(FactorPair { wtil: w, z, v });
                    }
                }
            }
            RestartMode::Svd => {
                let svd = self.svd.as_mut().expect("initialized in SVD restart mode");
                let skip = usize::from(self.chunk_has_svd_head);
                for pair in self.chunk.iter().skip(skip) {
                    svd.update(&pair.wtil, &pair.z.transpose())?;
                }
                let psi = svd.psi().clone();
                let z = svd.sigma_phi_t();
                let k = psi.ncols();
                self.chunk.clear();
                if k > 0 {
                    let v = DMatrix::zeros(self.core.local_rows(), 0);
                    self.chunk.push(FactorPair { wtil: psi, z, v });
                }
                self.chunk_has_svd_head = true;
            }
            RestartMode::Slide => {
                while self.chunk.len() > self.chunk_size {
                    let oldest = self.chunk.remove(0);
                    for pair in self.chunk.iter_mut() {
                        // W̃_q ← W̃_q + W̃_0 (Z_0 V_q)
                        let local = &oldest.z * &pair.v;
                        let z0_vq = parmat::allreduce_matrix(local, &self.core.group)?;
                        pair.wtil += &oldest.wtil * z0_vq;
                    }
                }
            }
        }
        Ok(())
    }
}
