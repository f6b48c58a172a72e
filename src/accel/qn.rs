//! State and bookkeeping shared by the quasi-Newton methods.
//!
//! Both quasi-Newton variants work on the same concatenated system: the
//! primary coupled fields are stacked into one vector, the residual history
//! `V` and the iterate-difference history `W` grow one column per iteration
//! (newest first), and a deque remembers how many columns belong to each
//! retained time step so old steps can be dropped as configured.
//!
//! The core deliberately does not orchestrate a whole iteration; each method
//! drives these helpers in its own order so the differences between the
//! least-squares and the multi-vector update stay visible in their own
//! modules.

use super::preconditioner::Preconditioner;
use super::qr::QrFactorization;
use crate::com::group::GroupComm;
use crate::error::{Error, Result};
use crate::mesh::DataId;
use crate::scheme::data::DataMap;
use nalgebra::{DMatrix, DVector};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Column filtering policy for the least-squares system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filter {
    /// Keep every column.
    None,
    /// Drop columns whose `R` diagonal falls below `limit · ‖R‖`.
    Qr1,
    /// Drop columns during Gram-Schmidt when the orthogonal remainder falls
    /// below `limit` times the column norm.
    Qr2,
}

/// What `update_difference_matrices` did this iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnUpdate {
    /// Nothing appended (first iteration of a step).
    Skipped,
    /// A new column went in front.
    Appended,
    /// A new column went in front and the oldest fell out.
    ShiftedAppended,
}

/// What end-of-step trimming did, so method-specific side matrices can
/// mirror it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrimAction {
    None,
    /// The whole history was cleared (and possibly backed up).
    Cleared,
    /// This many columns fell off the back.
    DroppedBack(usize),
}

/// Shared quasi-Newton state.
pub struct QnCore {
    pub data_ids: Vec<DataId>,
    pub initial_relaxation: f64,
    pub force_initial_relaxation: bool,
    pub max_iterations_used: usize,
    pub timesteps_reused: usize,
    pub filter: Filter,
    pub singularity_limit: f64,
    pub preconditioner: Preconditioner,
    pub group: Arc<GroupComm>,

    pub values: DVector<f64>,
    pub old_values: DVector<f64>,
    pub residual: DVector<f64>,
    old_residual: DVector<f64>,
    old_xtilde: DVector<f64>,

    pub v: DMatrix<f64>,
    pub w: DMatrix<f64>,
    /// Columns per retained time step, current step in front.
    pub matrix_cols: VecDeque<usize>,
    backup: Option<(DMatrix<f64>, DMatrix<f64>, VecDeque<usize>)>,

    pub qr: QrFactorization,
    qr_stale: bool,

    pub first_iteration: bool,
    pub first_timestep: bool,
    global_rows: usize,
    sub_sizes: Vec<usize>,
}

impl QnCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initial_relaxation: f64,
        force_initial_relaxation: bool,
        max_iterations_used: usize,
        timesteps_reused: usize,
        filter: Filter,
        singularity_limit: f64,
        data_ids: Vec<DataId>,
        preconditioner: Preconditioner,
        group: Arc<GroupComm>,
    ) -> Result<Self> {
        if !(initial_relaxation > 0.0 && initial_relaxation <= 1.0) {
            return Err(Error::config(
                "initial relaxation has to be in (0, 1]",
            ));
        }
        if max_iterations_used == 0 {
            return Err(Error::config("max-used-iterations has to be at least 1"));
        }
        Ok(Self {
            data_ids,
            initial_relaxation,
            force_initial_relaxation,
            max_iterations_used,
            timesteps_reused,
            filter,
            singularity_limit,
            preconditioner,
            group,
            values: DVector::zeros(0),
            old_values: DVector::zeros(0),
            residual: DVector::zeros(0),
            old_residual: DVector::zeros(0),
            old_xtilde: DVector::zeros(0),
            v: DMatrix::zeros(0, 0),
            w: DMatrix::zeros(0, 0),
            matrix_cols: VecDeque::new(),
            backup: None,
            qr: QrFactorization::empty(0),
            qr_stale: true,
            first_iteration: true,
            first_timestep: true,
            global_rows: 0,
            sub_sizes: Vec::new(),
        })
    }

    pub fn initialize(&mut self, data: &mut DataMap) -> Result<()> {
        let mut sub_sizes = Vec::with_capacity(self.data_ids.len());
        for id in &self.data_ids {
            let entry = data.get(id).ok_or_else(|| {
                Error::config(format!(
                    "data {id} is not part of the coupled data given at initialization"
                ))
            })?;
            sub_sizes.push(entry.len());
        }
        let n: usize = sub_sizes.iter().sum();
        self.global_rows = self.group.allreduce_sum_i64(n as i64)? as usize;
        self.values = DVector::zeros(n);
        self.old_values = DVector::zeros(n);
        self.residual = DVector::zeros(n);
        self.old_residual = DVector::zeros(n);
        self.old_xtilde = DVector::zeros(n);
        self.v = DMatrix::zeros(n, 0);
        self.w = DMatrix::zeros(n, 0);
        self.matrix_cols = VecDeque::from([0]);
        self.qr = QrFactorization::empty(n);
        self.preconditioner.initialize(sub_sizes.clone())?;
        self.sub_sizes = sub_sizes;
        // Append a column for old values if the scheme did not do it yet.
        for entry in data.values_mut() {
            entry.ensure_old_columns(1);
        }
        Ok(())
    }

    pub fn local_rows(&self) -> usize {
        self.values.len()
    }

    pub fn global_rows(&self) -> usize {
        self.global_rows
    }

    pub fn sub_sizes(&self) -> &[usize] {
        &self.sub_sizes
    }

    /// Stack the primary fields into the concatenated system and refresh the
    /// residual. A non-finite residual is fatal.
    pub fn concatenate(&mut self, data: &DataMap) -> Result<()> {
        let mut offset = 0;
        for id in &self.data_ids {
            let entry = &data[id];
            let values = entry.values();
            let n = values.len();
            self.values.rows_mut(offset, n).copy_from(&*values);
            self.old_values
                .rows_mut(offset, n)
                .copy_from(&entry.old_values.column(0));
            offset += n;
        }
        self.residual = &self.values - &self.old_values;
        if !self.residual.iter().all(|x| x.is_finite()) {
            return Err(Error::Numerical(
                "non-finite coupling residual".into(),
            ));
        }
        Ok(())
    }

    /// Write the concatenated values back into the coupled fields.
    pub fn split(&self, data: &mut DataMap) {
        let mut offset = 0;
        for id in &self.data_ids {
            let entry = &data[id];
            let mut values = entry.values_mut();
            let n = values.len();
            values.copy_from(&self.values.rows(offset, n));
            offset += n;
        }
    }

    /// True when this iteration uses plain under-relaxation instead of a
    /// quasi-Newton step.
    pub fn use_initial_relaxation(&self) -> bool {
        self.first_iteration && (self.first_timestep || self.force_initial_relaxation)
    }

    /// Grow the difference histories by the newest iterate, respecting the
    /// column cap.
    pub fn update_difference_matrices(&mut self) -> Result<ColumnUpdate> {
        if self.use_initial_relaxation() {
            return Ok(ColumnUpdate::Skipped);
        }
        let mut update = ColumnUpdate::Skipped;
        if !self.first_iteration {
            let dv = &self.residual - &self.old_residual;
            let dw = &self.values - &self.old_xtilde;
            let cols = self.v.ncols();
            let limit_reached = cols == self.max_iterations_used;
            let overdetermined = cols <= self.global_rows;
            if !limit_reached && overdetermined {
                self.prepend_column(&dv, &dw);
                update = ColumnUpdate::Appended;
            } else {
                self.prepend_column(&dv, &dw);
                let last = self.v.ncols() - 1;
                self.v = self.v.clone().remove_column(last);
                self.w = self.w.clone().remove_column(last);
                if let Some(back) = self.matrix_cols.back_mut() {
                    *back -= 1;
                }
                if self.matrix_cols.back() == Some(&0) {
                    self.matrix_cols.pop_back();
                }
                update = ColumnUpdate::ShiftedAppended;
            }
            self.qr_stale = true;
        }
        self.old_residual = self.residual.clone();
        self.old_xtilde = self.values.clone();
        Ok(update)
    }

    fn prepend_column(&mut self, dv: &DVector<f64>, dw: &DVector<f64>) {
        self.v = self.v.clone().insert_column(0, 0.0);
        self.v.set_column(0, dv);
        self.w = self.w.clone().insert_column(0, 0.0);
        self.w.set_column(0, dw);
        if let Some(front) = self.matrix_cols.front_mut() {
            *front += 1;
        } else {
            self.matrix_cols.push_front(1);
        }
    }

    /// First-iteration step: constant under-relaxation with the initial
    /// factor.
    pub fn underrelax(&mut self) {
        self.old_xtilde = self.values.clone();
        self.old_residual = self.residual.clone();
        self.values = &self.old_values + &self.residual * self.initial_relaxation;
    }

    /// With `timesteps-reused = 0` the history is cleared at every step end;
    /// if the step then converges within a single iteration the system would
    /// stay empty forever, so the previous step's matrices come back from
    /// the backup.
    pub fn maybe_restore_backup(&mut self) -> Result<()> {
        if !self.should_restore_backup() {
            return Ok(());
        }
        if let Some((v, w, cols)) = self.backup.clone() {
            debug!("restoring the quasi-Newton history from the previous step's backup");
            self.v = v;
            self.w = w;
            self.matrix_cols = cols;
            self.qr_stale = true;
        }
        Ok(())
    }

    /// Update the preconditioner, rebuild the scaled QR decomposition when
    /// needed, and apply the configured column filter. Returns the indices
    /// of dropped columns (in pre-drop order) so side matrices can mirror
    /// the removal.
    pub fn refresh_qr(&mut self) -> Result<Vec<usize>> {
        self.preconditioner
            .update(false, &self.values, &self.residual)?;
        let mut removed = Vec::new();
        match self.filter {
            Filter::None | Filter::Qr1 => {
                if self.qr_stale || self.preconditioner.requires_new_qr() {
                    self.rebuild_qr(None)?;
                }
                if self.filter == Filter::Qr1 {
                    loop {
                        let k = self.qr.cols();
                        let threshold = self.singularity_limit * self.qr.r_norm();
                        let Some(bad) =
                            (0..k).find(|&i| self.qr.r_diagonal(i).abs() < threshold)
                        else {
                            break;
                        };
                        debug!(column = bad, "filtered a linearly dependent column");
                        self.remove_column(bad);
                        removed.push(bad);
                        self.rebuild_qr(None)?;
                    }
                }
            }
            Filter::Qr2 => {
                // The QR2 threshold acts during decomposition, so the scaled
                // factorization is rebuilt every iteration.
                let dropped = self.rebuild_qr(Some(self.singularity_limit))?;
                for &i in dropped.iter().rev() {
                    self.remove_column(i);
                }
                removed = dropped;
            }
        }
        Ok(removed)
    }

    fn rebuild_qr(&mut self, qr2_eps: Option<f64>) -> Result<Vec<usize>> {
        let mut scaled = self.v.clone();
        self.preconditioner.apply_matrix(&mut scaled);
        let (qr, dropped) = QrFactorization::decompose(&scaled, &self.group, qr2_eps)?;
        self.qr = qr;
        self.qr_stale = false;
        self.preconditioner.new_qr_fulfilled();
        Ok(dropped)
    }

    /// Drop one column from `V`, `W`, and the per-step column counts.
    pub fn remove_column(&mut self, index: usize) {
        self.v = self.v.clone().remove_column(index);
        self.w = self.w.clone().remove_column(index);
        let mut acc = 0;
        for seg in self.matrix_cols.iter_mut() {
            if index < acc + *seg {
                *seg -= 1;
                break;
            }
            acc += *seg;
        }
        while self.matrix_cols.len() > 1 && self.matrix_cols.back() == Some(&0) {
            self.matrix_cols.pop_back();
        }
    }

    /// Solve the filtered least-squares system `min ‖P V α + P r‖` and
    /// return `α` (with the minus sign of the right-hand side already
    /// applied). `None` when the filter has emptied the system.
    pub fn solve_alpha(&mut self) -> Result<Option<DVector<f64>>> {
        if self.qr.cols() == 0 {
            warn!("empty quasi-Newton system, falling back to initial relaxation");
            return Ok(None);
        }
        let mut scaled_residual = self.residual.clone();
        self.preconditioner.apply_vector(&mut scaled_residual);
        let rhs = -self.qr.q_transpose_times(&scaled_residual, &self.group)?;
        Ok(Some(self.qr.back_substitute(&rhs)?))
    }

    /// `x ← x_prev + r + Δx`.
    pub fn apply_update(&mut self, x_update: DVector<f64>) {
        self.values = &self.old_values + &self.residual + x_update;
    }

    pub fn end_iteration(&mut self) {
        self.first_iteration = false;
    }

    /// True when the quasi-Newton step should come out of the backup
    /// instead of the (cleared) histories.
    pub fn should_restore_backup(&self) -> bool {
        !self.first_timestep
            && !self.force_initial_relaxation
            && self.timesteps_reused == 0
            && self.v.ncols() < 1
            && self.backup.is_some()
    }

    /// Recompute the scaled factorization without touching preconditioner
    /// weights or filters. Used on step completion, where the final column
    /// joined the history after the last filter pass.
    pub fn rebuild_unfiltered_qr(&mut self) -> Result<()> {
        if self.qr_stale {
            self.rebuild_qr(None)?;
        }
        Ok(())
    }

    /// Steps shared by every method when a time step converged: pick up the
    /// final iterate, account for it in the histories, and refresh the
    /// preconditioner with the completed-step flag. Returns what happened to
    /// the difference matrices so side matrices can mirror it.
    pub fn converged_prologue(&mut self, data: &DataMap) -> Result<ColumnUpdate> {
        self.concatenate(data)?;
        let update = self.update_difference_matrices()?;
        if self.matrix_cols.front() == Some(&0) {
            // The step converged in its very first iteration.
            self.matrix_cols.pop_front();
        }
        self.preconditioner
            .update(true, &self.values, &self.residual)?;
        Ok(update)
    }

    /// History trimming at the end of a time step, plus the flag flip into
    /// the next step. Runs after the method-specific completion work.
    pub fn converged_epilogue(&mut self) -> TrimAction {
        let n = self.local_rows();
        let action = if self.timesteps_reused == 0 {
            if !self.force_initial_relaxation {
                self.backup = Some((self.v.clone(), self.w.clone(), self.matrix_cols.clone()));
            }
            self.v = DMatrix::zeros(n, 0);
            self.w = DMatrix::zeros(n, 0);
            self.matrix_cols.clear();
            TrimAction::Cleared
        } else if self.matrix_cols.len() > self.timesteps_reused {
            let drop = self.matrix_cols.pop_back().unwrap_or(0);
            for _ in 0..drop {
                let last = self.v.ncols() - 1;
                self.v = self.v.clone().remove_column(last);
                self.w = self.w.clone().remove_column(last);
            }
            TrimAction::DroppedBack(drop)
        } else {
            TrimAction::None
        };
        self.qr_stale = true;
        self.first_timestep = false;
        self.first_iteration = true;
        self.matrix_cols.push_front(0);
        action
    }
}
