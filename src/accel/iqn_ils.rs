//! Interface quasi-Newton with least-squares Jacobian approximation.
//!
//! Every iteration solves `min ‖P V α + P r‖` over the filtered residual
//! history and applies `x ← x_prev + r + W α`. Fields that the scheme
//! couples but the method does not drive directly (secondary data) are
//! under-relaxed on first iterations and updated through their own
//! iterate-difference matrices with the same `α`.

use super::qn::{ColumnUpdate, QnCore, TrimAction};
use crate::error::{Error, Result};
use crate::mesh::DataId;
use crate::scheme::data::DataMap;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;

pub struct IqnIls {
    core: QnCore,
    secondary_ids: Vec<DataId>,
    secondary_w: BTreeMap<DataId, DMatrix<f64>>,
    secondary_old_xtilde: BTreeMap<DataId, DVector<f64>>,
    secondary_backup: Option<BTreeMap<DataId, DMatrix<f64>>>,
}

impl IqnIls {
    pub fn new(core: QnCore) -> Self {
        Self {
            core,
            secondary_ids: Vec::new(),
            secondary_w: BTreeMap::new(),
            secondary_old_xtilde: BTreeMap::new(),
            secondary_backup: None,
        }
    }

    pub fn data_ids(&self) -> &[DataId] {
        &self.core.data_ids
    }

    /// Number of retained history columns, bounded by `max-used-iterations`
    /// and the per-step column counts of the reused time steps.
    pub fn history_columns(&self) -> usize {
        self.core.v.ncols()
    }

    /// Column counts of the retained time steps, most recent first.
    pub fn history_per_timestep(&self) -> Vec<usize> {
        self.core.matrix_cols.iter().copied().collect()
    }

    pub fn initialize(&mut self, data: &mut DataMap) -> Result<()> {
        self.core.initialize(data)?;
        self.secondary_ids = data
            .keys()
            .filter(|id| !self.core.data_ids.contains(id))
            .copied()
            .collect();
        for id in &self.secondary_ids {
            let n = data[id].len();
            self.secondary_w.insert(*id, DMatrix::zeros(n, 0));
            self.secondary_old_xtilde.insert(*id, DVector::zeros(n));
        }
        Ok(())
    }

    pub fn perform(&mut self, data: &mut DataMap) -> Result<()> {
        self.core.concatenate(data)?;
        let update = self.core.update_difference_matrices()?;
        self.mirror_secondary_columns(data, update);

        if self.core.use_initial_relaxation() {
            self.core.underrelax();
            self.underrelax_secondary(data);
        } else {
            if self.core.should_restore_backup() {
                if let Some(backup) = self.secondary_backup.take() {
                    self.secondary_w = backup;
                }
            }
            self.core.maybe_restore_backup()?;
            let removed = self.core.refresh_qr()?;
            for &index in &removed {
                for w in self.secondary_w.values_mut() {
                    *w = w.clone().remove_column(index);
                }
            }
            match self.core.solve_alpha()? {
                Some(alpha) => {
                    let x_update = &self.core.w * &alpha;
                    self.core.apply_update(x_update);
                    self.update_secondary(data, &alpha);
                }
                None => {
                    // Every column was filtered out; fall back to plain
                    // under-relaxation for this iteration.
                    self.core.underrelax();
                    self.underrelax_secondary(data);
                }
            }
        }
        self.core.split(data);
        self.core.end_iteration();
        Ok(())
    }

    pub fn iterations_converged(&mut self, data: &mut DataMap) -> Result<()> {
        let update = self.core.converged_prologue(data)?;
        self.mirror_secondary_columns(data, update);
        match self.core.converged_epilogue() {
            TrimAction::Cleared => {
                if self.core.timesteps_reused == 0 && !self.core.force_initial_relaxation {
                    self.secondary_backup = Some(self.secondary_w.clone());
                }
                for w in self.secondary_w.values_mut() {
                    *w = DMatrix::zeros(w.nrows(), 0);
                }
            }
            TrimAction::DroppedBack(n) => {
                for w in self.secondary_w.values_mut() {
                    for _ in 0..n {
                        let last = w.ncols() - 1;
                        *w = w.clone().remove_column(last);
                    }
                }
            }
            TrimAction::None => {}
        }
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

    /// Keep the secondary iterate-difference matrices in step with the
    /// primary history.
    fn mirror_secondary_columns(&mut self, data: &DataMap, update: ColumnUpdate) {
        if self.core.use_initial_relaxation() {
            return;
        }
        for id in &self.secondary_ids {
            let values = data[id].values().clone_owned();
            let w = self.secondary_w.get_mut(id).unwrap();
            match update {
                ColumnUpdate::Skipped => {}
                ColumnUpdate::Appended | ColumnUpdate::ShiftedAppended => {
                    let dw = &values - &self.secondary_old_xtilde[id];
                    *w = w.clone().insert_column(0, 0.0);
                    w.set_column(0, &dw);
                    if update == ColumnUpdate::ShiftedAppended {
                        let last = w.ncols() - 1;
                        *w = w.clone().remove_column(last);
                    }
                }
            }
            self.secondary_old_xtilde.insert(*id, values);
        }
    }

    fn underrelax_secondary(&mut self, data: &mut DataMap) {
        let omega = self.core.initial_relaxation;
        for id in &self.secondary_ids {
            let entry = data.get_mut(id).unwrap();
            let old = entry.old_values.column(0).clone_owned();
            let mut values = entry.values_mut();
            self.secondary_old_xtilde.insert(*id, values.clone_owned());
            *values *= omega;
            values.axpy(1.0 - omega, &old, 1.0);
        }
    }

    fn update_secondary(&mut self, data: &mut DataMap, alpha: &DVector<f64>) {
        for id in &self.secondary_ids {
            let entry = data.get_mut(id).unwrap();
            let old = entry.old_values.column(0).clone_owned();
            let w = &self.secondary_w[id];
            let mut values = entry.values_mut();
            let residual = &*values - &old;
            let mut next = old;
            if w.ncols() == alpha.len() {
                next += w * alpha;
            }
            next += residual;
            values.copy_from(&next);
        }
    }
}
