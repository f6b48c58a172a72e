//! Aitken under-relaxation.
//!
//! The relaxation factor is re-estimated every iteration from the secant of
//! the last two residuals: `ω ← −ω_prev · (rᵀΔr) / (ΔrᵀΔr)` with `r` the
//! previous residual and `Δr` the residual change. The first iteration of a
//! step clamps the factor to the configured initial relaxation; completing a
//! step resets it.

use crate::com::group::GroupComm;
use crate::error::{Error, Result};
use crate::mesh::DataId;
use crate::scheme::data::DataMap;
use nalgebra::DVector;
use std::sync::Arc;
use tracing::debug;

pub struct AitkenRelaxation {
    initial_relaxation: f64,
    factor: f64,
    iteration: usize,
    data_ids: Vec<DataId>,
    old_residual: DVector<f64>,
    design_specification: DVector<f64>,
    group: Arc<GroupComm>,
}

impl AitkenRelaxation {
    pub fn new(
        initial_relaxation: f64,
        data_ids: Vec<DataId>,
        group: Arc<GroupComm>,
    ) -> Result<Self> {
        if !(initial_relaxation > 0.0 && initial_relaxation <= 1.0) {
            return Err(Error::config(
                "initial relaxation factor for aitken relaxation has to be larger than \
                 zero and smaller or equal than one",
            ));
        }
        Ok(Self {
            initial_relaxation,
            factor: initial_relaxation,
            iteration: 0,
            data_ids,
            old_residual: DVector::zeros(0),
            design_specification: DVector::zeros(0),
            group,
        })
    }

    pub fn data_ids(&self) -> &[DataId] {
        &self.data_ids
    }

    pub fn initialize(&mut self, data: &mut DataMap) -> Result<()> {
        let mut entries = 0;
        for id in &self.data_ids {
            let entry = data.get(id).ok_or_else(|| {
                Error::config(format!(
                    "data {id} is not contained in data given at initialization"
                ))
            })?;
            entries += entry.len();
        }
        self.old_residual = DVector::zeros(entries);
        self.design_specification = DVector::zeros(entries);
        for entry in data.values_mut() {
            entry.ensure_old_columns(1);
        }
        Ok(())
    }

    fn concatenated_residual(&self, data: &DataMap) -> DVector<f64> {
        let mut residual = DVector::zeros(self.old_residual.len());
        let mut offset = 0;
        for id in &self.data_ids {
            let entry = &data[id];
            let values = entry.values();
            let n = values.len();
            residual
                .rows_mut(offset, n)
                .copy_from(&(&*values - entry.old_values.column(0)));
            offset += n;
        }
        residual
    }

    pub fn perform(&mut self, data: &mut DataMap) -> Result<()> {
        let residual = self.concatenated_residual(data);
        if self.iteration == 0 {
            self.factor = self.factor.signum() * self.initial_relaxation.min(self.factor.abs());
        } else {
            let delta = &residual - &self.old_residual;
            let denominator = self.group.dot(&delta, &delta)?;
            if denominator.sqrt() == 0.0 {
                self.factor = 1.0;
            } else {
                self.factor =
                    -self.factor * (self.group.dot(&self.old_residual, &delta)? / denominator);
            }
        }
        debug!(omega = self.factor, "aitken relaxation factor");

        let omega = self.factor;
        let one_minus_omega = 1.0 - omega;
        for entry in data.values_mut() {
            let old = entry.old_values.column(0).clone_owned();
            let mut values = entry.values_mut();
            *values *= omega;
            values.axpy(one_minus_omega, &old, 1.0);
        }
        self.old_residual = residual;
        self.iteration += 1;
        Ok(())
    }

    pub fn iterations_converged(&mut self, _data: &mut DataMap) -> Result<()> {
        self.iteration = 0;
        self.factor = self.initial_relaxation;
        Ok(())
    }

    pub fn set_design_specification(&mut self, q: &DVector<f64>) -> Result<()> {
        self.design_specification = q.clone();
        if q.iter().any(|x| *x != 0.0) {
            return Err(Error::NotImplemented(
                "design specification for aitken relaxation".into(),
            ));
        }
        Ok(())
    }
}
