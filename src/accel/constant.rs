//! Constant under-relaxation.

use crate::error::{Error, Result};
use crate::mesh::DataId;
use crate::scheme::data::DataMap;
use nalgebra::DVector;

/// `x ← ω·x̃ + (1 − ω)·x_prev` with a fixed factor. The simplest stabilizer
/// for an implicit coupling loop, and the baseline every other method falls
/// back to on first iterations.
pub struct ConstantRelaxation {
    relaxation: f64,
    data_ids: Vec<DataId>,
    design_specification: DVector<f64>,
}

impl ConstantRelaxation {
    pub fn new(relaxation: f64, data_ids: Vec<DataId>) -> Result<Self> {
        if !(relaxation > 0.0 && relaxation <= 1.0) {
            return Err(Error::config(
                "relaxation factor for constant relaxation has to be larger than zero \
                 and smaller or equal than one",
            ));
        }
        Ok(Self {
            relaxation,
            data_ids,
            design_specification: DVector::zeros(0),
        })
    }

    pub fn data_ids(&self) -> &[DataId] {
        &self.data_ids
    }

    pub fn initialize(&mut self, data: &mut DataMap) -> Result<()> {
        if let Some(id) = self.data_ids.iter().find(|id| !data.contains_key(id)) {
            return Err(Error::config(format!(
                "data {id} is not contained in data given at initialization"
            )));
        }
        let entries: usize = data.values().map(|d| d.len()).sum();
        self.design_specification = DVector::zeros(entries);
        for entry in data.values_mut() {
            entry.ensure_old_columns(1);
        }
        Ok(())
    }

    pub fn perform(&mut self, data: &mut DataMap) -> Result<()> {
        let omega = self.relaxation;
        let one_minus_omega = 1.0 - omega;
        for entry in data.values_mut() {
            let old = entry.old_values.column(0).clone_owned();
            let mut values = entry.values_mut();
            *values *= omega;
            values.axpy(one_minus_omega, &old, 1.0);
        }
        Ok(())
    }

    pub fn iterations_converged(&mut self, _data: &mut DataMap) -> Result<()> {
        Ok(())
    }

    pub fn set_design_specification(&mut self, q: &DVector<f64>) -> Result<()> {
        self.design_specification = q.clone();
        if q.iter().any(|x| *x != 0.0) {
            return Err(Error::NotImplemented(
                "design specification for constant relaxation".into(),
            ));
        }
        Ok(())
    }
}
