//! Hierarchical Aitken under-relaxation for 1-D interfaces.
//!
//! The interface values are transformed into a binary hierarchical basis
//! (every node stores its offset from the mean of its two level-parents),
//! one Aitken factor is estimated and applied per level, and the result is
//! transformed back. This only works when the interface has `2^L + 1`
//! entries; any other length is rejected at initialization.

use crate::error::{Error, Result};
use crate::mesh::DataId;
use crate::scheme::data::DataMap;
use nalgebra::DVector;
use tracing::debug;

pub struct HierarchicalAitken {
    initial_relaxation: f64,
    data_ids: Vec<DataId>,
    aitken_factors: Vec<f64>,
    iteration: usize,
    /// Residual of the previous iteration; starts out at MAX so the first
    /// secant never fires.
    residual: DVector<f64>,
    design_specification: DVector<f64>,
}

impl HierarchicalAitken {
    pub fn new(initial_relaxation: f64, data_ids: Vec<DataId>) -> Result<Self> {
        if !(initial_relaxation > 0.0 && initial_relaxation <= 1.0) {
            return Err(Error::config(
                "initial relaxation factor for hierarchical aitken relaxation has to be \
                 larger than zero and smaller or equal than one",
            ));
        }
        Ok(Self {
            initial_relaxation,
            data_ids,
            aitken_factors: Vec::new(),
            iteration: 0,
            residual: DVector::zeros(0),
            design_specification: DVector::zeros(0),
        })
    }

    pub fn data_ids(&self) -> &[DataId] {
        &self.data_ids
    }

    pub fn initialize(&mut self, data: &mut DataMap) -> Result<()> {
        let first = self.data_ids.first().ok_or_else(|| {
            Error::config("hierarchical aitken relaxation needs at least one data field")
        })?;
        let entries = data
            .get(first)
            .ok_or_else(|| {
                Error::config(format!(
                    "data {first} is not contained in data given at initialization"
                ))
            })?
            .len();

        // The hierarchy covers the two boundary entries plus 2^l interior
        // entries per level; anything that does not add up is rejected.
        self.aitken_factors = vec![self.initial_relaxation]; // boundary level
        let mut entries_current_level = 1usize;
        let mut total_entries = 2usize;
        while total_entries < entries {
            self.aitken_factors.push(self.initial_relaxation);
            total_entries += entries_current_level;
            entries_current_level *= 2;
        }
        if total_entries != entries {
            return Err(Error::Numerical(format!(
                "hierarchical aitken relaxation needs an interface of 2^L + 1 values, \
                 got {entries}"
            )));
        }
        self.residual = DVector::from_element(entries, f64::MAX);
        self.design_specification = DVector::zeros(entries);
        for entry in data.values_mut() {
            entry.ensure_old_columns(1);
        }
        Ok(())
    }

    pub fn perform(&mut self, data: &mut DataMap) -> Result<()> {
        let first = self.data_ids[0];
        let mut values = data[&first].values().clone_owned();
        let mut old_values = data[&first].old_values.column(0).clone_owned();

        let residual = &values - &old_values;
        let mut residual_delta = &residual - &self.residual;

        let levels = self.aitken_factors.len();
        let entries = residual.len();
        let mut nominators = vec![0.0; levels];
        let mut denominators = vec![0.0; levels];

        // Hierarchize: from the finest level down, replace every interior
        // entry by its offset from the mean of its two neighbours at the
        // next coarser level.
        let mut entries_current_level = 1usize << (levels.saturating_sub(2));
        for level in (1..levels).rev() {
            let stepsize = (entries - 1) >> (level - 1);
            let half = stepsize / 2;
            let mut index = half;
            for _ in 0..entries_current_level {
                self.residual[index] -= (self.residual[index - half] + self.residual[index + half]) / 2.0;
                residual_delta[index] -= (residual_delta[index - half] + residual_delta[index + half]) / 2.0;
                values[index] -= (values[index - half] + values[index + half]) / 2.0;
                old_values[index] -= (old_values[index - half] + old_values[index + half]) / 2.0;
                index += stepsize;
            }
            entries_current_level /= 2;
        }

        // Boundary level: the two end points share one factor.
        nominators[0] = self.residual[0] * residual_delta[0]
            + self.residual[entries - 1] * residual_delta[entries - 1];
        denominators[0] = residual_delta[0] * residual_delta[0]
            + residual_delta[entries - 1] * residual_delta[entries - 1];
        self.compute_aitken_factor(0, nominators[0], denominators[0]);
        let omega = self.aitken_factors[0];
        for entry in data.values_mut() {
            let old = entry.old_values.column(0).clone_owned();
            let mut v = entry.values_mut();
            v[0] = v[0] * omega + old[0] * (1.0 - omega);
            v[entries - 1] = v[entries - 1] * omega + old[entries - 1] * (1.0 - omega);
        }
        values[0] = values[0] * omega + old_values[0] * (1.0 - omega);
        values[entries - 1] = values[entries - 1] * omega + old_values[entries - 1] * (1.0 - omega);

        // Interior levels, coarse to fine.
        let mut entries_current_level = 1usize;
        for level in 1..levels {
            let stepsize = (entries - 1) >> (level - 1);
            let half = stepsize / 2;
            let mut index = half;
            for _ in 0..entries_current_level {
                nominators[level] += self.residual[index] * residual_delta[index];
                denominators[level] += residual_delta[index] * residual_delta[index];
                index += stepsize;
            }
            self.compute_aitken_factor(level, nominators[level], denominators[level]);
            let omega = self.aitken_factors[level];
            let mut index = half;
            for _ in 0..entries_current_level {
                values[index] = values[index] * omega + old_values[index] * (1.0 - omega);
                index += stepsize;
            }
            entries_current_level *= 2;
        }
        debug!(factors = ?self.aitken_factors, "level-wise aitken factors");

        self.residual = residual;

        // Dehierarchize the relaxed values, coarse to fine.
        let mut entries_current_level = 1usize;
        for level in 1..levels {
            let stepsize = (entries - 1) >> (level - 1);
            let half = stepsize / 2;
            let mut index = half;
            for _ in 0..entries_current_level {
                values[index] += (values[index - half] + values[index + half]) / 2.0;
                old_values[index] += (old_values[index - half] + old_values[index + half]) / 2.0;
                index += stepsize;
            }
            entries_current_level *= 2;
        }

        {
            let entry = data.get_mut(&first).unwrap();
            let mut v = entry.values_mut();
            for i in 1..entries - 1 {
                v[i] = values[i];
            }
        }
        self.iteration += 1;
        Ok(())
    }

    pub fn iterations_converged(&mut self, _data: &mut DataMap) -> Result<()> {
        self.iteration = 0;
        self.residual = DVector::from_element(self.residual.len(), f64::MAX);
        Ok(())
    }

    fn compute_aitken_factor(&mut self, level: usize, nominator: f64, denominator: f64) {
        if self.iteration == 0 {
            self.aitken_factors[level] = self.aitken_factors[level].signum()
                * self.initial_relaxation.min(self.aitken_factors[level].abs());
        } else if denominator.sqrt() == 0.0 {
            self.aitken_factors[level] = 1.0;
        } else {
            self.aitken_factors[level] = -self.aitken_factors[level] * (nominator / denominator);
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::data::CouplingData;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn field(values: &[f64], old: &[f64]) -> DataMap {
        let v = Rc::new(RefCell::new(DVector::from_row_slice(values)));
        let mut entry = CouplingData::new(v, 1, false);
        entry.ensure_old_columns(1);
        entry
            .old_values
            .set_column(0, &DVector::from_row_slice(old));
        let mut data = DataMap::new();
        data.insert(0, entry);
        data
    }

    #[test]
    fn rejects_non_power_of_two_interfaces() {
        let mut data = field(&[0.0; 6], &[0.0; 6]);
        let mut pp = HierarchicalAitken::new(0.5, vec![0]).unwrap();
        assert!(matches!(pp.initialize(&mut data), Err(Error::Numerical(_))));
    }

    #[test]
    fn first_iteration_relaxes_with_the_initial_factor() {
        // 5 = 2^2 + 1 entries; first iteration must reduce to plain
        // constant relaxation because every level clamps to the initial
        // factor and the transform is linear.
        let values = [2.0, 4.0, 6.0, 4.0, 2.0];
        let old = [1.0, 1.0, 1.0, 1.0, 1.0];
        let mut data = field(&values, &old);
        let mut pp = HierarchicalAitken::new(0.25, vec![0]).unwrap();
        pp.initialize(&mut data).unwrap();
        pp.perform(&mut data).unwrap();
        for (i, (&v, &o)) in values.iter().zip(old.iter()).enumerate() {
            let expected = o + 0.25 * (v - o);
            assert!(
                (data[&0].values()[i] - expected).abs() < 1e-13,
                "entry {i}"
            );
        }
    }
}
