//! Machinery shared by the concrete coupling schemes.
//!
//! [`SchemeCore`] owns everything a two-participant scheme needs: the time
//! and iteration bookkeeping, the coupled data with exchange directions, the
//! required-action set, convergence measures, and the optional acceleration.
//! The concrete schemes differ only in the order of their sends and receives
//! and in which data the acceleration sees, so their `advance`
//! implementations stay short.

use crate::accel::Acceleration;
use crate::actions;
use crate::com::group::GroupComm;
use crate::error::{Error, Result};
use crate::m2n::M2N;
use crate::mesh::{DataId, MeshId};
use crate::scheme::convergence::{MeasureEntry, combined_verdict};
use crate::scheme::data::{CouplingData, DataMap};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Explicit schemes run one iteration per step; implicit schemes iterate to
/// convergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CouplingMode {
    Explicit,
    Implicit,
}

/// Tolerance for "the solver has computed the full coupling step".
pub(crate) const TIME_EPS: f64 = 1e-10;

/// An exchanged field: which data, on which mesh, which way.
#[derive(Clone, Copy, Debug)]
pub struct Exchange {
    pub data_id: DataId,
    pub mesh_id: MeshId,
}

pub struct SchemeCore {
    pub first_participant: String,
    pub second_participant: String,
    pub local_participant: String,
    pub mode: CouplingMode,
    pub group: Arc<GroupComm>,
    pub m2n: Option<M2N>,

    pub max_time: f64,
    pub max_timesteps: usize,
    pub timestep_length: f64,
    pub max_iterations: usize,
    pub extrapolation_order: usize,

    pub time: f64,
    pub timesteps: usize,
    pub iterations: usize,
    pub total_iterations: usize,
    pub computed_timestep_part: f64,

    pub data: DataMap,
    pub sends: Vec<Exchange>,
    pub receives: Vec<Exchange>,

    pub measures: Vec<MeasureEntry>,
    pub acceleration: Option<Acceleration>,

    required_actions: HashSet<&'static str>,
    controller_role: bool,
    pub initialized: bool,
    pub timestep_complete: bool,
    pub data_exchanged: bool,
    pub has_to_send_init_data: bool,
    pub has_to_receive_init_data: bool,
    pub initialize_data_done: bool,
}

impl SchemeCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        max_time: f64,
        max_timesteps: usize,
        timestep_length: f64,
        first_participant: &str,
        second_participant: &str,
        local_participant: &str,
        m2n: M2N,
        mode: CouplingMode,
        max_iterations: usize,
        group: Arc<GroupComm>,
    ) -> Result<Self> {
        if first_participant == second_participant {
            return Err(Error::config(
                "first and second participant of a coupling scheme must differ",
            ));
        }
        if local_participant != first_participant && local_participant != second_participant {
            return Err(Error::config(format!(
                "local participant \"{local_participant}\" is not part of this coupling scheme"
            )));
        }
        if timestep_length <= 0.0 {
            return Err(Error::config("timestep length has to be positive"));
        }
        if mode == CouplingMode::Implicit && max_iterations == 0 {
            return Err(Error::config("max-iterations has to be at least 1"));
        }
        Ok(Self {
            first_participant: first_participant.to_string(),
            second_participant: second_participant.to_string(),
            local_participant: local_participant.to_string(),
            mode,
            group,
            m2n: Some(m2n),
            max_time,
            max_timesteps,
            timestep_length,
            max_iterations,
            extrapolation_order: 0,
            time: 0.0,
            timesteps: 0,
            iterations: 1,
            total_iterations: 1,
            computed_timestep_part: 0.0,
            data: DataMap::new(),
            sends: Vec::new(),
            receives: Vec::new(),
            measures: Vec::new(),
            acceleration: None,
            required_actions: HashSet::new(),
            controller_role: local_participant == second_participant,
            initialized: false,
            timestep_complete: false,
            data_exchanged: false,
            has_to_send_init_data: false,
            has_to_receive_init_data: false,
            initialize_data_done: false,
        })
    }

    pub fn does_first_step(&self) -> bool {
        self.local_participant == self.first_participant
    }

    /// Register a field this participant sends through the scheme.
    pub fn add_data_to_send(&mut self, data: CouplingData, data_id: DataId, mesh_id: MeshId) {
        self.sends.push(Exchange { data_id, mesh_id });
        self.data.insert(data_id, data);
    }

    /// Register a field this participant receives through the scheme.
    pub fn add_data_to_receive(&mut self, data: CouplingData, data_id: DataId, mesh_id: MeshId) {
        self.receives.push(Exchange { data_id, mesh_id });
        self.data.insert(data_id, data);
    }

    pub fn add_convergence_measure(&mut self, entry: MeasureEntry) {
        self.measures.push(entry);
    }

    pub fn set_acceleration(&mut self, acceleration: Acceleration) {
        self.acceleration = Some(acceleration);
    }

    // --- time bookkeeping ---------------------------------------------------

    pub fn is_coupling_ongoing(&self) -> bool {
        let time_left = self.max_time.is_infinite() || self.max_time - self.time > TIME_EPS;
        let steps_left = self.timesteps <= self.max_timesteps;
        time_left && steps_left
    }

    pub fn this_timestep_remainder(&self) -> f64 {
        self.timestep_length - self.computed_timestep_part
    }

    pub fn next_timestep_max_length(&self) -> f64 {
        let remainder = self.this_timestep_remainder();
        if remainder.abs() <= TIME_EPS {
            self.timestep_length
        } else {
            remainder
        }
    }

    pub fn will_data_be_exchanged(&self, last_solver_dt: f64) -> bool {
        self.this_timestep_remainder() - last_solver_dt <= TIME_EPS
    }

    pub fn add_computed_time(&mut self, dt: f64) -> Result<()> {
        self.check_initialized()?;
        if dt <= 0.0 {
            return Err(Error::usage("computed time has to be larger than zero"));
        }
        if dt > self.this_timestep_remainder() + TIME_EPS {
            return Err(Error::usage(format!(
                "computed time {dt} exceeds the remainder {} of the coupling step",
                self.this_timestep_remainder()
            )));
        }
        self.computed_timestep_part += dt;
        self.time += dt;
        Ok(())
    }

    pub fn subcycling(&self) -> bool {
        self.this_timestep_remainder().abs() > TIME_EPS
    }

    pub fn check_initialized(&self) -> Result<()> {
        if !self.initialized {
            return Err(Error::usage("the coupling scheme is not initialized"));
        }
        Ok(())
    }

    // --- actions ------------------------------------------------------------

    pub fn require_action(&mut self, action: &'static str) {
        self.required_actions.insert(action);
    }

    pub fn is_action_required(&self, action: &str) -> bool {
        self.required_actions.contains(action)
    }

    pub fn performed_action(&mut self, action: &str) -> Result<()> {
        if !self.required_actions.remove(action) {
            return Err(Error::usage(format!(
                "action \"{action}\" was acknowledged but never required"
            )));
        }
        Ok(())
    }

    /// Every required action must be acknowledged before the next advance.
    pub fn check_completeness_required_actions(&self) -> Result<()> {
        if let Some(action) = self.required_actions.iter().next() {
            return Err(Error::Protocol(format!(
                "required action \"{action}\" was not performed by the solver"
            )));
        }
        Ok(())
    }

    // --- data plumbing ------------------------------------------------------

    fn m2n(&self) -> Result<&M2N> {
        self.m2n
            .as_ref()
            .ok_or_else(|| Error::usage("the coupling scheme was finalized"))
    }

    pub fn send_all_data(&self) -> Result<()> {
        let m2n = self.m2n()?;
        for exchange in &self.sends {
            let entry = &self.data[&exchange.data_id];
            let values = entry.values();
            m2n.send(values.as_slice(), exchange.mesh_id, entry.dimensions)?;
        }
        Ok(())
    }

    pub fn receive_all_data(&mut self) -> Result<()> {
        let m2n = self
            .m2n
            .as_ref()
            .ok_or_else(|| Error::usage("the coupling scheme was finalized"))?;
        for exchange in &self.receives {
            let entry = &self.data[&exchange.data_id];
            let dims = entry.dimensions;
            let mut values = entry.values_mut();
            m2n.receive(values.as_mut_slice(), exchange.mesh_id, dims)?;
        }
        self.data_exchanged = true;
        Ok(())
    }

    /// Master-to-master verdict exchange, fanned out to the local group.
    pub fn send_verdict(&self, converged: bool, complete: bool) -> Result<()> {
        if self.group.is_master() {
            let m2n = self.m2n()?;
            m2n.send_bool(converged)?;
            m2n.send_bool(complete)?;
            m2n.send_f64(self.timestep_length)?;
        }
        Ok(())
    }

    pub fn receive_verdict(&self) -> Result<(bool, bool, f64)> {
        let (mut converged, mut complete, mut dt) = (false, false, self.timestep_length);
        if self.group.is_master() {
            let m2n = self.m2n()?;
            converged = m2n.receive_bool()?;
            complete = m2n.receive_bool()?;
            dt = m2n.receive_f64()?;
        }
        let converged = self.group.broadcast_bool(converged)?;
        let complete = self.group.broadcast_bool(complete)?;
        let dt = self.group.broadcast_f64(dt)?;
        Ok((converged, complete, dt))
    }

    // --- convergence and acceleration ---------------------------------------

    /// Run every configured measure against the current iterate and combine
    /// the verdicts.
    pub fn measure_convergence(&mut self) -> Result<bool> {
        let data = &self.data;
        for entry in self.measures.iter_mut() {
            let coupled = data.get(&entry.data_id).ok_or_else(|| {
                Error::config(format!(
                    "convergence measure references unknown data {}",
                    entry.data_id
                ))
            })?;
            let old = coupled.old_values.column(0).clone_owned();
            let new = coupled.values().clone_owned();
            entry.measure(&old, &new, self.iterations, &self.group)?;
        }
        let verdict = combined_verdict(&self.measures);
        debug!(
            iteration = self.iterations,
            converged = verdict,
            "combined convergence verdict"
        );
        Ok(verdict)
    }

    pub fn reset_convergence_measures(&mut self) {
        for entry in self.measures.iter_mut() {
            entry.new_timestep();
        }
    }

    /// Remember the current iterate as the reference for the next one.
    pub fn store_iterations(&mut self) {
        for entry in self.data.values_mut() {
            entry.store_iteration();
        }
    }

    /// Finish a time step for all coupled data: shift the history and
    /// produce the extrapolated initial guess for the next step.
    pub fn complete_timestep_data(&mut self) {
        for entry in self.data.values_mut() {
            entry.shift_old_values();
        }
        if self.extrapolation_order >= 1 && self.timesteps >= 2 {
            for exchange in &self.sends {
                let entry = self.data.get_mut(&exchange.data_id).unwrap();
                let c0 = entry.old_values.column(0).clone_owned();
                let c1 = entry.old_values.column(1).clone_owned();
                let prediction = if self.extrapolation_order >= 2 && self.timesteps >= 3 {
                    let c2 = entry.old_values.column(2).clone_owned();
                    c0 * 2.5 - c1 * 2.0 + c2 * 0.5
                } else {
                    &c0 * 2.0 - &c1
                };
                entry.values_mut().copy_from(&prediction);
            }
        }
    }

    /// Common setup: size the old-value histories, wire up the acceleration
    /// and the initial-data negotiation, declare the first actions.
    pub fn setup_data_and_actions(&mut self) -> Result<()> {
        let old_columns = self.extrapolation_order + 1;
        for entry in self.data.values_mut() {
            entry.ensure_old_columns(old_columns);
        }
        if self.mode == CouplingMode::Implicit {
            if self.is_controller() && self.measures.is_empty() {
                return Err(Error::config(
                    "an implicit coupling scheme needs at least one convergence measure",
                ));
            }
            self.require_action(actions::WRITE_ITERATION_CHECKPOINT);
        }
        self.has_to_send_init_data = self
            .sends
            .iter()
            .any(|e| self.data[&e.data_id].initialize);
        self.has_to_receive_init_data = self
            .receives
            .iter()
            .any(|e| self.data[&e.data_id].initialize);
        if self.has_to_send_init_data {
            self.require_action(actions::WRITE_INITIAL_DATA);
        }
        Ok(())
    }

    /// The participant that measures convergence and runs the acceleration.
    pub fn is_controller(&self) -> bool {
        self.controller_role
    }

    /// A core for the multi-participant scheme: no single peer link, the
    /// controller role given explicitly. The scheme manages its own links.
    pub fn new_multi(
        max_time: f64,
        max_timesteps: usize,
        timestep_length: f64,
        local_participant: &str,
        controller: bool,
        max_iterations: usize,
        group: Arc<GroupComm>,
    ) -> Result<Self> {
        if timestep_length <= 0.0 {
            return Err(Error::config("timestep length has to be positive"));
        }
        if max_iterations == 0 {
            return Err(Error::config("max-iterations has to be at least 1"));
        }
        Ok(Self {
            first_participant: String::new(),
            second_participant: String::new(),
            local_participant: local_participant.to_string(),
            mode: CouplingMode::Implicit,
            group,
            m2n: None,
            max_time,
            max_timesteps,
            timestep_length,
            max_iterations,
            extrapolation_order: 0,
            time: 0.0,
            timesteps: 0,
            iterations: 1,
            total_iterations: 1,
            computed_timestep_part: 0.0,
            data: DataMap::new(),
            sends: Vec::new(),
            receives: Vec::new(),
            measures: Vec::new(),
            acceleration: None,
            required_actions: HashSet::new(),
            controller_role: controller,
            initialized: false,
            timestep_complete: false,
            data_exchanged: false,
            has_to_send_init_data: false,
            has_to_receive_init_data: false,
            initialize_data_done: false,
        })
    }

    /// Book-keeping shared by every advance once the exchange is done.
    pub fn finish_advance(&mut self, converged: bool) {
        if converged {
            self.timesteps += 1;
            self.timestep_complete = true;
            self.iterations = 1;
            self.complete_timestep_data();
            self.reset_convergence_measures();
            if self.mode == CouplingMode::Implicit && self.is_coupling_ongoing() {
                self.require_action(actions::WRITE_ITERATION_CHECKPOINT);
            }
        } else {
            self.iterations += 1;
            self.timestep_complete = false;
            self.store_iterations();
            self.require_action(actions::READ_ITERATION_CHECKPOINT);
            // The step is repeated, so the solver's progress rolls back with
            // the checkpoint.
            self.time -= self.computed_timestep_part;
        }
        self.total_iterations += 1;
        self.computed_timestep_part = 0.0;
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.check_initialized()?;
        if let Some(acceleration) = self.acceleration.as_mut() {
            acceleration.close();
        }
        if let Some(mut m2n) = self.m2n.take() {
            m2n.close();
        }
        Ok(())
    }
}
