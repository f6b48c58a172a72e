//! Staggered (Gauss-Seidel) coupling of two participants.
//!
//! The first participant computes a step and sends; the second computes with
//! that fresh data and sends back. The second participant is the controller:
//! it measures convergence, runs the acceleration on its send data, and its
//! verdict drives both sides. To make the stagger work, the second
//! participant receives the partner's data for its *next* compute at the end
//! of each advance (and once during initialization).

use crate::actions;
use crate::error::{Error, Result};
use crate::scheme::CouplingScheme;
use crate::scheme::base::{CouplingMode, SchemeCore};
use tracing::debug;

pub struct SerialCouplingScheme {
    pub core: SchemeCore,
}

impl SerialCouplingScheme {
    pub fn new(core: SchemeCore) -> Self {
        Self { core }
    }

    fn explicit_advance(&mut self) -> Result<()> {
        self.core.send_all_data()?;
        if self.core.does_first_step() {
            self.core.receive_all_data()?;
            self.core.finish_advance(true);
        } else {
            self.core.finish_advance(true);
            // The partner's data for the next step; at the end of the run
            // there is nothing more to receive.
            if self.core.is_coupling_ongoing() {
                self.core.receive_all_data()?;
            }
        }
        self.core.data_exchanged = true;
        Ok(())
    }

    fn implicit_advance(&mut self) -> Result<()> {
        let converged;
        if self.core.does_first_step() {
            self.core.send_all_data()?;
            let (conv, _complete, _dt) = self.core.receive_verdict()?;
            self.core.receive_all_data()?;
            converged = conv;
            self.core.finish_advance(converged);
        } else {
            let mut conv = self.core.measure_convergence()?;
            if self.core.iterations >= self.core.max_iterations {
                debug!("iteration limit reached, forcing completion");
                conv = true;
            }
            if conv {
                self.accelerate_send_data(|acc, data| acc.iterations_converged(data))?;
            } else {
                self.accelerate_send_data(|acc, data| acc.perform(data))?;
            }
            self.core.send_verdict(conv, conv)?;
            self.core.send_all_data()?;
            converged = conv;
            self.core.finish_advance(converged);
            // Pair with the partner's next send; on convergence that send
            // only exists while the coupling is ongoing.
            if !converged || self.core.is_coupling_ongoing() {
                self.core.receive_all_data()?;
            }
        }
        self.core.data_exchanged = true;
        Ok(())
    }

    /// Run the acceleration over the send data only; in a staggered scheme
    /// the received data already is the partner's accelerated iterate.
    fn accelerate_send_data(
        &mut self,
        f: impl FnOnce(
            &mut crate::accel::Acceleration,
            &mut crate::scheme::data::DataMap,
        ) -> Result<()>,
    ) -> Result<()> {
        let Some(mut acceleration) = self.core.acceleration.take() else {
            return Ok(());
        };
        let ids: Vec<_> = self.core.sends.iter().map(|e| e.data_id).collect();
        let mut send_data = crate::scheme::data::DataMap::new();
        for id in &ids {
            if let Some(entry) = self.core.data.remove(id) {
                send_data.insert(*id, entry);
            }
        }
        let result = f(&mut acceleration, &mut send_data);
        self.core.data.append(&mut send_data);
        self.core.acceleration = Some(acceleration);
        result
    }
}

impl CouplingScheme for SerialCouplingScheme {
    fn initialize(&mut self, start_time: f64, start_timestep: usize) -> Result<()> {
        if self.core.initialized {
            return Err(Error::usage("the coupling scheme is already initialized"));
        }
        self.core.time = start_time;
        self.core.timesteps = start_timestep;
        if self.core.mode == CouplingMode::Implicit
            && (self.core.sends.is_empty() || self.core.receives.is_empty())
        {
            return Err(Error::config(
                "an implicit serial coupling scheme has to send and receive data",
            ));
        }
        self.core.setup_data_and_actions()?;
        if self.core.does_first_step() && self.core.has_to_send_init_data {
            return Err(Error::config(
                "in a serial coupling scheme only the second participant can provide \
                 initial data",
            ));
        }
        if self.core.is_controller() {
            self.accelerate_send_data(|acc, data| acc.initialize(data))?;
        }
        self.core.initialized = true;
        // The second participant computes with the partner's fresh data, so
        // its first receive happens right here unless it waits for initial
        // data first.
        if !self.core.does_first_step()
            && !self.core.has_to_send_init_data
            && !self.core.has_to_receive_init_data
        {
            self.core.receive_all_data()?;
            self.core.store_iterations();
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.core.initialized
    }

    fn initialize_data(&mut self) -> Result<()> {
        self.core.check_initialized()?;
        if !self.core.has_to_send_init_data && !self.core.has_to_receive_init_data {
            return Ok(());
        }
        if self.core.has_to_send_init_data
            && self.core.is_action_required(actions::WRITE_INITIAL_DATA)
        {
            return Err(Error::usage(
                "initial data has to be written before initialize_data is called",
            ));
        }
        if self.core.has_to_receive_init_data {
            self.core.receive_all_data()?;
        }
        if self.core.has_to_send_init_data {
            self.core.send_all_data()?;
            // Now the regular staggered pre-receive.
            self.core.receive_all_data()?;
        }
        self.core.store_iterations();
        self.core.initialize_data_done = true;
        Ok(())
    }

    fn add_computed_time(&mut self, dt: f64) -> Result<()> {
        self.core.add_computed_time(dt)
    }

    fn advance(&mut self) -> Result<()> {
        self.core.check_initialized()?;
        self.core.check_completeness_required_actions()?;
        if (self.core.has_to_send_init_data || self.core.has_to_receive_init_data)
            && !self.core.initialize_data_done
        {
            return Err(Error::usage(
                "initial data is configured but initialize_data was never called",
            ));
        }
        self.core.data_exchanged = false;
        self.core.timestep_complete = false;
        if self.core.subcycling() {
            return Ok(());
        }
        match self.core.mode {
            CouplingMode::Explicit => self.explicit_advance(),
            CouplingMode::Implicit => self.implicit_advance(),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        self.core.finalize()
    }

    fn is_coupling_ongoing(&self) -> bool {
        self.core.is_coupling_ongoing()
    }

    fn is_coupling_timestep_complete(&self) -> bool {
        self.core.timestep_complete
    }

    fn has_data_been_exchanged(&self) -> bool {
        self.core.data_exchanged
    }

    fn is_action_required(&self, action: &str) -> bool {
        self.core.is_action_required(action)
    }

    fn performed_action(&mut self, action: &str) -> Result<()> {
        self.core.performed_action(action)
    }

    fn time(&self) -> f64 {
        self.core.time
    }

    fn timesteps(&self) -> usize {
        self.core.timesteps
    }

    fn next_timestep_max_length(&self) -> f64 {
        self.core.next_timestep_max_length()
    }

    fn will_data_be_exchanged(&self, last_solver_dt: f64) -> bool {
        self.core.will_data_be_exchanged(last_solver_dt)
    }
}
