//! Parallel (Jacobi) coupling of two participants.
//!
//! Both participants compute simultaneously from the previous iterate and
//! exchange within the same sub-step. The second participant is the
//! controller; in the implicit variant it runs the convergence measures and
//! a combined acceleration over all coupled data, send and receive alike.

use crate::actions;
use crate::error::{Error, Result};
use crate::scheme::CouplingScheme;
use crate::scheme::base::{CouplingMode, SchemeCore};
use tracing::debug;

pub struct ParallelCouplingScheme {
    pub core: SchemeCore,
}

impl ParallelCouplingScheme {
    pub fn new(core: SchemeCore) -> Self {
        Self { core }
    }

    fn explicit_advance(&mut self) -> Result<()> {
        if self.core.does_first_step() {
            self.core.send_all_data()?;
            self.core.receive_all_data()?;
        } else {
            self.core.receive_all_data()?;
            self.core.send_all_data()?;
        }
        self.core.finish_advance(true);
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
        } else {
            self.core.receive_all_data()?;
            let mut conv = self.core.measure_convergence()?;
            if self.core.iterations >= self.core.max_iterations {
                debug!("iteration limit reached, forcing completion");
                conv = true;
            }
            if let Some(mut acceleration) = self.core.acceleration.take() {
                let result = if conv {
                    acceleration.iterations_converged(&mut self.core.data)
                } else {
                    acceleration.perform(&mut self.core.data)
                };
                self.core.acceleration = Some(acceleration);
                result?;
            }
            self.core.send_verdict(conv, conv)?;
            self.core.send_all_data()?;
            converged = conv;
        }
        self.core.finish_advance(converged);
        self.core.data_exchanged = true;
        Ok(())
    }
}

impl CouplingScheme for ParallelCouplingScheme {
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
                "an implicit parallel coupling scheme has to send and receive data",
            ));
        }
        self.core.setup_data_and_actions()?;
        if self.core.is_controller() {
            if let Some(mut acceleration) = self.core.acceleration.take() {
                let result = acceleration.initialize(&mut self.core.data);
                self.core.acceleration = Some(acceleration);
                result?;
            }
        }
        self.core.initialized = true;
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
        if self.core.does_first_step() {
            if self.core.has_to_send_init_data {
                self.core.send_all_data()?;
            }
            if self.core.has_to_receive_init_data {
                self.core.receive_all_data()?;
            }
        } else {
            if self.core.has_to_receive_init_data {
                self.core.receive_all_data()?;
            }
            if self.core.has_to_send_init_data {
                self.core.send_all_data()?;
            }
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
