//! Coupling of more than two participants through one controller.
//!
//! One distinguished participant, the controller, holds a link to every
//! other participant. Within one implicit iteration the controller receives
//! from everyone, measures convergence globally, runs one combined
//! acceleration over all coupled data, and distributes the verdict and the
//! accelerated data back. The non-controllers behave like the first
//! participant of a parallel scheme with the controller as their peer.

use crate::actions;
use crate::error::{Error, Result};
use crate::m2n::M2N;
use crate::scheme::CouplingScheme;
use crate::scheme::base::{Exchange, SchemeCore};
use crate::scheme::data::CouplingData;
use crate::mesh::{DataId, MeshId};
use tracing::debug;

/// One partner link of the controller (or the single link of a
/// non-controller).
pub struct PartnerLink {
    pub m2n: M2N,
    sends: Vec<Exchange>,
    receives: Vec<Exchange>,
}

impl PartnerLink {
    pub fn new(m2n: M2N) -> Self {
        Self {
            m2n,
            sends: Vec::new(),
            receives: Vec::new(),
        }
    }
}

pub struct MultiCouplingScheme {
    pub core: SchemeCore,
    links: Vec<PartnerLink>,
    controller: bool,
}

impl MultiCouplingScheme {
    pub fn new(core: SchemeCore, links: Vec<PartnerLink>, controller: bool) -> Result<Self> {
        if controller && links.is_empty() {
            return Err(Error::config(
                "the controller of a multi coupling needs at least one partner",
            ));
        }
        if !controller && links.len() != 1 {
            return Err(Error::config(
                "a non-controlling participant of a multi coupling has exactly one link",
            ));
        }
        Ok(Self {
            core,
            links,
            controller,
        })
    }

    /// Register a field sent over the given partner link.
    pub fn add_data_to_send(
        &mut self,
        link: usize,
        data: CouplingData,
        data_id: DataId,
        mesh_id: MeshId,
    ) {
        self.links[link].sends.push(Exchange { data_id, mesh_id });
        self.core.data.insert(data_id, data);
    }

    /// Register a field received over the given partner link.
    pub fn add_data_to_receive(
        &mut self,
        link: usize,
        data: CouplingData,
        data_id: DataId,
        mesh_id: MeshId,
    ) {
        self.links[link].receives.push(Exchange { data_id, mesh_id });
        self.core.data.insert(data_id, data);
    }

    fn send_link_data(&self, link: &PartnerLink) -> Result<()> {
        for exchange in &link.sends {
            let entry = &self.core.data[&exchange.data_id];
            let values = entry.values();
            link.m2n
                .send(values.as_slice(), exchange.mesh_id, entry.dimensions)?;
        }
        Ok(())
    }

    fn receive_link_data(&mut self, index: usize) -> Result<()> {
        let link = &self.links[index];
        for exchange in &link.receives {
            let entry = &self.core.data[&exchange.data_id];
            let dims = entry.dimensions;
            let mut values = entry.values_mut();
            link.m2n
                .receive(values.as_mut_slice(), exchange.mesh_id, dims)?;
        }
        self.core.data_exchanged = true;
        Ok(())
    }

    fn implicit_advance(&mut self) -> Result<()> {
        let converged;
        if self.controller {
            for index in 0..self.links.len() {
                self.receive_link_data(index)?;
            }
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
            for link in &self.links {
                if self.core.group.is_master() {
                    link.m2n.send_bool(conv)?;
                    link.m2n.send_bool(conv)?;
                    link.m2n.send_f64(self.core.timestep_length)?;
                }
                self.send_link_data(link)?;
            }
            converged = conv;
        } else {
            self.send_link_data(&self.links[0])?;
            let mut conv = false;
            if self.core.group.is_master() {
                conv = self.links[0].m2n.receive_bool()?;
                let _complete = self.links[0].m2n.receive_bool()?;
                let _next_dt = self.links[0].m2n.receive_f64()?;
            }
            conv = self.core.group.broadcast_bool(conv)?;
            self.receive_link_data(0)?;
            converged = conv;
        }
        self.core.finish_advance(converged);
        self.core.data_exchanged = true;
        Ok(())
    }
}

impl CouplingScheme for MultiCouplingScheme {
    fn initialize(&mut self, start_time: f64, start_timestep: usize) -> Result<()> {
        if self.core.initialized {
            return Err(Error::usage("the coupling scheme is already initialized"));
        }
        self.core.time = start_time;
        self.core.timesteps = start_timestep;
        // The per-link exchanges feed the shared action negotiation.
        self.core.sends = self.links.iter().flat_map(|l| l.sends.clone()).collect();
        self.core.receives = self.links.iter().flat_map(|l| l.receives.clone()).collect();
        self.core.setup_data_and_actions()?;
        if self.controller {
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
        if self.controller {
            if self.core.has_to_receive_init_data {
                for index in 0..self.links.len() {
                    self.receive_link_data(index)?;
                }
            }
            if self.core.has_to_send_init_data {
                for link in &self.links {
                    self.send_link_data(link)?;
                }
            }
        } else {
            if self.core.has_to_send_init_data {
                self.send_link_data(&self.links[0])?;
            }
            if self.core.has_to_receive_init_data {
                self.receive_link_data(0)?;
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
        self.implicit_advance()
    }

    fn finalize(&mut self) -> Result<()> {
        self.core.check_initialized()?;
        if let Some(acceleration) = self.core.acceleration.as_mut() {
            acceleration.close();
        }
        for link in &mut self.links {
            link.m2n.close();
        }
        Ok(())
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
