//! Composition of several coupling schemes into one.
//!
//! A participant that couples with more than one partner through otherwise
//! independent schemes drives them as a single scheme. The composition
//! advances its sub-schemes through an *active window*: the window covers
//! the leading run of explicit schemes plus the following run of implicit
//! ones. While any scheme in the window still iterates, schemes behind the
//! window wait, and schemes inside the window that already completed their
//! step are put on hold. Once the whole window has completed, the window
//! moves on, and freshly activated schemes catch up with the stored solver
//! time within the same `advance` call.
//!
//! Whether a scheme iterates is probed the way a solver would: does it
//! currently require the write-iteration checkpoint?

use crate::actions;
use crate::error::{Error, Result};
use crate::scheme::CouplingScheme;
use tracing::debug;

struct Slot {
    scheme: Box<dyn CouplingScheme>,
    on_hold: bool,
}

/// A list of sub-schemes executed in registration order.
#[derive(Default)]
pub struct CompositionalCouplingScheme {
    slots: Vec<Slot>,
    /// Active window `[begin, end)`.
    begin: usize,
    end: usize,
    /// Solver time added during the current cycle, replayed to schemes that
    /// activate mid-advance.
    last_added_time: f64,
}

impl CompositionalCouplingScheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_coupling_scheme(&mut self, scheme: Box<dyn CouplingScheme>) {
        self.slots.push(Slot {
            scheme,
            on_hold: false,
        });
    }

    pub fn schemes(&self) -> impl Iterator<Item = &dyn CouplingScheme> {
        self.slots.iter().map(|s| s.scheme.as_ref())
    }

    /// Extend the window from `end`: leading explicit schemes plus the
    /// following run of consecutive implicit schemes.
    fn extend_window(&mut self) {
        let mut saw_implicit = false;
        while self.end < self.slots.len() {
            let scheme = &self.slots[self.end].scheme;
            let iterates = scheme.is_action_required(actions::WRITE_ITERATION_CHECKPOINT)
                || scheme.is_action_required(actions::READ_ITERATION_CHECKPOINT);
            if saw_implicit && !iterates {
                break;
            }
            saw_implicit |= iterates;
            self.end += 1;
        }
        debug!(begin = self.begin, end = self.end, "active sub-scheme window");
    }

    /// After advancing the window, decide what happens next. Returns true
    /// when new schemes became active and must be advanced within this call.
    fn determine_active_schemes(&mut self) -> bool {
        let window_done = self.slots[self.begin..self.end]
            .iter()
            .all(|s| !s.scheme.is_coupling_ongoing() || s.scheme.is_coupling_timestep_complete());
        if !window_done {
            // Keep iterating; completed schemes wait for the stragglers.
            for slot in &mut self.slots[self.begin..self.end] {
                if !slot.scheme.is_coupling_ongoing() || slot.scheme.is_coupling_timestep_complete()
                {
                    slot.on_hold = true;
                }
            }
            return false;
        }
        for slot in &mut self.slots[self.begin..self.end] {
            slot.on_hold = false;
        }
        self.begin = self.end;
        if self.begin == self.slots.len() {
            // Cycle complete; the next advance starts over from the front.
            self.begin = 0;
            self.end = 0;
            self.extend_window();
            return false;
        }
        self.extend_window();
        true
    }
}

impl CouplingScheme for CompositionalCouplingScheme {
    fn initialize(&mut self, start_time: f64, start_timestep: usize) -> Result<()> {
        if self.slots.is_empty() {
            return Err(Error::config(
                "a compositional coupling scheme needs at least one sub-scheme",
            ));
        }
        for slot in &mut self.slots {
            slot.scheme.initialize(start_time, start_timestep)?;
        }
        self.begin = 0;
        self.end = 0;
        self.extend_window();
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.slots.iter().all(|s| s.scheme.is_initialized())
    }

    fn initialize_data(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            slot.scheme.initialize_data()?;
        }
        Ok(())
    }

    fn add_computed_time(&mut self, dt: f64) -> Result<()> {
        self.last_added_time += dt;
        for slot in &mut self.slots[self.begin..self.end] {
            if !slot.on_hold && slot.scheme.is_coupling_ongoing() {
                slot.scheme.add_computed_time(dt)?;
            }
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            for slot in &mut self.slots[self.begin..self.end] {
                if !slot.on_hold && slot.scheme.is_coupling_ongoing() {
                    slot.scheme.advance()?;
                }
            }
            if !self.determine_active_schemes() {
                break;
            }
            // Newly activated schemes have to catch up with the solver time
            // before they advance in the next round.
            for slot in &mut self.slots[self.begin..self.end] {
                if slot.scheme.is_coupling_ongoing() && self.last_added_time > 0.0 {
                    slot.scheme.add_computed_time(self.last_added_time)?;
                }
            }
        }
        self.last_added_time = 0.0;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            slot.scheme.finalize()?;
        }
        Ok(())
    }

    fn is_coupling_ongoing(&self) -> bool {
        self.slots.iter().any(|s| s.scheme.is_coupling_ongoing())
    }

    fn is_coupling_timestep_complete(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.scheme.is_coupling_timestep_complete())
    }

    fn has_data_been_exchanged(&self) -> bool {
        self.slots.iter().any(|s| s.scheme.has_data_been_exchanged())
    }

    fn is_action_required(&self, action: &str) -> bool {
        self.slots
            .iter()
            .any(|s| s.scheme.is_action_required(action))
    }

    fn performed_action(&mut self, action: &str) -> Result<()> {
        let mut found = false;
        for slot in &mut self.slots {
            if slot.scheme.is_action_required(action) {
                slot.scheme.performed_action(action)?;
                found = true;
            }
        }
        if !found {
            return Err(Error::usage(format!(
                "action \"{action}\" was acknowledged but never required"
            )));
        }
        Ok(())
    }

    /// The lagging sub-scheme defines the composition's progress.
    fn time(&self) -> f64 {
        self.slots
            .iter()
            .map(|s| s.scheme.time())
            .fold(f64::INFINITY, f64::min)
    }

    fn timesteps(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.scheme.timesteps())
            .min()
            .unwrap_or(0)
    }

    fn next_timestep_max_length(&self) -> f64 {
        self.slots
            .iter()
            .map(|s| s.scheme.next_timestep_max_length())
            .fold(f64::INFINITY, f64::min)
    }

    fn will_data_be_exchanged(&self, last_solver_dt: f64) -> bool {
        self.slots
            .iter()
            .any(|s| s.scheme.will_data_be_exchanged(last_solver_dt))
    }
}
