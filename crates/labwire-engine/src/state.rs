/*!
 * States and their activations.
 *
 * A [`State`] is registered once and only describes itself: its name, the
 * context keys it needs, and how to start an activation. Each time the machine
 * enters the state, [`State::enter`] returns a fresh [`Session`] that owns all
 * per-activation progress and is ticked once per `update()` until the machine
 * leaves the state.
 */
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::state_machine::Machine;

/// What a session reports after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The task is still under way
    Running,
    /// The task is finished; the machine advances the active sequence
    Complete,
}

/// A named state of a machine with flags of type `F`
pub trait State<F> {
    /// Unique name of the state
    fn name(&self) -> &str;

    /// Context keys that must be present to enter the state
    fn required_context(&self) -> &[&str] {
        &[]
    }

    /// Whether instructions are read from the postman while this state is active
    fn accepts_instructions(&self) -> bool {
        true
    }

    /// Begin an activation
    ///
    /// Returning an error aborts the active sequence, if any, and sends the
    /// machine back to its idle state.
    fn enter(&self, machine: &mut Machine<F>, context: &Context) -> Result<Box<dyn Session<F>>>;
}

/// One activation of a [`State`]
pub trait Session<F> {
    /// Do one bounded slice of work; must not block
    ///
    /// Only the first [`Progress::Complete`] of an activation is acted upon;
    /// a session may keep running afterwards, for example as the last state of
    /// a persistent sequence.
    fn update(&mut self, machine: &mut Machine<F>) -> Result<Progress>;

    /// Called once when the machine leaves the state
    fn exit(&mut self, _machine: &mut Machine<F>) {}
}

/// A state that waits for instructions and never completes
#[derive(Debug, Clone)]
pub struct IdleState {
    name: String,
}

impl IdleState {
    /// Create an idle state with the given name
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }
}

impl Default for IdleState {
    fn default() -> Self {
        Self::new("Idle")
    }
}

impl<F> State<F> for IdleState {
    fn name(&self) -> &str {
        &self.name
    }

    fn enter(&self, _machine: &mut Machine<F>, _context: &Context) -> Result<Box<dyn Session<F>>> {
        Ok(Box::new(IdleSession))
    }
}

struct IdleSession;

impl<F> Session<F> for IdleSession {
    fn update(&mut self, _machine: &mut Machine<F>) -> Result<Progress> {
        Ok(Progress::Running)
    }
}

/// A state that completes after a fixed delay, read from the `delay_ms` context key
#[derive(Debug, Clone)]
pub struct WaitState {
    name: String,
}

impl WaitState {
    /// Context key holding the delay in milliseconds
    pub const DELAY_KEY: &'static str = "delay_ms";

    /// Create a wait state with the given name
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }
}

impl<F> State<F> for WaitState {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_context(&self) -> &[&str] {
        &[Self::DELAY_KEY]
    }

    fn enter(&self, _machine: &mut Machine<F>, context: &Context) -> Result<Box<dyn Session<F>>> {
        let delay = context
            .get_u64(Self::DELAY_KEY)
            .ok_or_else(|| Error::context(format!("{} must be a non-negative integer", Self::DELAY_KEY)))?;
        Ok(Box::new(WaitSession {
            until: Instant::now() + Duration::from_millis(delay),
        }))
    }
}

struct WaitSession {
    until: Instant,
}

impl<F> Session<F> for WaitSession {
    fn update(&mut self, _machine: &mut Machine<F>) -> Result<Progress> {
        if Instant::now() >= self.until {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Running)
        }
    }
}
