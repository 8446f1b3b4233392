/*!
 * LabWire Engine
 *
 * This crate provides the firmware side of LabWire: a cooperative state
 * machine that answers instructions from the host, and the sequencer that
 * walks one instruction through several states.
 */

#![warn(missing_docs)]

// Re-export core types
pub use labwire_core::prelude;

pub mod builtins;
pub mod clock;
pub mod command;
pub mod context;
pub mod error;
pub mod sequencer;
pub mod state;
pub mod state_machine;

// Re-export main types for convenience
pub use clock::Clock;
pub use command::{CommandRegistry, CommandReply, Handler};
pub use context::Context;
pub use error::{Error, Result};
pub use sequencer::{Sequencer, SequencerState, Step};
pub use state::{IdleState, Progress, Session, State, WaitState};
pub use state_machine::{Machine, StateMachine, StatusInfoFn};

/// LabWire engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("LabWire Engine {} initialized", VERSION);
    Ok(())
}
