/*!
 * Prelude module for LabWire Core.
 *
 * This module re-exports commonly used types and functions from the LabWire
 * Core crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{epoch_seconds, Metadata, Status, Value};

// Re-export message and buffer types
pub use crate::buffer::{MessageBuffer, OverflowPolicy};
pub use crate::message::Message;

// Re-export config types
pub use crate::config::{
    Config, ConfigBuilder, LoggingConfig, MachineConfig, ManagerConfig, PostmanConfig,
    SharedConfig,
};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
