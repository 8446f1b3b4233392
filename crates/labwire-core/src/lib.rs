/*!
 * LabWire Core
 *
 * This crate provides the pieces shared by every LabWire endpoint: the
 * message value and its JSON wire codec, bounded message buffers,
 * configuration, and logging.
 */

#![warn(missing_docs)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod prelude;
pub mod types;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use serde;
    pub use serde_json;
    pub use tracing;
}

/// LabWire core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("LabWire Core {} initialized", VERSION);
    Ok(())
}
