/*!
 * Error types for the LabWire engine crate.
 */
use thiserror::Error;

/// Error type for LabWire engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// A state with this name is already registered
    #[error("Duplicate state: {0}")]
    DuplicateState(String),

    /// A state definition is unusable, for example an empty name
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A transition named a state that was never registered
    #[error("Unknown state: {0}")]
    UnknownState(String),

    /// The machine was used before `run()` or after `stop()`
    #[error("State machine is not running")]
    NotRunning,

    /// A command with this name is already registered
    #[error("Duplicate command: {0}")]
    DuplicateCommand(String),

    /// A command definition is unusable, for example an empty name
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A state was entered without the context it requires
    #[error("Context error: {0}")]
    Context(String),

    /// A command handler failed
    #[error("Command error: {0}")]
    Command(String),

    /// A sequence could not be started
    #[error("Sequence error: {0}")]
    Sequence(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] labwire_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] labwire_core::error::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for LabWire engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new context error
    pub fn context<S: AsRef<str>>(msg: S) -> Self {
        Error::Context(msg.as_ref().to_string())
    }

    /// Create a new command error
    pub fn command<S: AsRef<str>>(msg: S) -> Self {
        Error::Command(msg.as_ref().to_string())
    }

    /// Create a new sequence error
    pub fn sequence<S: AsRef<str>>(msg: S) -> Self {
        Error::Sequence(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Core(err.into())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}
