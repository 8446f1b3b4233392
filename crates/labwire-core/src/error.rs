/*!
 * Error types for the LabWire core crate.
 */
use thiserror::Error;

/// Error type for LabWire core operations
#[derive(Error, Debug)]
pub enum Error {
    /// A status string outside the fixed protocol set
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// A frame that could not be decoded into a message
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A buffer configured to reject items is full
    #[error("Buffer overflow: capacity {0} reached")]
    Overflow(usize),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for LabWire core operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new invalid status error
    pub fn invalid_status<S: AsRef<str>>(status: S) -> Self {
        Error::InvalidStatus(status.as_ref().to_string())
    }

    /// Create a new malformed payload error
    pub fn malformed<S: AsRef<str>>(msg: S) -> Self {
        Error::MalformedPayload(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        Error::Config(msg.as_ref().to_string())
    }

    /// Create a new runtime error
    pub fn runtime<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
