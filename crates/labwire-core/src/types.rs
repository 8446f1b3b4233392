/*!
 * Core data types for LabWire.
 *
 * This module defines the fundamental data types shared by the host and the
 * firmware side of the protocol.
 */
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Re-export of the JSON value type used for payloads and metadata
pub use serde_json::Value;

/// A JSON object, used for message metadata, payloads and sequence context
pub type Metadata = serde_json::Map<String, Value>;

/// Status of a message on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Diagnostic chatter
    Debug,
    /// Unsolicited periodic status report
    Telemetry,
    /// Informational notice
    Info,
    /// A remote command invocation carrying `{func, args}`
    Instruction,
    /// Terminal reply: the instruction completed
    Success,
    /// Terminal reply: the instruction failed
    Problem,
    /// Non-terminal warning
    Warning,
    /// Reply carrying `{metadata, data}`
    DataResponse,
}

impl Status {
    /// All statuses, in protocol order
    pub const ALL: [Status; 8] = [
        Status::Debug,
        Status::Telemetry,
        Status::Info,
        Status::Instruction,
        Status::Success,
        Status::Problem,
        Status::Warning,
        Status::DataResponse,
    ];

    /// Get the wire representation of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Debug => "DEBUG",
            Status::Telemetry => "TELEMETRY",
            Status::Info => "INFO",
            Status::Instruction => "INSTRUCTION",
            Status::Success => "SUCCESS",
            Status::Problem => "PROBLEM",
            Status::Warning => "WARNING",
            Status::DataResponse => "DATA_RESPONSE",
        }
    }

    /// Whether this status ends an instruction's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Problem | Status::DataResponse)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Status::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::invalid_status(s))
    }
}

/// Current wall-clock time as float seconds since the Unix epoch
pub fn epoch_seconds() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}
