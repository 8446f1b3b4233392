/*!
 * Device errors and the host-side device model.
 *
 * A [`Device`] is the host's cached view of one connected instrument. Every
 * field except the port identity is learned from inbound messages, so the
 * model is eventually consistent and never authoritative.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use labwire_core::error::Error as CoreError;
use labwire_core::message::Message;
use labwire_core::types::{Metadata, Status, Value};

use crate::discovery::PortInfo;
use crate::postman::SplitPostman;

/// Error type for device and transport operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Send or receive on a channel that is not open
    #[error("Channel not open: {0}")]
    ChannelNotOpen(String),

    /// The port is not managed by this manager
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// Communication error with the device
    #[error("Communication error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[cfg(feature = "serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new channel-not-open error
    pub fn channel_not_open<S: AsRef<str>>(channel: S) -> Self {
        DeviceError::ChannelNotOpen(channel.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Other(msg.as_ref().to_string())
    }
}

/// Host-side cache of one connected instrument
pub struct Device {
    info: PortInfo,
    postman: Box<dyn SplitPostman>,
    /// Subsystem name reported by the firmware
    pub firmware_name: Option<String>,
    /// Firmware version reported by `get_info`
    pub firmware_version: Option<String>,
    /// Last state the firmware reported being in
    pub state: Option<String>,
    /// Supported commands and their documentation, from `help`
    pub commands: Metadata,
    /// Most recent telemetry payload
    pub telemetry: Option<Value>,
    /// Most recent status payload from `get_info`
    pub status: Option<Value>,
    /// When the last message from this device was observed
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    /// Create a device record around an open postman
    pub fn new(info: PortInfo, postman: Box<dyn SplitPostman>) -> Self {
        Self {
            info,
            postman,
            firmware_name: None,
            firmware_version: None,
            state: None,
            commands: Metadata::new(),
            telemetry: None,
            status: None,
            last_seen: None,
        }
    }

    /// Port identity
    pub fn info(&self) -> &PortInfo {
        &self.info
    }

    /// Port name
    pub fn port(&self) -> &str {
        &self.info.port
    }

    /// The device's transport
    pub fn postman(&mut self) -> &mut dyn SplitPostman {
        self.postman.as_mut()
    }

    /// Whether the firmware advertised a command through `help`
    pub fn supports_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Fold an inbound message into the cached fields
    pub fn observe(&mut self, message: &Message) {
        self.last_seen = Some(Utc::now());
        self.firmware_name = Some(message.subsystem_name().to_string());

        match message.status() {
            Status::DataResponse => self.observe_data_response(message),
            Status::Telemetry => {
                if let Some(state) = message.payload().get("current_state").and_then(Value::as_str) {
                    self.state = Some(state.to_string());
                }
                self.telemetry = Some(message.payload().clone());
            }
            _ => {}
        }
    }

    fn observe_data_response(&mut self, message: &Message) {
        let Some(data) = message.data() else {
            return;
        };

        match response_kind(message, data) {
            Some(ResponseKind::Help) => {
                if let Some(commands) = data.get("supported_commands").and_then(Value::as_object) {
                    self.commands = commands.clone();
                }
            }
            Some(ResponseKind::Info) => {
                if let Some(version) = data.get("version").and_then(Value::as_str) {
                    self.firmware_version = Some(version.to_string());
                }
                if let Some(state) = data.get("current_state").and_then(Value::as_str) {
                    self.state = Some(state.to_string());
                }
                self.status = Some(data.clone());
            }
            None => {}
        }
    }

    pub(crate) fn into_postman(self) -> Box<dyn SplitPostman> {
        self.postman
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("open", &self.postman.is_open())
            .field("firmware_name", &self.firmware_name)
            .field("firmware_version", &self.firmware_version)
            .field("state", &self.state)
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .field("last_seen", &self.last_seen)
            .finish()
    }
}

enum ResponseKind {
    Help,
    Info,
}

/// Prefer the explicit `meta.response_kind` tag; fall back to the payload shape
/// for firmware that does not tag its responses.
fn response_kind(message: &Message, data: &Value) -> Option<ResponseKind> {
    match message.response_kind() {
        Some("help") => Some(ResponseKind::Help),
        Some("get_info") => Some(ResponseKind::Info),
        Some(_) => None,
        None if data.get("supported_commands").is_some() => Some(ResponseKind::Help),
        None if data.get("firmware_name").is_some() => Some(ResponseKind::Info),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postman::fake::FakePostman;
    use serde_json::json;

    fn device() -> Device {
        Device::new(PortInfo::new("/dev/ttyACM0", 0x239a, 0x80f4), Box::new(FakePostman::new()))
    }

    #[test]
    fn test_observe_tagged_help() {
        let mut device = device();
        let message = Message::data_response(
            "pump",
            "help",
            json!({}),
            json!({ "supported_commands": { "ping": { "description": "liveness" } } }),
        );
        device.observe(&message);

        assert_eq!(device.firmware_name.as_deref(), Some("pump"));
        assert!(device.supports_command("ping"));
        assert!(device.last_seen.is_some());
    }

    #[test]
    fn test_observe_untagged_info_by_shape() {
        let mut device = device();
        let message = Message::new("arm", Status::DataResponse).with_payload(json!({
            "metadata": {},
            "data": { "firmware_name": "arm", "version": "1.2.0", "current_state": "Homing" }
        }));
        device.observe(&message);

        assert_eq!(device.firmware_version.as_deref(), Some("1.2.0"));
        assert_eq!(device.state.as_deref(), Some("Homing"));
        assert!(device.status.is_some());
    }

    #[test]
    fn test_observe_telemetry_and_unknown_kind() {
        let mut device = device();
        device.observe(
            &Message::new("colorimeter", Status::Telemetry)
                .with_payload(json!({ "current_state": "Measuring", "lux": 41.0 })),
        );
        assert_eq!(device.state.as_deref(), Some("Measuring"));
        assert_eq!(device.telemetry.as_ref().unwrap()["lux"], 41.0);

        device.observe(&Message::data_response(
            "colorimeter",
            "spectrum",
            json!({}),
            json!({ "supported_commands": { "bogus": {} } }),
        ));
        assert!(!device.supports_command("bogus"));
    }
}
