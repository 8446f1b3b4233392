/*!
 * Protocol messages and their JSON wire codec.
 *
 * A [`Message`] is an immutable value. Every component that moves messages
 * around (buffers, postmen, the device manager) treats it as opaque; the only
 * behavior here is construction, validation and (de)serialization. Line
 * termination is the transport's job, not the codec's.
 */
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::types::{epoch_seconds, Metadata, Status, Value};

/// Metadata key carrying the explicit kind of a `DATA_RESPONSE`
pub const RESPONSE_KIND_KEY: &str = "response_kind";

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    subsystem_name: String,
    status: Status,
    #[serde(default)]
    meta: Metadata,
    #[serde(default = "empty_object")]
    payload: Value,
    #[serde(default = "epoch_seconds")]
    timestamp: f64,
}

fn empty_object() -> Value {
    Value::Object(Metadata::new())
}

impl Message {
    /// Create a message with empty metadata and payload, stamped now
    pub fn new<S: Into<String>>(subsystem_name: S, status: Status) -> Self {
        Self {
            subsystem_name: subsystem_name.into(),
            status,
            meta: Metadata::new(),
            payload: empty_object(),
            timestamp: epoch_seconds(),
        }
    }

    /// Create a message from an untyped status string
    ///
    /// Fails with [`Error::InvalidStatus`] when `status` is not one of the
    /// eight protocol statuses.
    pub fn create<S: Into<String>>(
        subsystem_name: S,
        status: &str,
        meta: Option<Metadata>,
        payload: Option<Value>,
    ) -> Result<Self> {
        let status = status.parse::<Status>()?;
        let mut message = Self::new(subsystem_name, status);
        if let Some(meta) = meta {
            message.meta = meta;
        }
        if let Some(payload) = payload {
            message.payload = payload;
        }
        Ok(message)
    }

    /// Build an `INSTRUCTION` message with the conventional `{func, args}` payload
    pub fn instruction<S: Into<String>, F: Into<String>>(subsystem_name: S, func: F, args: Value) -> Self {
        Self::new(subsystem_name, Status::Instruction)
            .with_payload(json!({ "func": func.into(), "args": args }))
    }

    /// Build a `DATA_RESPONSE` message with the conventional `{metadata, data}` payload
    ///
    /// The `kind` is recorded in `meta.response_kind` so receivers do not have
    /// to guess what the data describes from its shape.
    pub fn data_response<S: Into<String>, K: Into<String>>(
        subsystem_name: S,
        kind: K,
        metadata: Value,
        data: Value,
    ) -> Self {
        Self::new(subsystem_name, Status::DataResponse)
            .with_meta(RESPONSE_KIND_KEY, Value::String(kind.into()))
            .with_payload(json!({ "metadata": metadata, "data": data }))
    }

    /// Replace the payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Add a metadata entry
    pub fn with_meta<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Override the timestamp
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Name of the sending subsystem
    pub fn subsystem_name(&self) -> &str {
        &self.subsystem_name
    }

    /// Message status
    pub fn status(&self) -> Status {
        self.status
    }

    /// Message metadata
    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    /// Message payload
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Creation time in float epoch seconds
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Instruction function name, if the payload follows the instruction convention
    pub fn func(&self) -> Option<&str> {
        self.payload.get("func").and_then(Value::as_str)
    }

    /// Instruction arguments, if present
    pub fn args(&self) -> Option<&Value> {
        self.payload.get("args")
    }

    /// Explicit `DATA_RESPONSE` kind, if the sender tagged one
    pub fn response_kind(&self) -> Option<&str> {
        self.meta.get(RESPONSE_KIND_KEY).and_then(Value::as_str)
    }

    /// `data` section of a data response payload
    pub fn data(&self) -> Option<&Value> {
        self.payload.get("data")
    }

    /// Encode the message as a single JSON document without a line terminator
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a message from one received frame
    ///
    /// Any decoding failure, including an unknown status, is reported as
    /// [`Error::MalformedPayload`] so that callers can route it to a side
    /// channel instead of failing the reader.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim_end_matches(['\r', '\n']);
        serde_json::from_str(trimmed).map_err(|e| Error::malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_fields() {
        let message = Message::instruction("host", "dispense", json!({ "volume_ul": 250 }))
            .with_meta("origin", json!("test"));

        let raw = message.serialize().unwrap();
        assert!(!raw.ends_with('\n'));

        let parsed = Message::parse(&raw).unwrap();
        assert_eq!(parsed.subsystem_name(), "host");
        assert_eq!(parsed.status(), Status::Instruction);
        assert_eq!(parsed.payload(), message.payload());
        assert_eq!(parsed.meta(), message.meta());
        assert_eq!(parsed.func(), Some("dispense"));
        assert_eq!(parsed.args().unwrap()["volume_ul"], 250);
    }

    #[test]
    fn test_wire_shape() {
        let raw = Message::new("pump", Status::Success)
            .with_payload(json!("pong"))
            .with_timestamp(12.5)
            .serialize()
            .unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["subsystem_name"], "pump");
        assert_eq!(value["status"], "SUCCESS");
        assert_eq!(value["payload"], "pong");
        assert_eq!(value["timestamp"], 12.5);
        assert!(value["meta"].is_object());
    }

    #[test]
    fn test_create_rejects_invalid_status() {
        let result = Message::create("host", "URGENT", None, None);
        assert!(matches!(result, Err(Error::InvalidStatus(s)) if s == "URGENT"));

        let message = Message::create("host", "WARNING", None, Some(json!({ "x": 1 }))).unwrap();
        assert_eq!(message.status(), Status::Warning);
        assert_eq!(message.payload()["x"], 1);
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(Message::parse("{not json"), Err(Error::MalformedPayload(_))));
        assert!(matches!(Message::parse(""), Err(Error::MalformedPayload(_))));

        let bad_status = r#"{"subsystem_name":"x","status":"LOUD","meta":{},"payload":{},"timestamp":1.0}"#;
        assert!(matches!(Message::parse(bad_status), Err(Error::MalformedPayload(_))));
    }

    #[test]
    fn test_parse_fills_defaults_and_strips_terminator() {
        let parsed = Message::parse("{\"subsystem_name\":\"arm\",\"status\":\"INFO\"}\r\n").unwrap();
        assert_eq!(parsed.subsystem_name(), "arm");
        assert!(parsed.meta().is_empty());
        assert!(parsed.payload().is_object());
        assert!(parsed.timestamp() > 0.0);
    }

    #[test]
    fn test_data_response_is_tagged() {
        let message = Message::data_response("colorimeter", "get_info", json!({}), json!({ "state": "Idle" }));
        assert_eq!(message.status(), Status::DataResponse);
        assert_eq!(message.response_kind(), Some("get_info"));
        assert_eq!(message.data().unwrap()["state"], "Idle");
    }
}
