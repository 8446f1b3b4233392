/*!
 * Activation context.
 *
 * A [`Context`] is the JSON object handed to a state when it is entered. Inside
 * a sequence it is the sequence's aggregate context overlaid with the current
 * step's own entries.
 */
use serde::{Deserialize, Serialize};

use labwire_core::types::{Metadata, Value};

use crate::error::{Error, Result};

/// Context key naming a sequence in its terminal reply
pub const SEQUENCE_NAME_KEY: &str = "sequence_name";

/// Named values passed to a state on entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(Metadata);

impl Context {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, builder style
    pub fn with<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.insert(key, value);
        self
    }

    /// Set an entry
    pub fn insert<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    /// Get an entry
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Get a string entry
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Get a numeric entry
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    /// Get a non-negative integer entry
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    /// Get a boolean entry
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Get an entry that must be present
    pub fn require(&self, key: &str) -> Result<&Value> {
        self.get(key)
            .ok_or_else(|| Error::context(format!("missing required context key '{}'", key)))
    }

    /// Whether an entry is present
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// The keys in `required` that this context lacks
    pub fn missing<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required.iter().copied().filter(|key| !self.contains(key)).collect()
    }

    /// A copy of this context with `overlay`'s entries taking precedence
    pub fn merged(&self, overlay: &Context) -> Context {
        let mut merged = self.0.clone();
        for (key, value) in &overlay.0 {
            merged.insert(key.clone(), value.clone());
        }
        Context(merged)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the context has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &Metadata {
        &self.0
    }

    /// Take the underlying map
    pub fn into_map(self) -> Metadata {
        self.0
    }
}

impl From<Metadata> for Context {
    fn from(map: Metadata) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Context {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(Error::context(format!("context must be a JSON object, got {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_getters() {
        let context = Context::new()
            .with("volume_ml", 2.5)
            .with("cycles", 3)
            .with("pump", "P1")
            .with("prime", true);

        assert_eq!(context.get_f64("volume_ml"), Some(2.5));
        assert_eq!(context.get_u64("cycles"), Some(3));
        assert_eq!(context.get_str("pump"), Some("P1"));
        assert_eq!(context.get_bool("prime"), Some(true));
        assert_eq!(context.get_str("cycles"), None);
        assert!(matches!(context.require("absent"), Err(Error::Context(_))));
    }

    #[test]
    fn test_overlay_wins() {
        let base = Context::new().with("speed", 1).with("pump", "P1");
        let step = Context::new().with("speed", 5);
        let merged = base.merged(&step);

        assert_eq!(merged.get_u64("speed"), Some(5));
        assert_eq!(merged.get_str("pump"), Some("P1"));
        assert_eq!(base.get_u64("speed"), Some(1));
    }

    #[test]
    fn test_missing_keys() {
        let context = Context::new().with("x", 1);
        assert!(context.missing(&["x"]).is_empty());
        assert_eq!(context.missing(&["x", "y", "z"]), vec!["y", "z"]);
    }

    #[test]
    fn test_from_json() {
        let context = Context::try_from(json!({ "a": 1 })).unwrap();
        assert_eq!(context.len(), 1);
        assert!(Context::try_from(Value::Null).unwrap().is_empty());
        assert!(Context::try_from(json!([1, 2])).is_err());
    }
}
