/*!
 * Instruction handlers.
 *
 * Every `INSTRUCTION` message names a command in `payload.func`. Commands are
 * registered with a handler and a one-line description; the descriptions are
 * what the built-in `help` command reports.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use labwire_core::types::{Metadata, Value};

use crate::error::{Error, Result};
use crate::state_machine::Machine;

/// What a handler asks the machine to reply with
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    /// Send SUCCESS with this payload
    Success(Value),
    /// Send DATA_RESPONSE tagged with `kind`
    Data {
        /// Value of `meta.response_kind`
        kind: String,
        /// `payload.metadata`
        metadata: Value,
        /// `payload.data`
        data: Value,
    },
    /// Send nothing now; a sequence started by the handler owns the reply
    Deferred,
}

impl CommandReply {
    /// SUCCESS with an empty object payload
    pub fn ok() -> Self {
        CommandReply::Success(Value::Object(Metadata::new()))
    }

    /// DATA_RESPONSE with empty metadata
    pub fn data<K: Into<String>>(kind: K, data: Value) -> Self {
        CommandReply::Data {
            kind: kind.into(),
            metadata: Value::Object(Metadata::new()),
            data,
        }
    }
}

/// A command handler; receives the machine and `payload.args`
pub type Handler<F> = Arc<dyn Fn(&mut Machine<F>, &Value) -> Result<CommandReply>>;

struct Command<F> {
    handler: Handler<F>,
    doc: String,
}

/// Named handlers with their descriptions
pub struct CommandRegistry<F> {
    commands: BTreeMap<String, Command<F>>,
}

impl<F> CommandRegistry<F> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }

    /// Register a command
    ///
    /// Names must be unique and non-empty, and every command must be described.
    pub fn add<S, D, H>(&mut self, name: S, doc: D, handler: H) -> Result<()>
    where
        S: Into<String>,
        D: Into<String>,
        H: Fn(&mut Machine<F>, &Value) -> Result<CommandReply> + 'static,
    {
        let name = name.into();
        let doc = doc.into();

        if name.trim().is_empty() {
            return Err(Error::InvalidCommand("command name must not be empty".to_string()));
        }
        if doc.trim().is_empty() {
            return Err(Error::InvalidCommand(format!("command '{}' has no description", name)));
        }
        if self.commands.contains_key(&name) {
            return Err(Error::DuplicateCommand(name));
        }

        self.commands.insert(
            name,
            Command {
                handler: Arc::new(handler),
                doc,
            },
        );
        Ok(())
    }

    /// Look up a handler
    pub fn get(&self, name: &str) -> Option<Handler<F>> {
        self.commands.get(name).map(|command| command.handler.clone())
    }

    /// Whether a command is registered
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Description of a command
    pub fn doc(&self, name: &str) -> Option<&str> {
        self.commands.get(name).map(|command| command.doc.as_str())
    }

    /// Descriptions of every command, keyed by name
    pub fn docs(&self) -> Metadata {
        self.commands
            .iter()
            .map(|(name, command)| (name.clone(), Value::String(command.doc.clone())))
            .collect()
    }

    /// Registered command names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Number of registered commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether no command is registered
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl<F> Default for CommandRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> fmt::Debug for CommandRegistry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(_: &mut Machine<()>, _: &Value) -> Result<CommandReply> {
        Ok(CommandReply::ok())
    }

    #[test]
    fn test_registration_rules() {
        let mut registry = CommandRegistry::<()>::new();
        registry.add("dispense", "Dispense a volume", noop).unwrap();

        assert!(matches!(
            registry.add("dispense", "again", noop),
            Err(Error::DuplicateCommand(name)) if name == "dispense"
        ));
        assert!(matches!(registry.add("", "nameless", noop), Err(Error::InvalidCommand(_))));
        assert!(matches!(registry.add("blank", " ", noop), Err(Error::InvalidCommand(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_docs_are_sorted_by_name() {
        let mut registry = CommandRegistry::<()>::new();
        registry.add("zero", "Zero the scale", noop).unwrap();
        registry.add("aspirate", "Draw liquid", noop).unwrap();

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["aspirate", "zero"]);
        assert_eq!(
            Value::Object(registry.docs()),
            json!({ "aspirate": "Draw liquid", "zero": "Zero the scale" })
        );
        assert_eq!(registry.doc("zero"), Some("Zero the scale"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_reply_helpers() {
        assert_eq!(CommandReply::ok(), CommandReply::Success(json!({})));
        assert_eq!(
            CommandReply::data("reading", json!({ "od": 0.42 })),
            CommandReply::Data {
                kind: "reading".to_string(),
                metadata: json!({}),
                data: json!({ "od": 0.42 })
            }
        );
    }
}
