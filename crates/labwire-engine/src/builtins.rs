/*!
 * Commands every machine answers.
 */
use serde_json::json;

use labwire_core::types::{Metadata, Value};

use crate::command::{CommandRegistry, CommandReply};
use crate::error::{Error, Result};
use crate::state_machine::Machine;

/// Register `help`, `ping`, `get_info` and `set_time`
pub fn register<F: 'static>(commands: &mut CommandRegistry<F>) -> Result<()> {
    commands.add("help", "List supported commands", help)?;
    commands.add("ping", "Check that the controller is responsive", ping)?;
    commands.add("get_info", "Report firmware name, version, state and status", get_info)?;
    commands.add("set_time", "Set the onboard clock from args.epoch (seconds)", set_time)?;
    Ok(())
}

fn help<F>(machine: &mut Machine<F>, _args: &Value) -> Result<CommandReply> {
    Ok(CommandReply::data(
        "help",
        json!({ "supported_commands": Value::Object(machine.commands().docs()) }),
    ))
}

fn ping<F>(_machine: &mut Machine<F>, _args: &Value) -> Result<CommandReply> {
    Ok(CommandReply::Success(Value::String("pong".to_string())))
}

fn get_info<F>(machine: &mut Machine<F>, _args: &Value) -> Result<CommandReply> {
    let mut data = Metadata::new();
    data.insert("firmware_name".into(), Value::String(machine.name().to_string()));
    data.insert("version".into(), Value::String(machine.version().to_string()));
    data.insert("current_state".into(), json!(machine.current_state()));
    data.insert("sequence".into(), json!(machine.sequencer().active().map(|s| s.name())));
    data.insert("time".into(), machine.clock().to_value());
    data.insert("status".into(), Value::Object(machine.status_info()));
    Ok(CommandReply::data("get_info", Value::Object(data)))
}

fn set_time<F>(machine: &mut Machine<F>, args: &Value) -> Result<CommandReply> {
    let epoch = args
        .get("epoch")
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::command("args.epoch must be a number of seconds"))?;
    let local = machine.clock_mut().set_epoch(epoch)?;
    Ok(CommandReply::Success(json!({ "time": local.to_rfc3339() })))
}

#[cfg(test)]
mod tests {
    use labwire_core::config::MachineConfig;
    use labwire_core::message::Message;
    use labwire_core::types::Status;
    use labwire_devices::postman::{FakeLink, FakePostman};

    use super::*;
    use crate::state::IdleState;
    use crate::state_machine::StateMachine;

    fn running(config: MachineConfig) -> (StateMachine<()>, FakeLink) {
        let postman = FakePostman::new();
        let link = postman.link();
        let mut machine = StateMachine::new(config, Box::new(postman), ()).with_status_info(|_| {
            let mut status = Metadata::new();
            status.insert("syringe_ml".into(), json!(4.0));
            status
        });
        machine.add_state(IdleState::default()).unwrap();
        machine.run().unwrap();
        (machine, link)
    }

    fn call(machine: &mut StateMachine<()>, link: &FakeLink, payload: Value) -> Message {
        machine.handle_instruction(&payload).unwrap();
        let mut sent = link.take_sent_messages();
        assert_eq!(sent.len(), 1, "expected exactly one reply to {}", payload);
        sent.remove(0)
    }

    #[test]
    fn test_ping() {
        let (mut machine, link) = running(MachineConfig::default());
        let reply = call(&mut machine, &link, json!({ "func": "ping", "args": {} }));
        assert_eq!(reply.status(), Status::Success);
        assert_eq!(reply.payload(), &json!("pong"));
    }

    #[test]
    fn test_help_lists_commands() {
        let (mut machine, link) = running(MachineConfig::default());
        let reply = call(&mut machine, &link, json!({ "func": "help" }));

        assert_eq!(reply.status(), Status::DataResponse);
        assert_eq!(reply.response_kind(), Some("help"));
        let commands = reply.data().unwrap()["supported_commands"].as_object().unwrap();
        for name in ["help", "ping", "get_info", "set_time"] {
            assert!(commands.contains_key(name), "missing {}", name);
        }
    }

    #[test]
    fn test_get_info() {
        let config = MachineConfig {
            name: "colorimeter".to_string(),
            version: "0.3.1".to_string(),
            ..MachineConfig::default()
        };
        let (mut machine, link) = running(config);
        let reply = call(&mut machine, &link, json!({ "func": "get_info" }));

        assert_eq!(reply.response_kind(), Some("get_info"));
        let data = reply.data().unwrap();
        assert_eq!(data["firmware_name"], "colorimeter");
        assert_eq!(data["version"], "0.3.1");
        assert_eq!(data["current_state"], "Idle");
        assert_eq!(data["time"], Value::Null);
        assert_eq!(data["status"]["syringe_ml"], 4.0);
    }

    #[test]
    fn test_set_time_applies_offset() {
        let config = MachineConfig {
            timezone_offset_hours: -5,
            ..MachineConfig::default()
        };
        let (mut machine, link) = running(config);
        let reply = call(
            &mut machine,
            &link,
            json!({ "func": "set_time", "args": { "epoch": 1_700_000_000 } }),
        );

        assert_eq!(reply.status(), Status::Success);
        assert!(reply.payload()["time"].as_str().unwrap().ends_with("-05:00"));
        assert!(machine.machine().clock().is_set());

        let info = call(&mut machine, &link, json!({ "func": "get_info" }));
        assert!(info.data().unwrap()["time"].is_string());
    }

    #[test]
    fn test_set_time_requires_epoch() {
        let (mut machine, link) = running(MachineConfig::default());
        let reply = call(&mut machine, &link, json!({ "func": "set_time", "args": {} }));
        assert_eq!(reply.status(), Status::Problem);
        assert!(!machine.machine().clock().is_set());
    }
}
