//! A syringe pump controller running on an in-memory link.
//!
//! The host side is scripted: it asks for `help`, starts a dispense sequence,
//! tries to start a second one while the first is running, and then reads the
//! pump's info. Every reply the firmware writes is printed.

use std::thread;
use std::time::Duration;

use labwire_core::config::MachineConfig;
use labwire_core::message::Message;
use labwire_core::types::{Metadata, Value};
use labwire_devices::postman::FakePostman;
use labwire_engine::{
    CommandReply, Context, Error, IdleState, Machine, Progress, Session, State, StateMachine, Step, WaitState,
};
use serde_json::json;
use tracing::info;

#[derive(Debug, Default)]
struct Pump {
    syringe_ml: f64,
    dispensed_ml: f64,
}

/// Fills the syringe a little on every tick
struct Priming;

impl State<Pump> for Priming {
    fn name(&self) -> &str {
        "Priming"
    }

    fn accepts_instructions(&self) -> bool {
        false
    }

    fn enter(&self, _machine: &mut Machine<Pump>, _context: &Context) -> labwire_engine::Result<Box<dyn Session<Pump>>> {
        Ok(Box::new(PrimingSession))
    }
}

struct PrimingSession;

impl Session<Pump> for PrimingSession {
    fn update(&mut self, machine: &mut Machine<Pump>) -> labwire_engine::Result<Progress> {
        machine.flags.syringe_ml = (machine.flags.syringe_ml + 1.0).min(10.0);
        if machine.flags.syringe_ml >= 10.0 {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Running)
        }
    }
}

/// Pushes `volume_ml` out of the syringe
struct Dispensing;

impl State<Pump> for Dispensing {
    fn name(&self) -> &str {
        "Dispensing"
    }

    fn required_context(&self) -> &[&str] {
        &["volume_ml"]
    }

    fn enter(&self, machine: &mut Machine<Pump>, context: &Context) -> labwire_engine::Result<Box<dyn Session<Pump>>> {
        let volume = context
            .get_f64("volume_ml")
            .ok_or_else(|| Error::context("volume_ml must be a number"))?;
        if volume > machine.flags.syringe_ml {
            return Err(Error::other(format!("cannot dispense {} ml from {} ml", volume, machine.flags.syringe_ml)));
        }
        Ok(Box::new(DispensingSession { remaining: volume }))
    }
}

struct DispensingSession {
    remaining: f64,
}

impl Session<Pump> for DispensingSession {
    fn update(&mut self, machine: &mut Machine<Pump>) -> labwire_engine::Result<Progress> {
        let step = self.remaining.min(0.5);
        self.remaining -= step;
        machine.flags.syringe_ml -= step;
        machine.flags.dispensed_ml += step;
        if self.remaining <= 0.0 {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Running)
        }
    }
}

fn dispense(machine: &mut Machine<Pump>, args: &Value) -> labwire_engine::Result<CommandReply> {
    let volume = args
        .get("volume_ml")
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::command("args.volume_ml must be a number"))?;
    let steps = vec![
        Step::new("Priming"),
        Step::new("Dispensing").with_context("volume_ml", volume),
        Step::new("Settling").with_context(WaitState::DELAY_KEY, 20),
    ];
    let context = Context::new().with("sequence_name", "dispense");
    machine.start_sequence(steps, false, context);
    Ok(CommandReply::Deferred)
}

fn main() -> anyhow::Result<()> {
    labwire_core::logging::init_with_filter("info")?;

    let postman = FakePostman::new();
    let link = postman.link();

    let config = MachineConfig {
        name: "syringe_pump".to_string(),
        ..MachineConfig::default()
    };
    let mut pump = StateMachine::new(config, Box::new(postman), Pump::default()).with_status_info(|machine| {
        let mut status = Metadata::new();
        status.insert("syringe_ml".into(), json!(machine.flags.syringe_ml));
        status.insert("dispensed_ml".into(), json!(machine.flags.dispensed_ml));
        status
    });

    pump.add_state(IdleState::default())?;
    pump.add_state(Priming)?;
    pump.add_state(Dispensing)?;
    pump.add_state(WaitState::new("Settling"))?;
    pump.add_command("dispense", "Prime, dispense args.volume_ml and settle", dispense)?;
    pump.run()?;

    link.push_message(&Message::instruction("host", "help", json!({})));
    link.push_message(&Message::instruction("host", "dispense", json!({ "volume_ml": 2.5 })));

    for tick in 0..60 {
        if tick == 3 {
            link.push_message(&Message::instruction("host", "dispense", json!({ "volume_ml": 1.0 })));
        }
        if tick == 50 {
            link.push_message(&Message::instruction("host", "get_info", json!({})));
        }

        pump.update()?;
        for reply in link.take_sent_messages() {
            info!("tick {:>2} {} {}", tick, reply.status(), reply.payload());
        }
        thread::sleep(Duration::from_millis(2));
    }

    pump.stop()?;
    info!("Final state: {:?}", pump.flags());
    Ok(())
}
