/*!
 * Cooperative state machine for instrument firmware.
 *
 * Firmware owns one [`StateMachine`] and calls [`StateMachine::update`] once
 * per loop iteration. Each update reads pending instructions from the postman
 * (when the active state allows it), dispatches them to command handlers, and
 * then gives the active state's session one tick. Nothing in here blocks, so
 * multi-tick work lives in sessions.
 *
 * States and handlers never switch states directly. They call
 * [`Machine::go_to_state`], which records the request; the machine applies it
 * as soon as the callback returns, always exiting the current session before
 * entering the next one.
 */
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, error, info, warn};

use labwire_core::buffer::{MessageBuffer, OverflowPolicy};
use labwire_core::config::MachineConfig;
use labwire_core::logging::operation_span;
use labwire_core::message::Message;
use labwire_core::types::{Metadata, Status, Value};
use labwire_devices::postman::Postman;

use crate::builtins;
use crate::clock::Clock;
use crate::command::{CommandRegistry, CommandReply};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::sequencer::{Advance, Sequencer, Step};
use crate::state::{Progress, Session, State};

/// Upper bound on frames read from the postman in one update
const MAX_FRAMES_PER_UPDATE: usize = 16;

/// Builds the opaque device status reported by `get_info` and telemetry
pub type StatusInfoFn<F> = Box<dyn Fn(&Machine<F>) -> Metadata>;

#[derive(Debug, Clone)]
struct Transition {
    state: String,
    context: Context,
}

/// The part of a state machine that states and command handlers work with
pub struct Machine<F> {
    config: MachineConfig,
    /// Machine-specific flags
    pub flags: F,
    /// Untyped flags for values that do not deserve a field in `F`
    pub extras: Metadata,
    postman: Box<dyn Postman>,
    inbox: MessageBuffer<Message>,
    commands: CommandRegistry<F>,
    sequencer: Sequencer,
    running: bool,
    states: HashSet<String>,
    current: Option<String>,
    pending: Option<Transition>,
    clock: Clock,
    status_info: Option<StatusInfoFn<F>>,
    last_telemetry: Option<Instant>,
}

impl<F> Machine<F> {
    fn new(config: MachineConfig, postman: Box<dyn Postman>, flags: F) -> Self {
        Self {
            inbox: MessageBuffer::with_capacity(config.inbox_capacity, OverflowPolicy::EvictOldest),
            clock: Clock::new(config.timezone_offset_hours),
            config,
            flags,
            extras: Metadata::new(),
            postman,
            commands: CommandRegistry::new(),
            sequencer: Sequencer::new(),
            running: false,
            states: HashSet::new(),
            current: None,
            pending: None,
            status_info: None,
            last_telemetry: None,
        }
    }

    /// Subsystem name used as `subsystem_name` on every outgoing message
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Firmware version
    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// Machine configuration
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Whether `run()` has been called and `stop()` has not
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Name of the active state
    pub fn current_state(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Whether a state is registered
    pub fn has_state(&self, name: &str) -> bool {
        self.states.contains(name)
    }

    /// Request a transition, applied when the current callback returns
    ///
    /// A later request in the same callback replaces an earlier one.
    pub fn go_to_state<S: Into<String>>(&mut self, name: S, context: Context) -> Result<()> {
        if !self.running {
            return Err(Error::NotRunning);
        }
        let name = name.into();
        if !self.states.contains(&name) {
            return Err(Error::UnknownState(name));
        }
        if let Some(replaced) = self.pending.replace(Transition { state: name, context }) {
            debug!("Transition to {} superseded", replaced.state);
        }
        Ok(())
    }

    /// Request a transition to the configured idle state
    pub fn go_to_idle(&mut self) {
        let idle = self.config.idle_state.clone();
        if let Err(e) = self.go_to_state(idle, Context::new()) {
            error!("Cannot return to idle: {}", e);
        }
    }

    /// Registered commands
    pub fn commands(&self) -> &CommandRegistry<F> {
        &self.commands
    }

    /// Messages received that were not instructions
    pub fn inbox(&mut self) -> &mut MessageBuffer<Message> {
        &mut self.inbox
    }

    /// Onboard clock
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Onboard clock, mutably
    pub fn clock_mut(&mut self) -> &mut Clock {
        &mut self.clock
    }

    /// Sequence tracker
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Device status from the registered callback, empty when there is none
    pub fn status_info(&self) -> Metadata {
        match &self.status_info {
            Some(build) => build(self),
            None => Metadata::new(),
        }
    }

    /// Write a message to the postman
    pub fn send(&mut self, message: &Message) -> Result<()> {
        self.postman.send_message(message)?;
        Ok(())
    }

    /// A message from this machine
    pub fn message(&self, status: Status) -> Message {
        Message::new(self.config.name.clone(), status)
    }

    /// Send a SUCCESS reply
    pub fn reply_success(&mut self, payload: Value) {
        let message = self.message(Status::Success).with_payload(payload);
        self.send_reply(&message);
    }

    /// Send a PROBLEM reply describing `error`
    pub fn reply_problem(&mut self, error: &str) {
        let message = self.message(Status::Problem).with_payload(json!({ "error": error }));
        self.send_reply(&message);
    }

    /// Send a DATA_RESPONSE tagged with `kind`
    pub fn reply_data(&mut self, kind: &str, metadata: Value, data: Value) {
        let message = Message::data_response(self.config.name.clone(), kind, metadata, data);
        self.send_reply(&message);
    }

    fn send_reply(&mut self, message: &Message) {
        if let Err(e) = self.send(message) {
            warn!("Failed to send {} reply: {}", message.status(), e);
        }
    }

    /// Dispatch an instruction payload to its handler and send the reply
    pub fn handle_instruction(&mut self, payload: &Value) {
        let Some(func) = payload.get("func").and_then(Value::as_str) else {
            self.reply_problem("instruction has no func");
            return;
        };
        let Some(handler) = self.commands.get(func) else {
            warn!("Unknown command {}", func);
            self.reply_problem(&format!("unknown command '{}'", func));
            return;
        };

        let func = func.to_string();
        let empty = Value::Object(Metadata::new());
        let args = payload.get("args").unwrap_or(&empty);
        debug!("Handling {}", func);

        match handler(self, args) {
            Ok(CommandReply::Success(payload)) => self.reply_success(payload),
            Ok(CommandReply::Data { kind, metadata, data }) => self.reply_data(&kind, metadata, data),
            Ok(CommandReply::Deferred) => {}
            Err(e) => {
                warn!("Command {} failed: {}", func, e);
                self.reply_problem(&format!("{} failed: {}", func, e));
            }
        }
    }

    /// Start a sequence and enter its first step
    ///
    /// Replies PROBLEM and returns `false` when a sequence is already active
    /// or `steps` is empty; the active sequence is left untouched. On success
    /// the sequence owns the terminal reply, so a handler calling this should
    /// return [`CommandReply::Deferred`].
    pub fn start_sequence(&mut self, steps: Vec<Step>, persistent: bool, context: Context) -> bool {
        match self.sequencer.start(steps, persistent, context) {
            Ok(id) => {
                info!("Started sequence {}", id);
                self.advance_sequence();
                true
            }
            Err(e) => {
                warn!("Refusing sequence: {}", e);
                self.reply_problem(&e.to_string());
                false
            }
        }
    }

    /// Move the sequence on after the active state completed
    pub fn advance_sequence(&mut self) {
        match self.sequencer.advance() {
            Advance::Enter { state, context } => {
                if let Err(e) = self.go_to_state(state, context) {
                    self.abort_sequence(&e.to_string());
                }
            }
            Advance::Finished { id, name, persistent } => {
                info!("Sequence {} ({}) complete", name, id);
                let message = self
                    .message(Status::Success)
                    .with_meta("sequence_id", Value::String(id.to_string()))
                    .with_payload(json!({ "sequence_name": name }));
                self.send_reply(&message);
                if !persistent {
                    self.go_to_idle();
                }
            }
            Advance::NotRunning => self.go_to_idle(),
        }
    }

    /// Abandon the active sequence, reply PROBLEM once and return to idle
    ///
    /// Also used outside sequences when a state cannot be entered.
    pub fn abort_sequence(&mut self, reason: &str) {
        let mut message = self.message(Status::Problem);
        match self.sequencer.begin_abort() {
            Some(aborted) => {
                warn!("Aborting sequence {} ({}): {}", aborted.name, aborted.id, reason);
                message = message
                    .with_meta("sequence_id", Value::String(aborted.id.to_string()))
                    .with_payload(json!({ "error": reason, "sequence_name": aborted.name }));
            }
            None => {
                warn!("Returning to idle: {}", reason);
                message = message.with_payload(json!({ "error": reason }));
            }
        }
        self.send_reply(&message);
        self.sequencer.reset();
        self.pending = None;
        self.go_to_idle();
    }

    fn telemetry_due(&self, now: Instant) -> bool {
        match self.config.telemetry_interval() {
            Some(interval) => self.last_telemetry.map_or(true, |last| now.duration_since(last) >= interval),
            None => false,
        }
    }

    /// Send a TELEMETRY message with the current state and status
    pub fn send_telemetry(&mut self) -> Result<()> {
        let message = self.message(Status::Telemetry).with_payload(json!({
            "current_state": self.current,
            "status": Value::Object(self.status_info()),
        }));
        self.last_telemetry = Some(Instant::now());
        self.send(&message)
    }
}

impl<F: fmt::Debug> fmt::Debug for Machine<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.config.name)
            .field("flags", &self.flags)
            .field("running", &self.running)
            .field("current", &self.current)
            .field("sequencer", &self.sequencer)
            .field("channel", &self.postman.channel_name())
            .finish()
    }
}

struct ActiveSession<F> {
    state: String,
    session: Box<dyn Session<F>>,
    completed: bool,
}

/// A firmware state machine with flags of type `F`
pub struct StateMachine<F> {
    machine: Machine<F>,
    states: HashMap<String, Box<dyn State<F>>>,
    session: Option<ActiveSession<F>>,
}

impl<F: 'static> StateMachine<F> {
    /// Create a machine talking through `postman`, with the built-in commands registered
    pub fn new(config: MachineConfig, postman: Box<dyn Postman>, flags: F) -> Self {
        let mut machine = Machine::new(config, postman, flags);
        if let Err(e) = builtins::register(&mut machine.commands) {
            error!("Failed to register built-in commands: {}", e);
        }
        Self {
            machine,
            states: HashMap::new(),
            session: None,
        }
    }
}

impl<F> StateMachine<F> {
    /// Set the callback that builds the device status
    pub fn with_status_info<C>(mut self, build: C) -> Self
    where
        C: Fn(&Machine<F>) -> Metadata + 'static,
    {
        self.machine.status_info = Some(Box::new(build));
        self
    }

    /// Register a state
    pub fn add_state<S: State<F> + 'static>(&mut self, state: S) -> Result<()> {
        let name = state.name().to_string();
        if name.trim().is_empty() {
            return Err(Error::InvalidState("state name must not be empty".to_string()));
        }
        if self.states.contains_key(&name) {
            return Err(Error::DuplicateState(name));
        }
        debug!("Registered state {}", name);
        self.machine.states.insert(name.clone());
        self.states.insert(name, Box::new(state));
        Ok(())
    }

    /// Register a command
    pub fn add_command<S, D, H>(&mut self, name: S, doc: D, handler: H) -> Result<()>
    where
        S: Into<String>,
        D: Into<String>,
        H: Fn(&mut Machine<F>, &Value) -> Result<CommandReply> + 'static,
    {
        self.machine.commands.add(name, doc, handler)
    }

    /// Open the postman and enter the initial state
    pub fn run(&mut self) -> Result<()> {
        if self.machine.running {
            return Ok(());
        }
        let init = self.machine.config.init_state.clone();
        if !self.states.contains_key(&init) {
            return Err(Error::UnknownState(init));
        }
        if !self.states.contains_key(&self.machine.config.idle_state) {
            return Err(Error::UnknownState(self.machine.config.idle_state.clone()));
        }

        self.machine.postman.open_channel()?;
        self.machine.running = true;
        info!(
            "{} {} running on {}",
            self.machine.config.name,
            self.machine.config.version,
            self.machine.postman.channel_name()
        );

        self.machine.go_to_state(init, Context::new())?;
        self.apply_transitions();
        Ok(())
    }

    /// Leave the active state and close the postman
    pub fn stop(&mut self) -> Result<()> {
        if !self.machine.running {
            return Ok(());
        }
        self.exit_current();
        self.machine.pending = None;
        self.machine.sequencer.reset();
        self.machine.running = false;
        self.machine.inbox.flush();
        self.machine.postman.close_channel()?;
        info!("{} stopped", self.machine.config.name);
        Ok(())
    }

    /// Run one cooperative tick
    pub fn update(&mut self) -> Result<()> {
        if !self.machine.running {
            return Err(Error::NotRunning);
        }

        if self.accepts_instructions() {
            self.poll_postman()?;
        }

        self.tick();

        let now = Instant::now();
        if self.machine.telemetry_due(now) {
            if let Err(e) = self.machine.send_telemetry() {
                warn!("Failed to send telemetry: {}", e);
            }
        }
        Ok(())
    }

    /// Request a transition and apply it immediately
    pub fn go_to_state<S: Into<String>>(&mut self, name: S, context: Context) -> Result<()> {
        self.machine.go_to_state(name, context)?;
        self.apply_transitions();
        Ok(())
    }

    /// Dispatch an instruction payload as if it had arrived on the postman
    pub fn handle_instruction(&mut self, payload: &Value) -> Result<()> {
        if !self.machine.running {
            return Err(Error::NotRunning);
        }
        self.machine.handle_instruction(payload);
        self.apply_transitions();
        Ok(())
    }

    /// Start a sequence from driver code
    pub fn start_sequence(&mut self, steps: Vec<Step>, persistent: bool, context: Context) -> Result<bool> {
        if !self.machine.running {
            return Err(Error::NotRunning);
        }
        let started = self.machine.start_sequence(steps, persistent, context);
        self.apply_transitions();
        Ok(started)
    }

    /// Name of the active state
    pub fn current_state(&self) -> Option<&str> {
        self.machine.current_state()
    }

    /// Whether the machine is running
    pub fn is_running(&self) -> bool {
        self.machine.running
    }

    /// Shared machine state
    pub fn machine(&self) -> &Machine<F> {
        &self.machine
    }

    /// Shared machine state, mutably
    pub fn machine_mut(&mut self) -> &mut Machine<F> {
        &mut self.machine
    }

    /// Machine-specific flags
    pub fn flags(&self) -> &F {
        &self.machine.flags
    }

    /// Names of the registered states
    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    fn accepts_instructions(&self) -> bool {
        self.session
            .as_ref()
            .and_then(|active| self.states.get(&active.state))
            .map_or(true, |state| state.accepts_instructions())
    }

    fn poll_postman(&mut self) -> Result<()> {
        for _ in 0..MAX_FRAMES_PER_UPDATE {
            let Some(raw) = self.machine.postman.receive()? else {
                break;
            };
            let message = match Message::parse(&raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping malformed frame: {}", e);
                    continue;
                }
            };

            if message.status() == Status::Instruction {
                let span = operation_span(message.func().unwrap_or("?"), &self.machine.config.name);
                let _entered = span.enter();
                self.machine.handle_instruction(message.payload());
                self.apply_transitions();
            } else if let Ok(Some(evicted)) = self.machine.inbox.store(message) {
                debug!("Inbox full, dropped {} from {}", evicted.status(), evicted.subsystem_name());
            }

            if !self.accepts_instructions() {
                break;
            }
        }
        Ok(())
    }

    fn tick(&mut self) {
        let Some(active) = self.session.as_mut() else {
            return;
        };

        match active.session.update(&mut self.machine) {
            Ok(Progress::Complete) if !active.completed => {
                active.completed = true;
                debug!("State {} complete", active.state);
                self.machine.advance_sequence();
            }
            Ok(_) => {}
            Err(e) => {
                let state = active.state.clone();
                self.fail(&state, e);
            }
        }
        self.apply_transitions();
    }

    fn apply_transitions(&mut self) {
        while let Some(transition) = self.machine.pending.take() {
            self.exit_current();
            self.enter(transition);
        }
    }

    fn exit_current(&mut self) {
        if let Some(mut active) = self.session.take() {
            active.session.exit(&mut self.machine);
            debug!("Exited {}", active.state);
        }
        self.machine.current = None;
    }

    fn enter(&mut self, transition: Transition) {
        let Transition { state, context } = transition;
        let Some(target) = self.states.get(&state) else {
            self.fail(&state, Error::UnknownState(state.clone()));
            return;
        };

        let missing = context.missing(target.required_context());
        if !missing.is_empty() {
            let error = Error::context(format!("state {} requires {}", state, missing.join(", ")));
            self.fail(&state, error);
            return;
        }

        match target.enter(&mut self.machine, &context) {
            Ok(session) => {
                debug!("Entered {}", state);
                self.machine.current = Some(state.clone());
                self.session = Some(ActiveSession {
                    state,
                    session,
                    completed: false,
                });
            }
            Err(e) => self.fail(&state, e),
        }
    }

    fn fail(&mut self, state: &str, error: Error) {
        if state == self.machine.config.idle_state {
            error!("Idle state {} failed: {}", state, error);
            return;
        }
        self.machine.abort_sequence(&format!("{}: {}", state, error));
    }
}

impl<F: fmt::Debug> fmt::Debug for StateMachine<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("machine", &self.machine)
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labwire_devices::postman::{FakeLink, FakePostman};

    type Log = Vec<String>;

    struct Recorder {
        name: &'static str,
        required: &'static [&'static str],
        complete_after: Option<u32>,
        accepts: bool,
        fail_enter: bool,
    }

    impl Recorder {
        fn waiting(name: &'static str) -> Self {
            Self {
                name,
                required: &[],
                complete_after: None,
                accepts: true,
                fail_enter: false,
            }
        }

        fn completing(name: &'static str, ticks: u32) -> Self {
            Self {
                complete_after: Some(ticks),
                ..Self::waiting(name)
            }
        }
    }

    impl State<Log> for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn required_context(&self) -> &[&str] {
            self.required
        }

        fn accepts_instructions(&self) -> bool {
            self.accepts
        }

        fn enter(&self, machine: &mut Machine<Log>, _context: &Context) -> Result<Box<dyn Session<Log>>> {
            if self.fail_enter {
                return Err(Error::other("motor stalled"));
            }
            machine.flags.push(format!("enter {}", self.name));
            Ok(Box::new(RecorderSession {
                name: self.name,
                remaining: self.complete_after,
            }))
        }
    }

    struct RecorderSession {
        name: &'static str,
        remaining: Option<u32>,
    }

    impl Session<Log> for RecorderSession {
        fn update(&mut self, _machine: &mut Machine<Log>) -> Result<Progress> {
            match &mut self.remaining {
                Some(0) => Ok(Progress::Complete),
                Some(n) => {
                    *n -= 1;
                    Ok(Progress::Running)
                }
                None => Ok(Progress::Running),
            }
        }

        fn exit(&mut self, machine: &mut Machine<Log>) {
            machine.flags.push(format!("exit {}", self.name));
        }
    }

    fn build(config: MachineConfig) -> (StateMachine<Log>, FakeLink) {
        let postman = FakePostman::new();
        let link = postman.link();
        let mut machine = StateMachine::new(config, Box::new(postman), Log::new());
        machine.add_state(Recorder::waiting("Idle")).unwrap();
        machine.add_state(Recorder::completing("A", 0)).unwrap();
        machine.add_state(Recorder::completing("B", 0)).unwrap();
        machine.add_state(Recorder::completing("C", 0)).unwrap();
        machine.add_state(Recorder::waiting("Hold")).unwrap();
        machine
            .add_state(Recorder {
                required: &["x"],
                ..Recorder::completing("NeedsX", 0)
            })
            .unwrap();
        (machine, link)
    }

    fn running() -> (StateMachine<Log>, FakeLink) {
        let config = MachineConfig {
            name: "pump".to_string(),
            ..MachineConfig::default()
        };
        let (mut machine, link) = build(config);
        machine.run().unwrap();
        (machine, link)
    }

    fn steps(names: &[&str]) -> Vec<Step> {
        names.iter().map(|name| Step::new(*name)).collect()
    }

    fn updates(machine: &mut StateMachine<Log>, n: usize) {
        for _ in 0..n {
            machine.update().unwrap();
        }
    }

    fn count(messages: &[Message], status: Status) -> usize {
        messages.iter().filter(|m| m.status() == status).count()
    }

    #[test]
    fn test_requires_run() {
        let (mut machine, link) = build(MachineConfig::default());
        assert!(matches!(machine.update(), Err(Error::NotRunning)));
        assert!(matches!(machine.go_to_state("A", Context::new()), Err(Error::NotRunning)));
        assert!(matches!(
            machine.handle_instruction(&json!({ "func": "ping" })),
            Err(Error::NotRunning)
        ));
        assert_eq!(link.open_count(), 0);

        machine.run().unwrap();
        assert!(machine.is_running());
        assert_eq!(machine.current_state(), Some("Idle"));
        assert_eq!(link.open_count(), 1);
    }

    #[test]
    fn test_run_requires_registered_init_state() {
        let config = MachineConfig {
            init_state: "Boot".to_string(),
            ..MachineConfig::default()
        };
        let (mut machine, _link) = build(config);
        assert!(matches!(machine.run(), Err(Error::UnknownState(name)) if name == "Boot"));
        assert!(!machine.is_running());
    }

    #[test]
    fn test_add_state_rules() {
        let (mut machine, _link) = build(MachineConfig::default());
        assert!(matches!(
            machine.add_state(Recorder::waiting("A")),
            Err(Error::DuplicateState(name)) if name == "A"
        ));
        assert!(matches!(machine.add_state(Recorder::waiting("")), Err(Error::InvalidState(_))));
        assert!(matches!(
            machine.add_command("ping", "again", |_, _| Ok(CommandReply::ok())),
            Err(Error::DuplicateCommand(_))
        ));
    }

    #[test_log::test]
    fn test_exit_precedes_enter() {
        let (mut machine, _link) = running();
        machine.go_to_state("Hold", Context::new()).unwrap();
        machine.go_to_state("Idle", Context::new()).unwrap();

        assert_eq!(
            machine.flags(),
            &vec!["enter Idle", "exit Idle", "enter Hold", "exit Hold", "enter Idle"]
        );

        assert!(matches!(
            machine.go_to_state("Nowhere", Context::new()),
            Err(Error::UnknownState(_))
        ));
        assert_eq!(machine.current_state(), Some("Idle"));
    }

    #[test]
    fn test_unknown_command_gets_one_problem() {
        let (mut machine, link) = running();
        link.push_message(&Message::instruction("host", "explode", json!({})));
        machine.update().unwrap();

        let sent = link.take_sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status(), Status::Problem);
        assert_eq!(sent[0].subsystem_name(), "pump");
        assert!(sent[0].payload()["error"].as_str().unwrap().contains("explode"));

        machine.handle_instruction(&json!({ "args": {} })).unwrap();
        assert_eq!(count(&link.take_sent_messages(), Status::Problem), 1);
    }

    #[test]
    fn test_handler_replies() {
        let (mut machine, link) = running();
        machine
            .add_command("dispense", "Dispense args.volume_ml", |_, args| {
                let volume = args
                    .get("volume_ml")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| Error::command("volume_ml is required"))?;
                Ok(CommandReply::Success(json!({ "dispensed_ml": volume })))
            })
            .unwrap();
        machine
            .add_command("read", "Read the sensor", |_, _| {
                Ok(CommandReply::data("reading", json!({ "od": 0.42 })))
            })
            .unwrap();

        machine
            .handle_instruction(&json!({ "func": "dispense", "args": { "volume_ml": 1.5 } }))
            .unwrap();
        machine.handle_instruction(&json!({ "func": "dispense", "args": {} })).unwrap();
        machine.handle_instruction(&json!({ "func": "read" })).unwrap();

        let sent = link.take_sent_messages();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].status(), Status::Success);
        assert_eq!(sent[0].payload()["dispensed_ml"], 1.5);
        assert_eq!(sent[1].status(), Status::Problem);
        assert!(sent[1].payload()["error"].as_str().unwrap().contains("volume_ml"));
        assert_eq!(sent[2].status(), Status::DataResponse);
        assert_eq!(sent[2].response_kind(), Some("reading"));
        assert_eq!(sent[2].data().unwrap()["od"], 0.42);
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let (mut machine, link) = running();
        link.push_line("{not json");
        link.push_message(&Message::new("host", Status::Info));
        machine.update().unwrap();

        assert!(link.sent().is_empty());
        assert_eq!(machine.machine_mut().inbox().len(), 1);
        assert_eq!(machine.machine_mut().inbox().get().unwrap().subsystem_name(), "host");
    }

    #[test_log::test]
    fn test_sequence_happy_path() {
        let (mut machine, link) = running();
        machine
            .add_command("triple", "Run A, B and C", |machine, _| {
                let context = Context::new().with("sequence_name", "triple");
                machine.start_sequence(steps(&["A", "B", "C"]), false, context);
                Ok(CommandReply::Deferred)
            })
            .unwrap();

        link.push_message(&Message::instruction("host", "triple", json!({})));
        updates(&mut machine, 6);

        assert_eq!(
            machine.flags(),
            &vec![
                "enter Idle",
                "exit Idle",
                "enter A",
                "exit A",
                "enter B",
                "exit B",
                "enter C",
                "exit C",
                "enter Idle"
            ]
        );

        let sent = link.take_sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status(), Status::Success);
        assert_eq!(sent[0].payload()["sequence_name"], "triple");
        assert!(sent[0].meta().contains_key("sequence_id"));
        assert!(!machine.machine().sequencer().is_active());
        assert_eq!(machine.current_state(), Some("Idle"));
    }

    #[test]
    fn test_sequence_aborts_on_missing_context() {
        let (mut machine, link) = running();
        assert!(machine
            .start_sequence(steps(&["A", "NeedsX", "B"]), false, Context::new())
            .unwrap());
        updates(&mut machine, 4);

        let sent = link.take_sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status(), Status::Problem);
        assert_eq!(sent[0].payload()["sequence_name"], "Unnamed");
        assert!(sent[0].payload()["error"].as_str().unwrap().contains("x"));

        assert_eq!(machine.current_state(), Some("Idle"));
        assert!(!machine.machine().sequencer().is_active());
        assert!(!machine.flags().iter().any(|entry| entry == "enter NeedsX" || entry == "enter B"));
    }

    #[test]
    fn test_sequence_step_context_satisfies_requirement() {
        let (mut machine, link) = running();
        let steps = vec![Step::new("NeedsX").with_context("x", 1)];
        machine.start_sequence(steps, false, Context::new()).unwrap();
        updates(&mut machine, 2);

        assert_eq!(count(&link.take_sent_messages(), Status::Success), 1);
        assert!(machine.flags().iter().any(|entry| entry == "enter NeedsX"));
    }

    #[test]
    fn test_second_sequence_is_refused() {
        let (mut machine, link) = running();
        assert!(machine.start_sequence(steps(&["Hold", "A"]), false, Context::new()).unwrap());
        assert!(!machine.start_sequence(steps(&["B"]), false, Context::new()).unwrap());

        let sent = link.take_sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status(), Status::Problem);

        let active = machine.machine().sequencer().active().unwrap();
        assert_eq!(active.remaining(), 1);
        assert_eq!(machine.current_state(), Some("Hold"));
    }

    #[test]
    fn test_empty_sequence_is_refused() {
        let (mut machine, link) = running();
        assert!(!machine.start_sequence(Vec::new(), false, Context::new()).unwrap());
        assert_eq!(count(&link.take_sent_messages(), Status::Problem), 1);
        assert_eq!(machine.current_state(), Some("Idle"));
    }

    #[test]
    fn test_persistent_sequence_stays_in_last_state() {
        let (mut machine, link) = running();
        machine.start_sequence(steps(&["A"]), true, Context::new()).unwrap();
        updates(&mut machine, 4);

        assert_eq!(count(&link.take_sent_messages(), Status::Success), 1);
        assert_eq!(machine.current_state(), Some("A"));
        assert!(!machine.machine().sequencer().is_active());
    }

    #[test]
    fn test_completion_outside_sequence_returns_to_idle() {
        let (mut machine, link) = running();
        machine.go_to_state("A", Context::new()).unwrap();
        machine.update().unwrap();

        assert_eq!(machine.current_state(), Some("Idle"));
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_failed_enter_aborts_sequence() {
        let (mut machine, link) = running();
        machine
            .add_state(Recorder {
                fail_enter: true,
                ..Recorder::waiting("Jammed")
            })
            .unwrap();
        machine.start_sequence(steps(&["Jammed", "A"]), false, Context::new()).unwrap();

        let sent = link.take_sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status(), Status::Problem);
        assert!(sent[0].payload()["error"].as_str().unwrap().contains("motor stalled"));
        assert_eq!(machine.current_state(), Some("Idle"));
    }

    #[test]
    fn test_busy_state_leaves_instructions_queued() {
        let (mut machine, link) = running();
        machine
            .add_state(Recorder {
                accepts: false,
                ..Recorder::waiting("Busy")
            })
            .unwrap();
        machine.go_to_state("Busy", Context::new()).unwrap();

        link.push_message(&Message::instruction("host", "ping", json!({})));
        machine.update().unwrap();
        assert!(link.sent().is_empty());
        assert_eq!(link.pending_inbound(), 1);

        machine.go_to_state("Idle", Context::new()).unwrap();
        machine.update().unwrap();
        assert_eq!(count(&link.take_sent_messages(), Status::Success), 1);
    }

    #[test]
    fn test_telemetry_interval() {
        let config = MachineConfig {
            telemetry_interval_ms: 60_000,
            ..MachineConfig::default()
        };
        let (machine, link) = build(config);
        let mut machine = machine.with_status_info(|m| {
            let mut status = Metadata::new();
            status.insert("transitions".into(), json!(m.flags.len()));
            status
        });
        machine.run().unwrap();
        updates(&mut machine, 3);

        let sent = link.take_sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status(), Status::Telemetry);
        assert_eq!(sent[0].payload()["current_state"], "Idle");
        assert_eq!(sent[0].payload()["status"]["transitions"], 1);
    }

    #[test]
    fn test_stop_exits_and_closes() {
        let (mut machine, link) = running();
        machine.stop().unwrap();

        assert_eq!(machine.flags().last().map(String::as_str), Some("exit Idle"));
        assert_eq!(machine.current_state(), None);
        assert_eq!(link.close_count(), 1);
        assert!(matches!(machine.update(), Err(Error::NotRunning)));
    }
}
