/*!
 * Instruction sequencing.
 *
 * A sequence is an ordered list of [`Step`]s that one instruction asks the
 * machine to walk through. The [`Sequencer`] only keeps track of where the
 * sequence is; the machine performs the transitions and sends the replies.
 *
 * A started sequence ends in exactly one terminal reply: SUCCESS when the
 * last step completes, or PROBLEM when it is aborted.
 */
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::context::{Context, SEQUENCE_NAME_KEY};
use crate::error::{Error, Result};

/// Sequence name used when the context does not provide one
pub const UNNAMED_SEQUENCE: &str = "Unnamed";

/// One step of a sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// State to enter
    pub state: String,
    /// Optional human-readable label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Entries overriding the sequence context for this step only
    #[serde(default)]
    pub context: Context,
}

impl Step {
    /// A step entering `state` with no extra context
    pub fn new<S: Into<String>>(state: S) -> Self {
        Self {
            state: state.into(),
            label: None,
            context: Context::new(),
        }
    }

    /// Attach a label
    pub fn with_label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Add a step-local context entry
    pub fn with_context<K: Into<String>, V: Into<serde_json::Value>>(mut self, key: K, value: V) -> Self {
        self.context.insert(key, value);
        self
    }
}

/// A sequence in progress
#[derive(Debug, Clone)]
pub struct ActiveSequence {
    id: Uuid,
    name: String,
    queue: VecDeque<Step>,
    context: Context,
    persistent: bool,
}

impl ActiveSequence {
    /// Correlation id carried in the terminal reply
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name taken from the `sequence_name` context entry
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps not yet entered
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// Whether the machine stays in the last state when the sequence ends
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }
}

/// Where the sequencer stands
#[derive(Debug, Clone, Default)]
pub enum SequencerState {
    /// No sequence
    #[default]
    Idle,
    /// A sequence is walking its steps
    Running(ActiveSequence),
    /// A sequence is being torn down after a failure
    Aborting {
        /// Id of the aborted sequence
        id: Uuid,
        /// Name of the aborted sequence
        name: String,
    },
}

/// What the machine must do after an advance
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// Enter the next step's state with the merged context
    Enter {
        /// Target state
        state: String,
        /// Sequence context overlaid with the step context
        context: Context,
    },
    /// The last step completed
    Finished {
        /// Sequence id
        id: Uuid,
        /// Sequence name
        name: String,
        /// Whether to stay in the last state
        persistent: bool,
    },
    /// No sequence was running
    NotRunning,
}

/// Identity of a sequence being aborted
#[derive(Debug, Clone, PartialEq)]
pub struct Aborted {
    /// Sequence id
    pub id: Uuid,
    /// Sequence name
    pub name: String,
}

/// Tracks the single sequence a machine may run at a time
#[derive(Debug, Default)]
pub struct Sequencer {
    state: SequencerState,
}

impl Sequencer {
    /// Create an idle sequencer
    pub fn new() -> Self {
        Self::default()
    }

    /// Current interpreter state
    pub fn state(&self) -> &SequencerState {
        &self.state
    }

    /// Whether a sequence is running or being aborted
    pub fn is_active(&self) -> bool {
        !matches!(self.state, SequencerState::Idle)
    }

    /// The running sequence, if any
    pub fn active(&self) -> Option<&ActiveSequence> {
        match &self.state {
            SequencerState::Running(sequence) => Some(sequence),
            _ => None,
        }
    }

    /// Begin a sequence
    ///
    /// Fails without touching the current sequence when one is already
    /// active or `steps` is empty. The caller must call
    /// [`Sequencer::advance`] to enter the first step.
    pub fn start(&mut self, steps: Vec<Step>, persistent: bool, context: Context) -> Result<Uuid> {
        if let Some(current) = self.describe() {
            return Err(Error::sequence(format!("sequence '{}' is already running", current.name)));
        }
        if steps.is_empty() {
            return Err(Error::sequence("cannot start a sequence with no steps"));
        }

        let id = Uuid::new_v4();
        let name = context.get_str(SEQUENCE_NAME_KEY).unwrap_or(UNNAMED_SEQUENCE).to_string();
        debug!("Sequence {} ({}) started with {} step(s)", name, id, steps.len());

        self.state = SequencerState::Running(ActiveSequence {
            id,
            name,
            queue: steps.into(),
            context,
            persistent,
        });
        Ok(id)
    }

    /// Move to the next step, or finish the sequence when none is left
    pub fn advance(&mut self) -> Advance {
        let SequencerState::Running(sequence) = &mut self.state else {
            return Advance::NotRunning;
        };

        match sequence.queue.pop_front() {
            Some(step) => {
                debug!(
                    "Sequence {} advancing to {}{}",
                    sequence.name,
                    step.state,
                    step.label.as_deref().map(|l| format!(" ({})", l)).unwrap_or_default()
                );
                Advance::Enter {
                    context: sequence.context.merged(&step.context),
                    state: step.state,
                }
            }
            None => {
                let finished = Advance::Finished {
                    id: sequence.id,
                    name: sequence.name.clone(),
                    persistent: sequence.persistent,
                };
                self.reset();
                finished
            }
        }
    }

    /// Enter the aborting state, returning the sequence being aborted
    pub fn begin_abort(&mut self) -> Option<Aborted> {
        let aborted = self.describe()?;
        self.state = SequencerState::Aborting {
            id: aborted.id,
            name: aborted.name.clone(),
        };
        Some(aborted)
    }

    /// Drop any sequence and return to idle
    pub fn reset(&mut self) {
        self.state = SequencerState::Idle;
    }

    fn describe(&self) -> Option<Aborted> {
        match &self.state {
            SequencerState::Idle => None,
            SequencerState::Running(sequence) => Some(Aborted {
                id: sequence.id,
                name: sequence.name.clone(),
            }),
            SequencerState::Aborting { id, name } => Some(Aborted {
                id: *id,
                name: name.clone(),
            }),
        }
    }
}
