use serde::{Deserialize, Serialize};

use crate::types::LogIndex;

/// Operations on a single atomic value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ValueCommand {
    Get,
    Set {
        value: Vec<u8>,
    },
    /// `expected: None` matches an unset value.
    CompareAndSet {
        expected: Option<Vec<u8>>,
        update: Vec<u8>,
    },
}

impl ValueCommand {
    pub fn is_read_only(&self) -> bool {
        matches!(self, ValueCommand::Get)
    }
}

/// Result of applying a command to an atomic value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueResult {
    /// Current value, for `Get`.
    Value { value: Option<Vec<u8>> },
    /// Value replaced by a `Set`.
    Previous { value: Option<Vec<u8>> },
    /// Outcome of a `CompareAndSet`; `current` is the value after the attempt.
    CompareAndSet {
        swapped: bool,
        current: Option<Vec<u8>>,
    },
}

/// An atomic register. `version` is the log index of the last mutation applied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicValue {
    value: Option<Vec<u8>>,
    version: LogIndex,
}

impl AtomicValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn version(&self) -> LogIndex {
        self.version
    }

    /// Apply a committed command found at `index`.
    pub fn apply(&mut self, index: LogIndex, command: &ValueCommand) -> ValueResult {
        match command {
            ValueCommand::Get => ValueResult::Value {
                value: self.value.clone(),
            },
            ValueCommand::Set { value } => {
                let previous = self.value.replace(value.clone());
                self.version = index;
                ValueResult::Previous { value: previous }
            }
            ValueCommand::CompareAndSet { expected, update } => {
                if self.value == *expected {
                    self.value = Some(update.clone());
                    self.version = index;
                    ValueResult::CompareAndSet {
                        swapped: true,
                        current: self.value.clone(),
                    }
                } else {
                    ValueResult::CompareAndSet {
                        swapped: false,
                        current: self.value.clone(),
                    }
                }
            }
        }
    }
}
