//! The replicated state machine: named atomic values plus the session table.
//!
//! Everything that influences a result lives in the log entry itself, including
//! the leader's timestamp used for session eviction, so replicas that apply the
//! same entries reach the same state.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::runtime::StateMachine;
use crate::session::{SessionCheck, SessionError, SessionTable, SessionTag};
use crate::types::{LogEntry, LogIndex};
use crate::value::{AtomicValue, ValueCommand, ValueResult};

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// A command as stored in the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCommand {
    pub primitive: String,
    pub command: ValueCommand,
    pub session: Option<SessionTag>,
    /// Leader wall clock at append time, in milliseconds since the epoch.
    pub issued_at_ms: u64,
}

impl ClientCommand {
    pub fn unsessioned(primitive: impl Into<String>, command: ValueCommand) -> Self {
        Self {
            primitive: primitive.into(),
            command,
            session: None,
            issued_at_ms: 0,
        }
    }
}

pub type CommandOutput = Result<ValueResult, SessionError>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AtomicValueMachine {
    values: BTreeMap<String, AtomicValue>,
    sessions: SessionTable,
    session_timeout_ms: u64,
    /// Largest command timestamp applied so far.
    clock_ms: u64,
    last_applied: LogIndex,
}

impl Default for AtomicValueMachine {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

impl AtomicValueMachine {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            values: BTreeMap::new(),
            sessions: SessionTable::new(),
            session_timeout_ms: session_timeout.as_millis() as u64,
            clock_ms: 0,
            last_applied: LogIndex::default(),
        }
    }

    /// Override the eviction window, e.g. after restoring from a snapshot taken
    /// under a different configuration.
    pub fn set_session_timeout(&mut self, timeout: Duration) {
        self.session_timeout_ms = timeout.as_millis() as u64;
    }

    /// Current contents of a primitive; unknown names read as unset.
    pub fn read(&self, primitive: &str) -> Option<&[u8]> {
        self.values.get(primitive).and_then(AtomicValue::get)
    }

    pub fn value(&self, primitive: &str) -> Option<&AtomicValue> {
        self.values.get(primitive)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    fn execute(&mut self, index: LogIndex, command: &ClientCommand) -> ValueResult {
        if command.command.is_read_only() {
            return ValueResult::Value {
                value: self.read(&command.primitive).map(<[u8]>::to_vec),
            };
        }
        self.values
            .entry(command.primitive.clone())
            .or_default()
            .apply(index, &command.command)
    }
}

impl StateMachine<ClientCommand> for AtomicValueMachine {
    type Output = CommandOutput;

    fn apply(&mut self, entry: &LogEntry<ClientCommand>) -> Option<CommandOutput> {
        if entry.index != self.last_applied.next() {
            error!(index = %entry.index, last_applied = %self.last_applied, "refusing out-of-order apply");
            return None;
        }
        self.last_applied = entry.index;

        let command = entry.command.as_ref()?;

        self.clock_ms = self.clock_ms.max(command.issued_at_ms);
        let evicted = self.sessions.expire(self.clock_ms, self.session_timeout_ms);
        if evicted > 0 {
            debug!(index = %entry.index, evicted, "expired idle sessions");
        }

        let output = match command.session {
            None => Ok(self.execute(entry.index, command)),
            Some(tag) => match self.sessions.check(tag) {
                SessionCheck::Next => {
                    let result = self.execute(entry.index, command);
                    self.sessions.record(tag, result.clone(), self.clock_ms);
                    Ok(result)
                }
                SessionCheck::Duplicate(result) => {
                    debug!(session = %tag.session_id, sequence = tag.sequence, "duplicate command, returning cached result");
                    self.sessions.touch(tag.session_id, self.clock_ms);
                    Ok(result)
                }
                SessionCheck::Rejected(err) => Err(err),
            },
        };
        Some(output)
    }

    fn last_applied(&self) -> LogIndex {
        self.last_applied
    }
}
