//! Leader-side handling of client requests against the atomic value primitives.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::machine::{AtomicValueMachine, ClientCommand, CommandOutput};
use crate::runtime::Runtime;
use crate::session::{SessionCheck, SessionError, SessionTag};
use crate::storage::Storage;
use crate::types::{LogIndex, NodeId, Term};
use crate::value::{ValueCommand, ValueResult};

pub type PrimitiveRuntime<St> = Runtime<ClientCommand, AtomicValueMachine, St>;

/// A request as sent by clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub primitive: String,
    pub command: ValueCommand,
    #[serde(default)]
    pub session: Option<SessionTag>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClientReply {
    Ok { result: ValueResult },
    NotLeader { leader_hint: Option<NodeId> },
    OutOfOrder { expected: u64, received: u64 },
    /// Not committed within the deadline. The command may still commit later.
    Timeout,
}

impl From<CommandOutput> for ClientReply {
    fn from(output: CommandOutput) -> Self {
        match output {
            Ok(result) => ClientReply::Ok { result },
            Err(SessionError::OutOfOrder {
                expected, received, ..
            }) => ClientReply::OutOfOrder { expected, received },
        }
    }
}

/// Snapshot of a node's consensus state, served by the status endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: String,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}

impl NodeStatus {
    pub fn of<St: Storage<ClientCommand>>(runtime: &PrimitiveRuntime<St>) -> Result<Self, St::Error> {
        let node = runtime.node();
        Ok(Self {
            id: node.id,
            role: node.role.name().to_string(),
            term: node.current_term()?,
            leader: node.leader_hint(),
            commit_index: node.volatile.commit_index,
            last_applied: node.volatile.last_applied,
        })
    }
}

/// Outcome of submitting a request.
#[derive(Debug, PartialEq, Eq)]
pub enum Submission {
    /// Answered without waiting for the log.
    Done(ClientReply),
    /// Appended at `index` in `term`; the reply comes with the applied output.
    Pending { index: LogIndex, term: Term },
}

/// Route a client request on this node. Followers redirect; the leader answers
/// session-less reads from its lease when it can, answers known duplicates from
/// the session cache, and appends everything else to the log.
pub fn submit<St: Storage<ClientCommand>>(
    runtime: &mut PrimitiveRuntime<St>,
    request: ClientRequest,
    now: Instant,
    wall_ms: u64,
) -> Result<Submission, St::Error> {
    if !runtime.is_leader() {
        return Ok(Submission::Done(ClientReply::NotLeader {
            leader_hint: runtime.node().leader_hint(),
        }));
    }

    if request.session.is_none() && request.command.is_read_only() {
        if let Some(machine) = runtime.lease_read(now) {
            return Ok(Submission::Done(ClientReply::Ok {
                result: ValueResult::Value {
                    value: machine.read(&request.primitive).map(<[u8]>::to_vec),
                },
            }));
        }
    }

    if let Some(tag) = request.session {
        if let SessionCheck::Duplicate(result) = runtime.state_machine().sessions().check(tag) {
            debug!(session = %tag.session_id, sequence = tag.sequence, "answering retry from session cache");
            return Ok(Submission::Done(ClientReply::Ok { result }));
        }
    }

    let command = ClientCommand {
        primitive: request.primitive,
        command: request.command,
        session: request.session,
        issued_at_ms: wall_ms,
    };
    match runtime.submit(command)? {
        Some((index, term)) => Ok(Submission::Pending { index, term }),
        None => Ok(Submission::Done(ClientReply::NotLeader {
            leader_hint: runtime.node().leader_hint(),
        })),
    }
}
