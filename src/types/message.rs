use serde::{Deserialize, Serialize};

use super::log::LogEntry;
use super::primitives::{LogIndex, NodeId, Term};

/// RequestVote RPC arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments.
///
/// `round` numbers the leader's heartbeat broadcasts; followers echo it back so
/// the leader can date its lease.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntries<Cmd> {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry<Cmd>>,
    pub leader_commit: LogIndex,
    pub round: u64,
}

/// AppendEntries RPC response.
///
/// On success `match_index` is the last index known to match the leader. On
/// failure it is the follower's last log index, used as a back-off hint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
    pub round: u64,
}

/// All possible Raft messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message<Cmd> {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries<Cmd>),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl<Cmd> Message<Cmd> {
    /// Term carried by the message, whatever its kind.
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResponse(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesResponse(m) => m.term,
        }
    }
}
