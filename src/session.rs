//! Client sessions: exactly-once application of retried commands.
//!
//! The server side is [`SessionTable`], part of the replicated state so every
//! replica deduplicates identically. The client side is [`Session`], which hands
//! out consecutive sequence numbers.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::ValueResult;

/// Results kept per session for answering retries.
const RECENT_RESULTS: usize = 8;

/// Client-chosen session identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub fn random() -> Self {
        SessionId(rand::random())
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        SessionId(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{:016x}", self.0)
    }
}

/// Session metadata attached to a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTag {
    pub session_id: SessionId,
    pub sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SessionError {
    #[error("out-of-order command for session {session}: expected sequence {expected}, got {received}")]
    OutOfOrder {
        session: SessionId,
        expected: u64,
        received: u64,
    },
}

/// What to do with an incoming tagged command.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionCheck {
    /// The next command in sequence: apply it.
    Next,
    /// Already applied: answer with the cached result.
    Duplicate(ValueResult),
    Rejected(SessionError),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ClientSession {
    last_sequence: u64,
    last_active_ms: u64,
    recent: VecDeque<(u64, ValueResult)>,
}

/// Per-session dedup state, keyed by session id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionTable {
    sessions: BTreeMap<SessionId, ClientSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Last applied sequence number, 0 for an unknown session.
    pub fn last_sequence(&self, session: SessionId) -> u64 {
        self.sessions
            .get(&session)
            .map_or(0, |s| s.last_sequence)
    }

    pub fn check(&self, tag: SessionTag) -> SessionCheck {
        let last = self.last_sequence(tag.session_id);
        if tag.sequence == last + 1 {
            return SessionCheck::Next;
        }

        let cached = self.sessions.get(&tag.session_id).and_then(|s| {
            s.recent
                .iter()
                .find(|(seq, _)| *seq == tag.sequence)
                .map(|(_, result)| result.clone())
        });

        match cached {
            Some(result) if tag.sequence <= last => SessionCheck::Duplicate(result),
            _ => SessionCheck::Rejected(SessionError::OutOfOrder {
                session: tag.session_id,
                expected: last + 1,
                received: tag.sequence,
            }),
        }
    }

    /// Record the result of the command `tag` names, creating the session on its
    /// first command.
    pub fn record(&mut self, tag: SessionTag, result: ValueResult, now_ms: u64) {
        let session = self
            .sessions
            .entry(tag.session_id)
            .or_insert_with(|| ClientSession {
                last_sequence: 0,
                last_active_ms: now_ms,
                recent: VecDeque::new(),
            });
        if tag.sequence <= session.last_sequence {
            return;
        }
        session.last_sequence = tag.sequence;
        session.last_active_ms = session.last_active_ms.max(now_ms);
        session.recent.push_back((tag.sequence, result));
        while session.recent.len() > RECENT_RESULTS {
            session.recent.pop_front();
        }
    }

    /// Note activity on a known session without changing its sequence.
    pub fn touch(&mut self, session: SessionId, now_ms: u64) {
        if let Some(s) = self.sessions.get_mut(&session) {
            s.last_active_ms = s.last_active_ms.max(now_ms);
        }
    }

    /// Drop sessions idle for longer than `timeout_ms`. Returns how many were evicted.
    pub fn expire(&mut self, now_ms: u64, timeout_ms: u64) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now_ms.saturating_sub(s.last_active_ms) <= timeout_ms);
        before - self.sessions.len()
    }
}

/// Client side of a session: one id, consecutive sequence numbers from 1.
#[derive(Clone, Debug)]
pub struct Session {
    id: SessionId,
    next_sequence: u64,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            next_sequence: 1,
        }
    }

    pub fn random() -> Self {
        Self::new(SessionId::random())
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Tag for the next command. Retries must reuse the returned tag.
    pub fn next_tag(&mut self) -> SessionTag {
        let tag = SessionTag {
            session_id: self.id,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        tag
    }

    /// Start over at sequence 1 after the cluster evicted this session.
    pub fn restart(&mut self) -> SessionTag {
        self.next_sequence = 1;
        self.next_tag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(session: u64, sequence: u64) -> SessionTag {
        SessionTag {
            session_id: SessionId::from(session),
            sequence,
        }
    }

    fn result(n: u8) -> ValueResult {
        ValueResult::Previous {
            value: Some(vec![n]),
        }
    }

    #[test]
    fn first_command_must_be_sequence_one() {
        let table = SessionTable::new();

        assert_eq!(table.check(tag(1, 1)), SessionCheck::Next);
        assert_eq!(
            table.check(tag(1, 2)),
            SessionCheck::Rejected(SessionError::OutOfOrder {
                session: SessionId::from(1),
                expected: 1,
                received: 2,
            })
        );
    }

    #[test]
    fn duplicate_returns_cached_result() {
        let mut table = SessionTable::new();
        table.record(tag(1, 1), result(1), 0);
        table.record(tag(1, 2), result(2), 0);

        assert_eq!(table.check(tag(1, 2)), SessionCheck::Duplicate(result(2)));
        assert_eq!(table.check(tag(1, 1)), SessionCheck::Duplicate(result(1)));
        assert_eq!(table.check(tag(1, 3)), SessionCheck::Next);
        assert_eq!(table.last_sequence(SessionId::from(1)), 2);
    }

    #[test]
    fn gap_is_rejected() {
        let mut table = SessionTable::new();
        table.record(tag(1, 1), result(1), 0);

        assert!(matches!(
            table.check(tag(1, 3)),
            SessionCheck::Rejected(SessionError::OutOfOrder { expected: 2, received: 3, .. })
        ));
    }

    #[test]
    fn results_older_than_window_are_rejected() {
        let mut table = SessionTable::new();
        for seq in 1..=(RECENT_RESULTS as u64 + 2) {
            table.record(tag(1, seq), result(seq as u8), 0);
        }

        assert!(matches!(table.check(tag(1, 1)), SessionCheck::Rejected(_)));
        assert!(matches!(
            table.check(tag(1, RECENT_RESULTS as u64 + 2)),
            SessionCheck::Duplicate(_)
        ));
    }

    #[test]
    fn sessions_are_independent() {
        let mut table = SessionTable::new();
        table.record(tag(1, 1), result(1), 0);

        assert_eq!(table.check(tag(2, 1)), SessionCheck::Next);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn idle_sessions_expire_and_restart_at_one() {
        let mut table = SessionTable::new();
        table.record(tag(1, 1), result(1), 1_000);
        table.record(tag(2, 1), result(1), 1_000);
        table.touch(SessionId::from(2), 5_000);

        assert_eq!(table.expire(7_000, 5_000), 1);

        assert_eq!(table.last_sequence(SessionId::from(1)), 0);
        assert_eq!(table.check(tag(1, 1)), SessionCheck::Next);
        assert_eq!(table.check(tag(2, 2)), SessionCheck::Next);
    }

    #[test]
    fn client_session_sequences() {
        let mut session = Session::new(SessionId::from(42));

        assert_eq!(session.next_tag().sequence, 1);
        assert_eq!(session.next_tag().sequence, 2);
        assert_eq!(session.restart().sequence, 1);
        assert_eq!(session.next_tag().sequence, 2);
        assert_eq!(session.id(), SessionId::from(42));
    }
}
