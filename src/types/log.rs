use serde::{Deserialize, Serialize};

use super::primitives::{LogIndex, Term};

/// A single entry in the replicated log.
///
/// `command` is `None` for the no-op a leader appends when it takes office.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub term: Term,
    pub index: LogIndex,
    pub command: Option<C>,
}
