use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonically increasing term number.
///
/// Terms act as logical clocks in Raft and are used to detect stale information.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Term {
    value: u64,
}

impl Term {
    pub fn increment(self) -> Term {
        Term {
            value: self.value.saturating_add(1),
        }
    }

    pub fn get(self) -> u64 {
        self.value
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.value)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Term { value }
    }
}

/// 1-based log index.
///
/// LogIndex 0 represents "no entries" or "before the first entry".
/// Valid log entries start at index 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogIndex {
    value: u64,
}

impl LogIndex {
    /// Create from array length (0-based length becomes 1-based index).
    pub fn from_length(len: usize) -> LogIndex {
        LogIndex { value: len as u64 }
    }

    pub fn get(self) -> u64 {
        self.value
    }

    pub fn next(self) -> LogIndex {
        LogIndex {
            value: self.value.saturating_add(1),
        }
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.value == 0 {
            None
        } else {
            Some(LogIndex {
                value: self.value - 1,
            })
        }
    }

    /// Index `count` entries after this one.
    pub fn advance(self, count: usize) -> LogIndex {
        LogIndex {
            value: self.value.saturating_add(count as u64),
        }
    }

    /// Convert to array index (0-based). Returns None for index 0.
    pub fn to_array_index(self) -> Option<usize> {
        if self.value == 0 {
            None
        } else {
            Some((self.value - 1) as usize)
        }
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.value)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        LogIndex { value }
    }
}

/// Unique server identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId {
    value: u64,
}

impl NodeId {
    pub fn get(self) -> u64 {
        self.value
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.value)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId { value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_increment() {
        assert_eq!(Term::default().increment(), Term::from(1));
    }

    #[test]
    fn log_index_array_conversion() {
        assert!(LogIndex::default().to_array_index().is_none());
        assert_eq!(LogIndex::from(1).to_array_index(), Some(0));
        assert_eq!(LogIndex::from(5).to_array_index(), Some(4));
    }

    #[test]
    fn log_index_prev_stops_at_zero() {
        assert_eq!(LogIndex::from(1).prev(), Some(LogIndex::default()));
        assert_eq!(LogIndex::default().prev(), None);
    }

    #[test]
    fn ids_serialize_as_plain_numbers() {
        let json = serde_json::to_string(&(NodeId::from(3), Term::from(7), LogIndex::from(9)))
            .expect("serialize");
        assert_eq!(json, "[3,7,9]");
    }
}
