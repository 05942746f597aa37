use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{LogEntry, LogIndex, NodeId, Term};

/// Position in the log a snapshot was taken at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
}

/// Storage abstraction for Raft persistent state. §5.1, Figure 2 (Persistent state on all
/// servers): currentTerm, votedFor, and log must be stored on stable storage and survive
/// crashes. Implementations must flush to durable media before returning from any mutating
/// method: responding to an RPC before persisting violates Raft's safety guarantees.
///
/// Snapshots of the applied state are an optimisation for restart only: the log is
/// never compacted behind them.
pub trait Storage<C> {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Get the current term.
    fn current_term(&self) -> Result<Term, Self::Error>;

    /// Get the node this server voted for in the current term.
    fn voted_for(&self) -> Result<Option<NodeId>, Self::Error>;

    /// Set the current term and vote together. Must be durable before returning.
    fn set_term_and_vote(&mut self, term: Term, vote: Option<NodeId>) -> Result<(), Self::Error>;

    /// Get the last log index.
    fn last_log_index(&self) -> Result<LogIndex, Self::Error>;

    /// Get the term at a specific log index. Index 0 has term 0; returns None if
    /// index is out of bounds.
    fn term_at(&self, index: LogIndex) -> Result<Option<Term>, Self::Error>;

    /// Get a log entry by index.
    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry<C>>, Self::Error>;

    /// Get at most `limit` log entries starting from an index.
    fn entries_from(&self, start: LogIndex, limit: usize)
        -> Result<Vec<LogEntry<C>>, Self::Error>;

    /// Append an entry to the log. Returns the index of the new entry.
    fn append(&mut self, entry: LogEntry<C>) -> Result<LogIndex, Self::Error>;

    /// Truncate the log from the given index (inclusive).
    fn truncate_from(&mut self, index: LogIndex) -> Result<(), Self::Error>;

    /// Append multiple entries, handling conflicts per Raft rules.
    /// If an existing entry conflicts with a new one (same index, different term),
    /// delete the existing entry and all that follow it.
    fn append_entries(
        &mut self,
        prev_log_index: LogIndex,
        entries: Vec<LogEntry<C>>,
    ) -> Result<(), Self::Error>;

    /// Replace the stored snapshot. Must be durable before returning.
    fn save_snapshot<S: Serialize>(&mut self, meta: SnapshotMeta, state: &S)
        -> Result<(), Self::Error>;

    /// Load the latest snapshot, if one was ever saved.
    fn load_snapshot<S: DeserializeOwned>(&self) -> Result<Option<(SnapshotMeta, S)>, Self::Error>;

    /// Term of the last entry, or term 0 for an empty log.
    fn last_log_term(&self) -> Result<Term, Self::Error> {
        let last = self.last_log_index()?;
        Ok(self.term_at(last)?.unwrap_or_default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryStorageError {
    #[error("snapshot encoding: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// In-memory storage for testing. Survives a simulated crash as long as the
/// value itself is kept.
pub struct MemoryStorage<C> {
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry<C>>,
    snapshot: Option<(SnapshotMeta, Vec<u8>)>,
}

impl<C> MemoryStorage<C> {
    pub fn new() -> Self {
        Self {
            current_term: Term::default(),
            voted_for: None,
            log: Vec::new(),
            snapshot: None,
        }
    }
}

impl<C> Default for MemoryStorage<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared conflict-resolving append used by every backend. Returns the array index
/// the log was truncated at, if a divergent suffix had to be dropped.
pub(crate) fn merge_entries<C>(
    log: &mut Vec<LogEntry<C>>,
    prev_log_index: LogIndex,
    entries: Vec<LogEntry<C>>,
) -> Option<usize> {
    let mut insert_index = prev_log_index.next();
    let mut truncated_at = None;

    for entry in entries {
        match insert_index.to_array_index() {
            Some(idx) if idx < log.len() => {
                if log[idx].term != entry.term {
                    tracing::debug!(
                        index = %insert_index,
                        ours = %log[idx].term,
                        leader = %entry.term,
                        "log divergence, truncating conflicting suffix"
                    );
                    log.truncate(idx);
                    log.push(entry);
                    truncated_at.get_or_insert(idx);
                }
                // Same term at this index: already present, skip.
            }
            _ => log.push(entry),
        }
        insert_index = insert_index.next();
    }

    truncated_at
}

impl<C: Clone> Storage<C> for MemoryStorage<C> {
    type Error = MemoryStorageError;

    fn current_term(&self) -> Result<Term, Self::Error> {
        Ok(self.current_term)
    }

    fn voted_for(&self) -> Result<Option<NodeId>, Self::Error> {
        Ok(self.voted_for)
    }

    fn set_term_and_vote(&mut self, term: Term, vote: Option<NodeId>) -> Result<(), Self::Error> {
        self.current_term = term;
        self.voted_for = vote;
        Ok(())
    }

    fn last_log_index(&self) -> Result<LogIndex, Self::Error> {
        Ok(LogIndex::from_length(self.log.len()))
    }

    fn term_at(&self, index: LogIndex) -> Result<Option<Term>, Self::Error> {
        match index.to_array_index() {
            None => Ok(Some(Term::default())),
            Some(idx) => Ok(self.log.get(idx).map(|e| e.term)),
        }
    }

    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry<C>>, Self::Error> {
        match index.to_array_index() {
            None => Ok(None),
            Some(idx) => Ok(self.log.get(idx).cloned()),
        }
    }

    fn entries_from(
        &self,
        start: LogIndex,
        limit: usize,
    ) -> Result<Vec<LogEntry<C>>, Self::Error> {
        let idx = start.to_array_index().unwrap_or(0);
        Ok(self
            .log
            .iter()
            .skip(idx)
            .take(limit)
            .cloned()
            .collect())
    }

    fn append(&mut self, entry: LogEntry<C>) -> Result<LogIndex, Self::Error> {
        debug_assert_eq!(entry.index, LogIndex::from_length(self.log.len()).next());
        self.log.push(entry);
        Ok(LogIndex::from_length(self.log.len()))
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), Self::Error> {
        if let Some(idx) = index.to_array_index() {
            self.log.truncate(idx);
        }
        Ok(())
    }

    fn append_entries(
        &mut self,
        prev_log_index: LogIndex,
        entries: Vec<LogEntry<C>>,
    ) -> Result<(), Self::Error> {
        merge_entries(&mut self.log, prev_log_index, entries);
        Ok(())
    }

    fn save_snapshot<S: Serialize>(
        &mut self,
        meta: SnapshotMeta,
        state: &S,
    ) -> Result<(), Self::Error> {
        self.snapshot = Some((meta, serde_json::to_vec(state)?));
        Ok(())
    }

    fn load_snapshot<S: DeserializeOwned>(
        &self,
    ) -> Result<Option<(SnapshotMeta, S)>, Self::Error> {
        match &self.snapshot {
            None => Ok(None),
            Some((meta, bytes)) => Ok(Some((*meta, serde_json::from_slice(bytes)?))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64, command: &str) -> LogEntry<String> {
        LogEntry {
            term: Term::from(term),
            index: LogIndex::from(index),
            command: Some(command.to_string()),
        }
    }

    #[test]
    fn memory_storage_term_and_vote() {
        let mut storage: MemoryStorage<String> = MemoryStorage::new();

        assert_eq!(storage.current_term().unwrap(), Term::default());
        assert_eq!(storage.voted_for().unwrap(), None);

        storage
            .set_term_and_vote(Term::from(5), Some(NodeId::from(3)))
            .unwrap();

        assert_eq!(storage.current_term().unwrap(), Term::from(5));
        assert_eq!(storage.voted_for().unwrap(), Some(NodeId::from(3)));
    }

    #[test]
    fn memory_storage_append_and_read() {
        let mut storage: MemoryStorage<String> = MemoryStorage::new();

        assert_eq!(storage.append(entry(1, 1, "a")).unwrap(), LogIndex::from(1));
        assert_eq!(storage.append(entry(1, 2, "b")).unwrap(), LogIndex::from(2));

        assert_eq!(storage.last_log_index().unwrap(), LogIndex::from(2));
        assert_eq!(storage.last_log_term().unwrap(), Term::from(1));
        assert_eq!(storage.term_at(LogIndex::from(1)).unwrap(), Some(Term::from(1)));
        assert_eq!(storage.term_at(LogIndex::from(3)).unwrap(), None);
        assert_eq!(
            storage.entry(LogIndex::from(1)).unwrap().and_then(|e| e.command),
            Some("a".to_string())
        );
    }

    #[test]
    fn memory_storage_entries_from_respects_limit() {
        let mut storage: MemoryStorage<String> = MemoryStorage::new();
        for (i, c) in ["a", "b", "c", "d"].iter().enumerate() {
            storage.append(entry(1, i as u64 + 1, c)).unwrap();
        }

        let batch = storage.entries_from(LogIndex::from(2), 2).unwrap();
        let indices: Vec<_> = batch.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![LogIndex::from(2), LogIndex::from(3)]);

        assert!(storage.entries_from(LogIndex::from(5), 10).unwrap().is_empty());
    }

    #[test]
    fn memory_storage_truncate() {
        let mut storage: MemoryStorage<String> = MemoryStorage::new();
        storage.append(entry(1, 1, "a")).unwrap();
        storage.append(entry(1, 2, "b")).unwrap();
        storage.append(entry(1, 3, "c")).unwrap();

        storage.truncate_from(LogIndex::from(2)).unwrap();

        assert_eq!(storage.last_log_index().unwrap(), LogIndex::from(1));
    }

    #[test]
    fn memory_storage_append_entries_with_conflict() {
        let mut storage: MemoryStorage<String> = MemoryStorage::new();
        storage.append(entry(1, 1, "a")).unwrap();
        storage.append(entry(1, 2, "old")).unwrap();
        storage.append(entry(1, 3, "older")).unwrap();

        storage
            .append_entries(LogIndex::from(1), vec![entry(2, 2, "new")])
            .unwrap();

        assert_eq!(storage.last_log_index().unwrap(), LogIndex::from(2));
        assert_eq!(
            storage.entry(LogIndex::from(2)).unwrap().and_then(|e| e.command),
            Some("new".to_string())
        );
    }

    #[test]
    fn append_entries_ignores_already_present_prefix() {
        let mut storage: MemoryStorage<String> = MemoryStorage::new();
        storage.append(entry(1, 1, "a")).unwrap();
        storage.append(entry(1, 2, "b")).unwrap();

        // A delayed, shorter AppendEntries must not truncate the matching suffix.
        storage
            .append_entries(LogIndex::default(), vec![entry(1, 1, "a")])
            .unwrap();

        assert_eq!(storage.last_log_index().unwrap(), LogIndex::from(2));
    }

    #[test]
    fn memory_storage_snapshot_round_trip() {
        let mut storage: MemoryStorage<String> = MemoryStorage::new();
        assert!(storage.load_snapshot::<Vec<u32>>().unwrap().is_none());

        let meta = SnapshotMeta {
            last_index: LogIndex::from(4),
            last_term: Term::from(2),
        };
        storage.save_snapshot(meta, &vec![1u32, 2, 3]).unwrap();

        let (loaded_meta, state) = storage.load_snapshot::<Vec<u32>>().unwrap().unwrap();
        assert_eq!(loaded_meta, meta);
        assert_eq!(state, vec![1, 2, 3]);
    }
}
