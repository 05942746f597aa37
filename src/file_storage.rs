use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::storage::{merge_entries, SnapshotMeta, Storage};
use crate::types::{LogEntry, LogIndex, NodeId, Term};

/// Error type for FileStorage operations. Any of these surfacing from the event
/// loop halts the node.
#[derive(Debug, thiserror::Error)]
pub enum FileStorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt storage: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("corrupt log: {0}")]
    CorruptLog(String),
}

#[derive(Serialize, Deserialize)]
struct Meta {
    current_term: Term,
    voted_for: Option<NodeId>,
}

#[derive(Serialize)]
struct SnapshotRef<'a, S> {
    meta: SnapshotMeta,
    state: &'a S,
}

#[derive(Deserialize)]
struct SnapshotFile<S> {
    meta: SnapshotMeta,
    state: S,
}

/// Disk-backed storage. Persistent state lives in three files inside `dir`:
///   meta.json     — current term and voted_for, written atomically via rename
///   log.jsonl     — one JSON object per log entry, one entry per line
///   snapshot.json — latest state machine snapshot, written atomically via rename
///
/// The in-memory log acts as a write-through cache: reads are served from
/// memory, writes update memory then flush to disk with fsync before returning.
/// This satisfies the durability requirement of §5.1 (respond only after
/// persisting state).
pub struct FileStorage<Cmd> {
    dir: PathBuf,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry<Cmd>>,
}

impl<Cmd> FileStorage<Cmd>
where
    Cmd: Serialize + DeserializeOwned,
{
    /// Open (or create) storage rooted at `dir`. On first use the directory
    /// is created and both files start empty (term=0, no vote, empty log).
    pub fn open(dir: &Path) -> Result<Self, FileStorageError> {
        fs::create_dir_all(dir)?;
        let meta = Self::read_meta(dir)?;
        let (log, torn) = Self::read_log(dir)?;
        let storage = Self {
            dir: dir.to_path_buf(),
            current_term: meta.current_term,
            voted_for: meta.voted_for,
            log,
        };
        if torn {
            tracing::warn!(
                dir = %dir.display(),
                entries = storage.log.len(),
                "discarding torn final log record"
            );
            storage.rewrite_log_file()?;
        }
        Ok(storage)
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    fn read_meta(dir: &Path) -> Result<Meta, FileStorageError> {
        let path = dir.join("meta.json");
        if !path.exists() {
            return Ok(Meta {
                current_term: Term::default(),
                voted_for: None,
            });
        }
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read log.jsonl. A final line without its terminating newline is a write
    /// that never completed (and was never acknowledged); it is dropped and
    /// reported through the returned flag. Anything else malformed is corruption.
    fn read_log(dir: &Path) -> Result<(Vec<LogEntry<Cmd>>, bool), FileStorageError> {
        let path = dir.join("log.jsonl");
        if !path.exists() {
            return Ok((Vec::new(), false));
        }
        let bytes = fs::read(&path)?;
        let mut records: Vec<&[u8]> = bytes.split(|&b| b == b'\n').collect();
        // split() always yields a final segment: empty iff the file ends with '\n'.
        let torn = records.pop().is_some_and(|tail| !tail.is_empty());

        let mut entries: Vec<LogEntry<Cmd>> = Vec::with_capacity(records.len());
        for line in records.into_iter().filter(|l| !l.is_empty()) {
            let entry: LogEntry<Cmd> = serde_json::from_slice(line)?;
            let expected = LogIndex::from_length(entries.len()).next();
            if entry.index != expected {
                return Err(FileStorageError::CorruptLog(format!(
                    "expected entry {expected}, found {}",
                    entry.index
                )));
            }
            if let Some(prev) = entries.last() {
                if entry.term < prev.term {
                    return Err(FileStorageError::CorruptLog(format!(
                        "term decreases at {}: {} after {}",
                        entry.index, entry.term, prev.term
                    )));
                }
            }
            entries.push(entry);
        }
        Ok((entries, torn))
    }

    /// Atomically replace `path`: write temp file → fsync → rename → fsync dir.
    fn write_atomically(&self, path: PathBuf, bytes: &[u8]) -> Result<(), FileStorageError> {
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        // Fsync the directory so the rename is visible after a crash.
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    fn flush_meta(&self) -> Result<(), FileStorageError> {
        let meta = Meta {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        let bytes = serde_json::to_vec(&meta)?;
        self.write_atomically(self.meta_path(), &bytes)
    }

    /// Append serialised entries to log.jsonl and fsync once.
    fn append_to_log_file(&self, entries: &[LogEntry<Cmd>]) -> Result<(), FileStorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Rewrite log.jsonl from the in-memory cache atomically and fsync.
    fn rewrite_log_file(&self) -> Result<(), FileStorageError> {
        let mut buf = Vec::new();
        for entry in &self.log {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        self.write_atomically(self.log_path(), &buf)
    }
}

impl<Cmd> Storage<Cmd> for FileStorage<Cmd>
where
    Cmd: Clone + Serialize + DeserializeOwned,
{
    type Error = FileStorageError;

    fn current_term(&self) -> Result<Term, Self::Error> {
        Ok(self.current_term)
    }

    fn voted_for(&self) -> Result<Option<NodeId>, Self::Error> {
        Ok(self.voted_for)
    }

    fn set_term_and_vote(&mut self, term: Term, vote: Option<NodeId>) -> Result<(), Self::Error> {
        self.current_term = term;
        self.voted_for = vote;
        self.flush_meta()
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

    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry<Cmd>>, Self::Error> {
        match index.to_array_index() {
            None => Ok(None),
            Some(idx) => Ok(self.log.get(idx).cloned()),
        }
    }

    fn entries_from(
        &self,
        start: LogIndex,
        limit: usize,
    ) -> Result<Vec<LogEntry<Cmd>>, Self::Error> {
        let idx = start.to_array_index().unwrap_or(0);
        Ok(self.log.iter().skip(idx).take(limit).cloned().collect())
    }

    fn append(&mut self, entry: LogEntry<Cmd>) -> Result<LogIndex, Self::Error> {
        self.append_to_log_file(std::slice::from_ref(&entry))?;
        self.log.push(entry);
        Ok(LogIndex::from_length(self.log.len()))
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), Self::Error> {
        if let Some(idx) = index.to_array_index() {
            self.log.truncate(idx);
        }
        self.rewrite_log_file()
    }

    /// Append entries per Raft rules (§5.3): if an existing entry conflicts with
    /// a new one (same index, different term), delete it and everything after.
    /// On a conflict the whole log is rewritten atomically; on a pure append
    /// only the new tail is written, keeping the common path fast.
    fn append_entries(
        &mut self,
        prev_log_index: LogIndex,
        entries: Vec<LogEntry<Cmd>>,
    ) -> Result<(), Self::Error> {
        let before = self.log.len();
        match merge_entries(&mut self.log, prev_log_index, entries) {
            Some(_) => self.rewrite_log_file(),
            None => self.append_to_log_file(&self.log[before..]),
        }
    }

    fn save_snapshot<S: Serialize>(
        &mut self,
        meta: SnapshotMeta,
        state: &S,
    ) -> Result<(), Self::Error> {
        let bytes = serde_json::to_vec(&SnapshotRef { meta, state })?;
        self.write_atomically(self.snapshot_path(), &bytes)
    }

    fn load_snapshot<S: DeserializeOwned>(
        &self,
    ) -> Result<Option<(SnapshotMeta, S)>, Self::Error> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let file: SnapshotFile<S> = serde_json::from_slice(&bytes)?;
        if file.meta.last_index > LogIndex::from_length(self.log.len()) {
            return Err(FileStorageError::CorruptLog(format!(
                "snapshot at {} is ahead of the log",
                file.meta.last_index
            )));
        }
        Ok(Some((file.meta, file.state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_fresh(dir: &Path) -> FileStorage<String> {
        FileStorage::open(dir).expect("open failed")
    }

    fn entry(term: u64, index: u64, command: Option<&str>) -> LogEntry<String> {
        LogEntry {
            term: Term::from(term),
            index: LogIndex::from(index),
            command: command.map(str::to_string),
        }
    }

    #[test]
    fn meta_survives_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let mut s = open_fresh(tmp.path());
            s.set_term_and_vote(Term::from(7), Some(NodeId::from(2)))
                .expect("set term");
        }
        let s = open_fresh(tmp.path());
        assert_eq!(s.current_term().expect("term"), Term::from(7));
        assert_eq!(s.voted_for().expect("vote"), Some(NodeId::from(2)));
    }

    #[test]
    fn log_survives_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let mut s = open_fresh(tmp.path());
            s.append(entry(1, 1, Some("a"))).expect("append");
            s.append(entry(1, 2, Some("b"))).expect("append");
        }
        let s = open_fresh(tmp.path());
        assert_eq!(s.last_log_index().expect("idx"), LogIndex::from(2));
        assert_eq!(
            s.entry(LogIndex::from(1)).expect("entry").map(|e| e.command),
            Some(Some("a".into()))
        );
        assert_eq!(
            s.entry(LogIndex::from(2)).expect("entry").map(|e| e.command),
            Some(Some("b".into()))
        );
    }

    #[test]
    fn truncate_survives_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let mut s = open_fresh(tmp.path());
            for (i, ch) in ["a", "b", "c"].into_iter().enumerate() {
                s.append(entry(1, i as u64 + 1, Some(ch))).expect("append");
            }
            s.truncate_from(LogIndex::from(2)).expect("truncate");
        }
        let s = open_fresh(tmp.path());
        assert_eq!(s.last_log_index().expect("idx"), LogIndex::from(1));
        assert_eq!(
            s.entry(LogIndex::from(1)).expect("entry").map(|e| e.command),
            Some(Some("a".into()))
        );
    }

    #[test]
    fn conflict_replaces_entries_and_survives_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let mut s = open_fresh(tmp.path());
            s.append(entry(1, 1, Some("a"))).expect("append");
            s.append(entry(1, 2, Some("old"))).expect("append");
            // Entry at index 2 conflicts (term 2 vs 1): truncate and replace.
            s.append_entries(LogIndex::from(1), vec![entry(2, 2, Some("new"))])
                .expect("append_entries");
        }
        let s = open_fresh(tmp.path());
        assert_eq!(s.last_log_index().expect("idx"), LogIndex::from(2));
        assert_eq!(
            s.entry(LogIndex::from(2)).expect("entry").map(|e| e.command),
            Some(Some("new".into()))
        );
    }

    #[test]
    fn pure_append_entries_survive_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let mut s = open_fresh(tmp.path());
            s.append(entry(1, 1, Some("a"))).expect("append");
            s.append_entries(
                LogIndex::from(1),
                vec![entry(1, 2, Some("b")), entry(1, 3, Some("c"))],
            )
            .expect("append_entries");
        }
        let s = open_fresh(tmp.path());
        assert_eq!(s.last_log_index().expect("idx"), LogIndex::from(3));
    }

    #[test]
    fn noop_entry_round_trips() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let mut s = open_fresh(tmp.path());
            s.append(entry(1, 1, None)).expect("append noop");
        }
        let s = open_fresh(tmp.path());
        assert_eq!(
            s.entry(LogIndex::from(1)).expect("entry").map(|e| e.command),
            Some(None)
        );
    }

    #[test]
    fn torn_final_record_is_discarded() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let mut s = open_fresh(tmp.path());
            s.append(entry(1, 1, Some("a"))).expect("append");
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(tmp.path().join("log.jsonl"))
            .expect("open log");
        file.write_all(br#"{"term":1,"index":2,"comm"#).expect("write torn");
        drop(file);

        let mut s = open_fresh(tmp.path());
        assert_eq!(s.last_log_index().expect("idx"), LogIndex::from(1));

        // The file was repaired, so later appends are readable.
        s.append(entry(1, 2, Some("b"))).expect("append");
        let s = open_fresh(tmp.path());
        assert_eq!(s.last_log_index().expect("idx"), LogIndex::from(2));
    }

    #[test]
    fn corrupt_interior_record_fails_open() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("log.jsonl"),
            "not json\n{\"term\":1,\"index\":2,\"command\":null}\n",
        )
        .expect("write log");

        let result = FileStorage::<String>::open(tmp.path());
        assert!(matches!(result, Err(FileStorageError::Corrupt(_))));
    }

    #[test]
    fn index_gap_fails_open() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("log.jsonl"),
            "{\"term\":1,\"index\":1,\"command\":null}\n{\"term\":1,\"index\":3,\"command\":null}\n",
        )
        .expect("write log");

        let result = FileStorage::<String>::open(tmp.path());
        assert!(matches!(result, Err(FileStorageError::CorruptLog(_))));
    }

    #[test]
    fn snapshot_survives_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let meta = SnapshotMeta {
            last_index: LogIndex::from(1),
            last_term: Term::from(1),
        };
        {
            let mut s = open_fresh(tmp.path());
            s.append(entry(1, 1, Some("a"))).expect("append");
            s.save_snapshot(meta, &"state".to_string()).expect("snapshot");
        }
        let s = open_fresh(tmp.path());
        let (loaded, state) = s
            .load_snapshot::<String>()
            .expect("load")
            .expect("snapshot present");
        assert_eq!(loaded, meta);
        assert_eq!(state, "state");
    }
}
