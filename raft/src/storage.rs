use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StorageError;
use crate::msg::{EntryContent, LogEntry, LogIndex, NodeId, SnapshotHeader, Term};

type StorageResult<T> = std::result::Result<T, StorageError>;

/// Durable state owned by a single node: term, vote, log, last applied index and snapshot.
///
/// Every mutating call must be durable before it returns; the core acknowledges votes and
/// replicated entries only after these calls succeed.
pub trait PersistentStore: Send + 'static {
    fn load_term(&self) -> StorageResult<Term>;
    fn load_voted_for(&self) -> StorageResult<Option<NodeId>>;
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<&NodeId>) -> StorageResult<()>;

    fn load_last_index(&self) -> StorageResult<LogIndex>;
    /// `None` for indexes past the end or purged by compaction.
    fn entry(&self, index: LogIndex) -> StorageResult<Option<LogEntry>>;
    /// Up to `max` contiguous entries starting at `from`.
    fn entries(&self, from: LogIndex, max: usize) -> StorageResult<Vec<LogEntry>>;
    /// Appends entries; the first must directly follow the current last index.
    fn persist_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()>;
    /// Removes `index` and everything after it.
    fn truncate_from(&mut self, index: LogIndex) -> StorageResult<()>;

    fn load_last_applied(&self) -> StorageResult<LogIndex>;
    fn save_last_applied(&mut self, index: LogIndex) -> StorageResult<()>;

    fn load_snapshot(&self) -> StorageResult<Option<(SnapshotHeader, Vec<u8>)>>;
    /// Stores the snapshot and purges the log up to its last included index, leaving a
    /// `Snapshot` entry as the new log head. Saving the same snapshot id again is a no-op.
    fn save_snapshot(&mut self, header: &SnapshotHeader, data: &[u8]) -> StorageResult<()>;
}

#[derive(Debug)]
struct MemoryState {
    term: Term,
    voted_for: Option<NodeId>,
    log: BTreeMap<LogIndex, LogEntry>,
    last_applied: LogIndex,
    snapshot: Option<(SnapshotHeader, Vec<u8>)>,
}

impl Default for MemoryState {
    fn default() -> Self {
        let mut log = BTreeMap::new();
        log.insert(0, LogEntry::sentinel());
        Self {
            term: 0,
            voted_for: None,
            log,
            last_applied: 0,
            snapshot: None,
        }
    }
}

impl MemoryState {
    fn last_index(&self) -> LogIndex {
        self.log.keys().next_back().copied().unwrap_or(0)
    }

    fn snapshot_index(&self) -> LogIndex {
        self.snapshot
            .as_ref()
            .map(|(h, _)| h.last_included_index)
            .unwrap_or(0)
    }
}

/// In-memory store. Clones share the same state, so a node rebuilt from a clone observes
/// everything its predecessor persisted.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| StorageError("memory store lock poisoned".to_string()))
    }

    /// Indexes currently held, sentinel and snapshot head included.
    pub fn indexes(&self) -> StorageResult<Vec<LogIndex>> {
        Ok(self.lock()?.log.keys().copied().collect())
    }
}

impl PersistentStore for MemoryStore {
    fn load_term(&self) -> StorageResult<Term> {
        Ok(self.lock()?.term)
    }

    fn load_voted_for(&self) -> StorageResult<Option<NodeId>> {
        Ok(self.lock()?.voted_for.clone())
    }

    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<&NodeId>) -> StorageResult<()> {
        let mut state = self.lock()?;
        state.term = term;
        state.voted_for = voted_for.cloned();
        Ok(())
    }

    fn load_last_index(&self) -> StorageResult<LogIndex> {
        Ok(self.lock()?.last_index())
    }

    fn entry(&self, index: LogIndex) -> StorageResult<Option<LogEntry>> {
        Ok(self.lock()?.log.get(&index).cloned())
    }

    fn entries(&self, from: LogIndex, max: usize) -> StorageResult<Vec<LogEntry>> {
        Ok(self
            .lock()?
            .log
            .range(from..)
            .take(max)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn persist_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        let mut state = self.lock()?;
        let mut expected = state.last_index() + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(StorageError(format!(
                    "non-contiguous append: expected index {expected}, got {}",
                    entry.index
                )));
            }
            state.log.insert(entry.index, entry.clone());
            expected += 1;
        }
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> StorageResult<()> {
        let mut state = self.lock()?;
        if index == 0 || index <= state.snapshot_index() {
            return Err(StorageError(format!(
                "cannot truncate compacted or sentinel index {index}"
            )));
        }
        state.log.split_off(&index);
        Ok(())
    }

    fn load_last_applied(&self) -> StorageResult<LogIndex> {
        Ok(self.lock()?.last_applied)
    }

    fn save_last_applied(&mut self, index: LogIndex) -> StorageResult<()> {
        self.lock()?.last_applied = index;
        Ok(())
    }

    fn load_snapshot(&self) -> StorageResult<Option<(SnapshotHeader, Vec<u8>)>> {
        Ok(self.lock()?.snapshot.clone())
    }

    fn save_snapshot(&mut self, header: &SnapshotHeader, data: &[u8]) -> StorageResult<()> {
        let mut state = self.lock()?;
        if let Some((existing, _)) = &state.snapshot {
            if existing.snapshot_id == header.snapshot_id {
                return Ok(());
            }
            if existing.last_included_index >= header.last_included_index {
                return Err(StorageError(format!(
                    "snapshot {} does not advance past {}",
                    header.snapshot_id, existing.snapshot_id
                )));
            }
        }

        let boundary = header.last_included_index;
        let matches_log = state
            .log
            .get(&boundary)
            .is_some_and(|e| e.term == header.last_included_term);
        // Keep the suffix only when it extends the snapshot; otherwise it conflicts.
        let suffix = if matches_log {
            state.log.split_off(&(boundary + 1))
        } else {
            BTreeMap::new()
        };
        let mut log = BTreeMap::new();
        log.insert(0, LogEntry::sentinel());
        log.insert(
            boundary,
            LogEntry::new(
                boundary,
                header.last_included_term,
                EntryContent::Snapshot(header.clone()),
            ),
        );
        log.extend(suffix);
        state.log = log;
        state.snapshot = Some((header.clone(), data.to_vec()));
        Ok(())
    }
}
