//! Run history
//!
//! A bounded, newest-first log of finished runs, persisted as a single JSON
//! document. Every write goes to a temporary file in the same directory and is
//! renamed over the old log, so a crash never leaves a half-written history.

use parking_lot::RwLock;
use playdeck_common::{Error, Result, RunId, RunRecord};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Records kept before the oldest is evicted
pub const HISTORY_CAPACITY: usize = 100;

/// Durable run history
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    capacity: usize,
    records: RwLock<Vec<RunRecord>>,
}

impl HistoryStore {
    /// Open the history at `path`. A missing file is an empty history; an
    /// unreadable one is an error rather than silently discarded.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_capacity(path, HISTORY_CAPACITY)
    }

    pub fn with_capacity(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let path = path.into();
        let capacity = capacity.max(1);

        let mut records: Vec<RunRecord> = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::History(format!("corrupt history at {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        records.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        records.truncate(capacity);

        info!("Opened history at {} ({} runs)", path.display(), records.len());

        Ok(Self {
            path,
            capacity,
            records: RwLock::new(records),
        })
    }

    /// Add a finished run at the front, evicting past capacity.
    ///
    /// The in-memory log only changes once the new log is on disk.
    pub fn append(&self, record: RunRecord) -> Result<()> {
        let mut records = self.records.write();

        if records.iter().any(|r| r.run_id == record.run_id) {
            return Err(Error::History(format!(
                "run {} is already recorded",
                record.run_id
            )));
        }

        let mut next = Vec::with_capacity(self.capacity);
        next.push(record);
        next.extend(records.iter().take(self.capacity - 1).cloned());

        self.persist(&next)?;

        debug!(
            "History now holds {} runs (newest {})",
            next.len(),
            next[0].run_id
        );
        *records = next;
        Ok(())
    }

    fn persist(&self, records: &[RunRecord]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), records)?;
        tmp.as_file_mut().flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| Error::History(format!("replace {}: {}", self.path.display(), e)))?;
        Ok(())
    }

    /// All records, newest first
    pub fn all(&self) -> Vec<RunRecord> {
        self.records.read().clone()
    }

    pub fn latest(&self) -> Option<RunRecord> {
        self.records.read().first().cloned()
    }

    pub fn get(&self, run_id: RunId) -> Option<RunRecord> {
        self.records
            .read()
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use playdeck_common::{RunConfig, RunStatus, ScriptResult};
    use std::collections::BTreeMap;

    fn record(id: u64) -> RunRecord {
        let config = RunConfig::new("ZA", ["login"], BTreeMap::new()).unwrap();
        RunRecord::new(
            RunId(id),
            Utc::now(),
            config,
            RunStatus::Passed,
            vec![ScriptResult::missing("login")],
        )
    }

    #[test]
    fn test_empty_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json")).unwrap();
        assert!(store.is_empty());
        assert!(store.latest().is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json")).unwrap();

        for id in 1..=101 {
            store.append(record(id)).unwrap();
        }

        assert_eq!(store.len(), HISTORY_CAPACITY);
        let all = store.all();
        assert_eq!(all[0].run_id, RunId(101));
        assert_eq!(all[99].run_id, RunId(2));
        assert!(store.get(RunId(1)).is_none());
    }

    #[test]
    fn test_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        {
            let store = HistoryStore::open(&path).unwrap();
            store.append(record(1)).unwrap();
            store.append(record(2)).unwrap();
        }

        let reopened = HistoryStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.latest().unwrap().run_id, RunId(2));
        assert_eq!(reopened.get(RunId(1)).unwrap().config, record(1).config);
    }

    #[test]
    fn test_corrupt_history_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "[{ this is not json").unwrap();

        let err = HistoryStore::open(&path).unwrap_err();
        assert!(matches!(err, Error::History(_)));
        // Left untouched for inspection
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[{ this is not json"
        );
    }

    #[test]
    fn test_duplicate_run_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json")).unwrap();
        store.append(record(7)).unwrap();
        assert!(store.append(record(7)).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        let store = HistoryStore::open(blocker.join("history.json")).unwrap();
        std::fs::write(&blocker, "file").unwrap();

        assert!(store.append(record(1)).is_err());
        assert!(store.is_empty());
    }
}
