//! A simple in-memory backend implementation using an ordered map.
//!
//! This backend is suitable for testing, development, or scenarios where
//! data persistence is not strictly required or is handled externally. It
//! provides basic persistence capabilities via `save_to_file` and
//! `load_from_file`, serializing the record map to JSON in the record wire
//! shape.
//!
//! Records are keyed by canonical path in a `BTreeMap`, so subtree
//! enumeration is a range scan. The backend has no native atomicity: it
//! relies on the engine serializing writers, and its transactions buffer
//! writes until `commit`.

use std::any::Any;
use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    AddCallback, BackendError, BackendTransaction, CheckCallback, IncludeSpec, StorageBackend,
    StoredRecord, TransactionTarget,
};
use crate::Result;
use crate::path::Path;

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryBackend {
    records: Arc<RwLock<BTreeMap<String, StoredRecord>>>,
}

/// Serializable mirror of the backend state for persistence.
#[derive(Serialize, Deserialize)]
struct SerializableBackend {
    records: BTreeMap<String, StoredRecord>,
}

impl MemoryBackend {
    /// Creates a new, empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dedicated records currently stored.
    pub fn record_count(&self) -> usize {
        self.records.read().expect("records lock poisoned").len()
    }

    /// True if a dedicated record exists at `path`. Primarily useful for
    /// inspection and tests.
    pub fn contains_record(&self, path: &Path) -> bool {
        self.records
            .read()
            .expect("records lock poisoned")
            .contains_key(path.as_str())
    }

    /// Saves the entire backend state to a file as JSON.
    pub fn save_to_file(&self, file: impl AsRef<std::path::Path>) -> Result<()> {
        let records = self.records.read().expect("records lock poisoned").clone();
        let serializable = SerializableBackend { records };
        let json = serde_json::to_string_pretty(&serializable)
            .map_err(|source| BackendError::SerializationFailed { source })?;
        fs::write(&file, json).map_err(|source| BackendError::FileIo { source })?;
        tracing::debug!(
            file = %file.as_ref().display(),
            records = serializable.records.len(),
            "Saved backend state"
        );
        Ok(())
    }

    /// Loads backend state from a file produced by
    /// [`MemoryBackend::save_to_file`].
    pub fn load_from_file(file: impl AsRef<std::path::Path>) -> Result<Self> {
        let json = fs::read_to_string(&file).map_err(|source| BackendError::FileIo { source })?;
        let serializable: SerializableBackend = serde_json::from_str(&json)
            .map_err(|source| BackendError::DeserializationFailed { source })?;
        tracing::debug!(
            file = %file.as_ref().display(),
            records = serializable.records.len(),
            "Loaded backend state"
        );
        Ok(Self {
            records: Arc::new(RwLock::new(serializable.records)),
        })
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("records", &self.record_count())
            .finish()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn transaction(&self, target: TransactionTarget) -> Result<Box<dyn BackendTransaction>> {
        Ok(Box::new(MemoryTransaction {
            store: Arc::clone(&self.records),
            target,
            pending: BTreeMap::new(),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One buffered transaction over the shared record map.
struct MemoryTransaction {
    store: Arc<RwLock<BTreeMap<String, StoredRecord>>>,
    target: TransactionTarget,
    /// Buffered writes: `Some` = set, `None` = remove.
    pending: BTreeMap<String, Option<StoredRecord>>,
}

impl MemoryTransaction {
    /// Candidate paths under `path`, pending writes applied over the store.
    fn subtree_paths(&self, path: &Path) -> Vec<String> {
        let store = self.store.read().expect("records lock poisoned");
        let mut candidates: Vec<String> = Vec::new();
        let prefix = path.as_str();
        let in_subtree = |key: &str| -> bool {
            if prefix.is_empty() {
                return !key.is_empty();
            }
            key.len() > prefix.len()
                && key.starts_with(prefix)
                && matches!(key.as_bytes()[prefix.len()], b'/' | b'[')
        };
        if prefix.is_empty() {
            candidates.extend(store.keys().filter(|k| in_subtree(k)).cloned());
        } else {
            for key in store
                .range::<String, _>((
                    std::ops::Bound::Excluded(prefix.to_string()),
                    std::ops::Bound::Unbounded,
                ))
                .map(|(k, _)| k)
            {
                if !key.starts_with(prefix) {
                    break;
                }
                if in_subtree(key) {
                    candidates.push(key.clone());
                }
            }
        }
        drop(store);
        for (key, record) in &self.pending {
            if record.is_some() && in_subtree(key) && !candidates.contains(key) {
                candidates.push(key.clone());
            }
        }
        candidates.retain(|key| !matches!(self.pending.get(key), Some(None)));
        candidates.sort();
        candidates
    }

    fn load(&self, key: &str) -> Option<StoredRecord> {
        if let Some(pending) = self.pending.get(key) {
            return pending.clone();
        }
        self.store
            .read()
            .expect("records lock poisoned")
            .get(key)
            .cloned()
    }

    async fn stream(
        &mut self,
        path: &Path,
        include: IncludeSpec,
        children_only: bool,
        check: &mut CheckCallback<'_>,
        add: &mut AddCallback<'_>,
    ) -> Result<()> {
        let parent_depth = path.depth();
        for key in self.subtree_paths(path) {
            let candidate = Path::parse(&key).expect("stored paths are canonical");
            if children_only && candidate.depth() != parent_depth + 1 {
                continue;
            }
            if !check(candidate) {
                continue;
            }
            let record = if include.metadata || include.value {
                self.load(&key)
            } else {
                None
            };
            if !add(candidate, record.as_ref()) {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackendTransaction for MemoryTransaction {
    fn target(&self) -> &TransactionTarget {
        &self.target
    }

    async fn get(&mut self, path: &Path) -> Result<Option<StoredRecord>> {
        Ok(self.load(path.as_str()))
    }

    async fn set(&mut self, path: &Path, record: StoredRecord) -> Result<()> {
        if !self.target.write {
            return Err(BackendError::ReadOnlyTransaction {
                path: self.target.path.as_str().to_string(),
            }
            .into());
        }
        self.pending.insert(path.as_str().to_string(), Some(record));
        Ok(())
    }

    async fn remove(&mut self, path: &Path) -> Result<()> {
        if !self.target.write {
            return Err(BackendError::ReadOnlyTransaction {
                path: self.target.path.as_str().to_string(),
            }
            .into());
        }
        self.pending.insert(path.as_str().to_string(), None);
        Ok(())
    }

    async fn children_of(
        &mut self,
        path: &Path,
        include: IncludeSpec,
        check: &mut CheckCallback<'_>,
        add: &mut AddCallback<'_>,
    ) -> Result<()> {
        self.stream(path, include, true, check, add).await
    }

    async fn descendants_of(
        &mut self,
        path: &Path,
        include: IncludeSpec,
        check: &mut CheckCallback<'_>,
        add: &mut AddCallback<'_>,
    ) -> Result<()> {
        self.stream(path, include, false, check, add).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut store = self.store.write().expect("records lock poisoned");
        for (key, record) in self.pending {
            match record {
                Some(record) => {
                    store.insert(key, record);
                }
                None => {
                    store.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>, reason: &str) -> Result<()> {
        tracing::debug!(
            path = %self.target.path,
            pending = self.pending.len(),
            reason,
            "Rolling back transaction"
        );
        Ok(())
    }
}
