//! Storage backends.
//!
//! This module provides the core [`StorageBackend`] and [`BackendTransaction`]
//! traits and the stored-record model they exchange with the engine. The
//! traits define the interface for persisting [`StoredRecord`]s keyed by
//! canonical node paths, which keeps the engine's semantics independent of
//! the actual storage mechanism: the same read/write pipeline runs over an
//! in-memory map, an on-disk file, or a remote key-value service.
//!
//! Backends either support atomicity natively (their `commit`/`rollback`
//! apply buffered changes) or rely on the engine serializing writers through
//! the lock manager, in which case `commit`/`rollback` degenerate to
//! flushing or discarding a local buffer.

pub mod errors;
pub mod memory;

pub use errors::BackendError;
pub use memory::MemoryBackend;

use std::any::Any;
use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::Result;
use crate::path::{Path, PathBuf};
use crate::value::{Value, ValueKind, codec};

/// The unit a backend persists: one node's kind, materialized value, and
/// version metadata.
///
/// For composite kinds the value holds only the *inline* direct children;
/// children large enough for records of their own are discovered through
/// [`BackendTransaction::children_of`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// The node's value kind.
    pub kind: ValueKind,
    /// The materialized value.
    pub value: RecordValue,
    /// Time-sortable id shared by all nodes written in the same operation.
    pub revision: String,
    /// 1-based per-record write counter; resets when the node is recreated
    /// after deletion.
    pub revision_nr: u64,
    /// Creation timestamp, epoch milliseconds.
    pub created: i64,
    /// Last-modification timestamp, epoch milliseconds.
    pub modified: i64,
}

/// The materialized value of a stored record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    /// A leaf record's own value.
    Scalar(Value),
    /// A composite record's inline direct children, keyed by child key
    /// (array indices stringified).
    Children(BTreeMap<String, Value>),
}

impl StoredRecord {
    /// Creates a leaf record.
    pub fn scalar(value: Value, revision: impl Into<String>, now: i64) -> Self {
        let kind = value.kind().expect("storable value");
        Self {
            kind,
            value: RecordValue::Scalar(value),
            revision: revision.into(),
            revision_nr: 1,
            created: now,
            modified: now,
        }
    }

    /// Creates a composite record holding the given inline children.
    pub fn composite(
        kind: ValueKind,
        children: BTreeMap<String, Value>,
        revision: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            kind,
            value: RecordValue::Children(children),
            revision: revision.into(),
            revision_nr: 1,
            created: now,
            modified: now,
        }
    }

    /// True for object and array records.
    pub fn is_composite(&self) -> bool {
        self.kind.is_composite()
    }

    /// The inline children of a composite record.
    pub fn inline_children(&self) -> Option<&BTreeMap<String, Value>> {
        match &self.value {
            RecordValue::Children(map) => Some(map),
            RecordValue::Scalar(_) => None,
        }
    }

    /// The value of a leaf record.
    pub fn scalar_value(&self) -> Option<&Value> {
        match &self.value {
            RecordValue::Scalar(value) => Some(value),
            RecordValue::Children(_) => None,
        }
    }

    /// Encodes this record into its JSON wire shape:
    /// `{type, value, revision, revision_nr, created, modified}` with
    /// type-tagged inline children.
    pub fn to_wire(&self) -> serde_json::Value {
        let value = match &self.value {
            RecordValue::Scalar(value) => codec::encode_value(value),
            RecordValue::Children(children) => serde_json::Value::Object(
                children
                    .iter()
                    .map(|(k, v)| (k.clone(), codec::encode_value(v)))
                    .collect(),
            ),
        };
        serde_json::json!({
            "type": self.kind.code(),
            "value": value,
            "revision": self.revision,
            "revision_nr": self.revision_nr,
            "created": self.created,
            "modified": self.modified,
        })
    }

    /// Decodes a record from its JSON wire shape.
    pub fn from_wire(wire: &serde_json::Value) -> std::result::Result<Self, BackendError> {
        let obj = wire
            .as_object()
            .ok_or_else(|| malformed("record is not an object"))?;
        let code = obj
            .get("type")
            .and_then(|t| t.as_u64())
            .and_then(|c| u8::try_from(c).ok())
            .ok_or_else(|| malformed("missing type code"))?;
        let kind =
            ValueKind::from_code(code).map_err(|source| BackendError::ValueDecode { source })?;
        let raw_value = obj.get("value").ok_or_else(|| malformed("missing value"))?;
        let value = if kind.is_composite() {
            let map = raw_value
                .as_object()
                .ok_or_else(|| malformed("composite value is not a map"))?;
            let children = map
                .iter()
                .map(|(k, v)| Ok((k.clone(), codec::decode_value(v)?)))
                .collect::<std::result::Result<BTreeMap<_, _>, _>>()
                .map_err(|source| BackendError::ValueDecode { source })?;
            RecordValue::Children(children)
        } else {
            RecordValue::Scalar(
                codec::decode_value(raw_value)
                    .map_err(|source| BackendError::ValueDecode { source })?,
            )
        };
        Ok(Self {
            kind,
            value,
            revision: obj
                .get("revision")
                .and_then(|r| r.as_str())
                .ok_or_else(|| malformed("missing revision"))?
                .to_string(),
            revision_nr: obj
                .get("revision_nr")
                .and_then(|r| r.as_u64())
                .ok_or_else(|| malformed("missing revision_nr"))?,
            created: obj
                .get("created")
                .and_then(|r| r.as_i64())
                .ok_or_else(|| malformed("missing created"))?,
            modified: obj
                .get("modified")
                .and_then(|r| r.as_i64())
                .ok_or_else(|| malformed("missing modified"))?,
        })
    }
}

fn malformed(reason: &str) -> BackendError {
    BackendError::DeserializationFailed {
        source: <serde_json::Error as serde::de::Error>::custom(reason),
    }
}

impl serde::Serialize for StoredRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for StoredRecord {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let wire = serde_json::Value::deserialize(deserializer)?;
        StoredRecord::from_wire(&wire).map_err(serde::de::Error::custom)
    }
}

/// What a backend transaction was opened for.
#[derive(Debug, Clone)]
pub struct TransactionTarget {
    /// The path the operation is scoped to.
    pub path: PathBuf,
    /// True when the transaction will write.
    pub write: bool,
}

impl TransactionTarget {
    /// A read-only target.
    pub fn read(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write: false,
        }
    }

    /// A writable target.
    pub fn write(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write: true,
        }
    }
}

/// What the `add` callback of a streaming enumeration should receive.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncludeSpec {
    /// Load record metadata (kind, revision info).
    pub metadata: bool,
    /// Load the record's materialized value.
    pub value: bool,
}

impl IncludeSpec {
    /// Metadata and value.
    pub fn all() -> Self {
        Self {
            metadata: true,
            value: true,
        }
    }

    /// Paths only.
    pub fn paths() -> Self {
        Self::default()
    }
}

/// Filter callback of a streaming enumeration. Invoked with a candidate path
/// *before* its record is loaded; return false to skip it.
pub type CheckCallback<'a> = dyn FnMut(&Path) -> bool + Send + 'a;

/// Consumer callback of a streaming enumeration. Invoked only for paths the
/// check callback approved; return false to halt the enumeration.
pub type AddCallback<'a> = dyn FnMut(&Path, Option<&StoredRecord>) -> bool + Send + 'a;

/// Storage backend factory trait.
///
/// All backend implementations must be `Send` and `Sync` to allow sharing
/// across tasks, and implement `Any` to allow for downcasting if needed.
#[async_trait]
pub trait StorageBackend: Send + Sync + Any {
    /// A short name identifying the backend implementation.
    fn name(&self) -> &str;

    /// Opens a transaction scoped to `target`.
    ///
    /// The engine serializes writers before calling this, so a backend
    /// without native atomicity may simply buffer writes until `commit`.
    async fn transaction(&self, target: TransactionTarget) -> Result<Box<dyn BackendTransaction>>;

    /// Returns a reference to the backend instance as a dynamic `Any` type,
    /// enabling access to implementation-specific methods.
    fn as_any(&self) -> &dyn Any;
}

/// One backend transaction: all reads and writes of a single engine
/// operation.
///
/// # Streaming contract
///
/// `children_of` and `descendants_of` enumerate candidate paths in any order
/// that covers the requested subtree. For every candidate the `check`
/// callback runs *before* any metadata or value is loaded; only when it
/// returns true is the record read and `add` invoked. `add` returning false
/// halts the enumeration promptly. Backends must guarantee that `check` is
/// called for every path for which `add` might be called.
#[async_trait]
pub trait BackendTransaction: Send {
    /// The target this transaction was opened for.
    fn target(&self) -> &TransactionTarget;

    /// Reads the record at `path`, or `None` if the node has no dedicated
    /// record.
    async fn get(&mut self, path: &Path) -> Result<Option<StoredRecord>>;

    /// Writes the record at `path`, replacing any existing record.
    async fn set(&mut self, path: &Path, record: StoredRecord) -> Result<()>;

    /// Removes the record at `path`. Succeeds if no record exists.
    async fn remove(&mut self, path: &Path) -> Result<()>;

    /// Reads multiple records. The default implementation loops over
    /// [`BackendTransaction::get`].
    async fn get_multiple(&mut self, paths: &[PathBuf]) -> Result<Vec<Option<StoredRecord>>> {
        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            records.push(self.get(path).await?);
        }
        Ok(records)
    }

    /// Writes multiple records. The default implementation loops over
    /// [`BackendTransaction::set`].
    async fn set_multiple(&mut self, records: Vec<(PathBuf, StoredRecord)>) -> Result<()> {
        for (path, record) in records {
            self.set(&path, record).await?;
        }
        Ok(())
    }

    /// Removes multiple records. The default implementation loops over
    /// [`BackendTransaction::remove`].
    async fn remove_multiple(&mut self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            self.remove(path).await?;
        }
        Ok(())
    }

    /// Streams the direct children of `path` that have dedicated records.
    async fn children_of(
        &mut self,
        path: &Path,
        include: IncludeSpec,
        check: &mut CheckCallback<'_>,
        add: &mut AddCallback<'_>,
    ) -> Result<()>;

    /// Streams all descendants of `path` that have dedicated records.
    async fn descendants_of(
        &mut self,
        path: &Path,
        include: IncludeSpec,
        check: &mut CheckCallback<'_>,
        add: &mut AddCallback<'_>,
    ) -> Result<()>;

    /// Applies all buffered writes.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards all buffered writes.
    async fn rollback(self: Box<Self>, reason: &str) -> Result<()>;
}
