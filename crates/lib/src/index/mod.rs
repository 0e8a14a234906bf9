//! Secondary indexes.
//!
//! An index is declared on a collection path pattern (possibly containing
//! wildcards) and a record property key; the records it tracks are the
//! direct children of the collection path. Four kinds exist: `normal`
//! (ordered by the key's value), `array` (one entry per element), `fulltext`
//! (word tokens), and `geo` (lat/long radius search). All are maintained
//! incrementally: the mutation tracker routes every straddled record change
//! through [`TreeIndex::handle_record_update`], deepest index paths first.
//!
//! The implementations here keep their entries in memory and rebuild on
//! startup; on-disk index formats are a backend concern and out of scope.

pub mod errors;
pub mod key;

mod array;
mod fulltext;
mod geo;
mod normal;

pub use array::ArrayIndex;
pub use errors::IndexError;
pub use fulltext::FulltextIndex;
pub use geo::GeoIndex;
pub use normal::NormalIndex;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::Result;
use crate::path::{Key, Path, PathBuf};
use crate::storage::StorageEngine;
use crate::value::Value;

/// The index types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Ordered single-value index.
    Normal,
    /// One entry per array element.
    Array,
    /// Word-token index over text.
    Fulltext,
    /// Latitude/longitude radius index.
    Geo,
}

impl IndexKind {
    /// The kind name used in reflection output and index descriptions.
    pub fn name(self) -> &'static str {
        match self {
            IndexKind::Normal => "normal",
            IndexKind::Array => "array",
            IndexKind::Fulltext => "fulltext",
            IndexKind::Geo => "geo",
        }
    }
}

/// Declaration of a secondary index.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    /// Collection path pattern; the indexed records are its direct children.
    pub path: PathBuf,
    /// The record property being indexed. May be a nested key (`a/b`).
    pub key: String,
    /// Additional record properties captured into the index, so queries
    /// filtering or sorting on them avoid record loads.
    pub include: Vec<String>,
    /// The index type.
    pub kind: IndexKind,
    /// Case-sensitive text handling. Off by default, matching `like`.
    pub case_sensitive: bool,
}

impl IndexSpec {
    /// Creates a normal index spec on `path`/`key`.
    pub fn new(path: PathBuf, key: impl Into<String>) -> Self {
        Self {
            path,
            key: key.into(),
            include: Vec::new(),
            kind: IndexKind::Normal,
            case_sensitive: false,
        }
    }

    /// Sets the index kind.
    pub fn with_kind(mut self, kind: IndexKind) -> Self {
        self.kind = kind;
        self
    }

    /// Adds captured record properties.
    pub fn with_include(mut self, include: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.include = include.into_iter().map(Into::into).collect();
        self
    }

    /// The pattern matching the indexed record paths: the collection path
    /// plus one wildcard key.
    pub fn record_pattern(&self) -> PathBuf {
        self.path.to_path_buf().push_any()
    }

    /// Human-readable description for logs and query hints.
    pub fn description(&self) -> String {
        format!("{} index on {}/*/{}", self.kind.name(), self.path, self.key)
    }
}

/// One record matched by an index query.
#[derive(Debug, Clone)]
pub struct IndexMatch {
    /// Path of the matched record.
    pub path: PathBuf,
    /// Captured property values: the indexed key plus the spec's included
    /// keys, as of the last record update.
    pub indexed: BTreeMap<String, Value>,
}

/// The result of an index query: matched record paths with captured
/// metadata.
#[derive(Debug, Clone, Default)]
pub struct IndexResultSet {
    /// The matches, in index order where the operator implies one.
    pub matches: Vec<IndexMatch>,
}

impl IndexResultSet {
    /// Number of matched records.
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    /// True when nothing matched.
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Intersects with another result set on record path, keeping captured
    /// metadata from both sides.
    pub fn intersect(self, other: IndexResultSet) -> IndexResultSet {
        let mut other_by_path: std::collections::HashMap<String, IndexMatch> = other
            .matches
            .into_iter()
            .map(|m| (m.path.as_str().to_string(), m))
            .collect();
        let matches = self
            .matches
            .into_iter()
            .filter_map(|mut m| {
                let theirs = other_by_path.remove(m.path.as_str())?;
                m.indexed.extend(theirs.indexed);
                Some(m)
            })
            .collect();
        IndexResultSet { matches }
    }
}

/// The contract every index implementation provides to the engine.
#[async_trait]
pub trait TreeIndex: Send + Sync {
    /// The index declaration.
    fn spec(&self) -> &IndexSpec;

    /// Populates the index from existing data. The default implementation
    /// scans the records matching the spec's collection pattern and feeds
    /// them through [`TreeIndex::handle_record_update`].
    async fn build(&self, engine: &StorageEngine) -> Result<()> {
        let records = scan_records(engine, &self.spec().path).await?;
        let count = records.len();
        for (path, value) in &records {
            self.handle_record_update(path, None, Some(value)).await?;
        }
        tracing::debug!(index = self.spec().description(), records = count, "Index built");
        Ok(())
    }

    /// Applies one record mutation. `old`/`new` are the record's value
    /// before and after; `None` means absent on that side.
    async fn handle_record_update(
        &self,
        path: &Path,
        old: Option<&Value>,
        new: Option<&Value>,
    ) -> Result<()>;

    /// Runs an indexed filter and returns the matching record paths.
    async fn query(&self, op: &str, compare: &Value) -> Result<IndexResultSet>;

    /// Returns a slice of the index in key order; used for sort-only access.
    async fn take(&self, skip: usize, take: usize, ascending: bool) -> Result<IndexResultSet>;

    /// Tests a record value against an operator without consulting the
    /// index entries; used by live-query re-evaluation.
    fn test(&self, value: Option<&Value>, op: &str, compare: &Value) -> bool;

    /// The operators this index can answer.
    fn valid_operators(&self) -> &'static [&'static str];
}

/// Creates an index implementation for a spec.
pub fn create(spec: IndexSpec) -> Arc<dyn TreeIndex> {
    match spec.kind {
        IndexKind::Normal => Arc::new(NormalIndex::new(spec)),
        IndexKind::Array => Arc::new(ArrayIndex::new(spec)),
        IndexKind::Fulltext => Arc::new(FulltextIndex::new(spec)),
        IndexKind::Geo => Arc::new(GeoIndex::new(spec)),
    }
}

/// The in-memory list of indexes of one database, with the selection rules
/// the engine and query planner need.
#[derive(Default)]
pub struct IndexManager {
    indexes: RwLock<Vec<Arc<dyn TreeIndex>>>,
}

impl IndexManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an index. Fails if an index with the same path, key and
    /// kind already exists.
    pub fn add(&self, index: Arc<dyn TreeIndex>) -> Result<()> {
        let mut indexes = self.indexes.write().expect("index list poisoned");
        let spec = index.spec();
        if indexes.iter().any(|i| {
            i.spec().path.as_str() == spec.path.as_str()
                && i.spec().key == spec.key
                && i.spec().kind == spec.kind
        }) {
            return Err(IndexError::AlreadyExists {
                index_path: spec.path.as_str().to_string(),
                key: spec.key.clone(),
            }
            .into());
        }
        indexes.push(index);
        Ok(())
    }

    /// All registered indexes.
    pub fn list(&self) -> Vec<Arc<dyn TreeIndex>> {
        self.indexes.read().expect("index list poisoned").clone()
    }

    /// Indexes whose record pattern lies on the same trail as a write at
    /// `path`, ordered deepest collection path first so nested indexes see
    /// consistent state.
    pub fn straddling(&self, path: &Path) -> Vec<Arc<dyn TreeIndex>> {
        let mut straddling: Vec<Arc<dyn TreeIndex>> = self
            .indexes
            .read()
            .expect("index list poisoned")
            .iter()
            .filter(|i| i.spec().record_pattern().is_on_trail_of(path))
            .cloned()
            .collect();
        straddling.sort_by(|a, b| b.spec().path.depth().cmp(&a.spec().path.depth()));
        straddling
    }

    /// Indexes able to answer `op` on `key` for queries on `base`.
    pub fn for_filter(&self, base: &Path, filter_key: &str, op: &str) -> Vec<Arc<dyn TreeIndex>> {
        self.indexes
            .read()
            .expect("index list poisoned")
            .iter()
            .filter(|i| {
                i.spec().key == filter_key
                    && i.spec().path.equals(base)
                    && i.valid_operators().contains(&op)
            })
            .cloned()
            .collect()
    }

    /// Normal indexes on `key` usable to satisfy a sort on `base`.
    pub fn for_sort(&self, base: &Path, sort_key: &str) -> Option<Arc<dyn TreeIndex>> {
        self.indexes
            .read()
            .expect("index list poisoned")
            .iter()
            .find(|i| {
                i.spec().kind == IndexKind::Normal
                    && i.spec().key == sort_key
                    && i.spec().path.equals(base)
            })
            .cloned()
    }
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let descriptions: Vec<String> =
            self.list().iter().map(|i| i.spec().description()).collect();
        f.debug_struct("IndexManager")
            .field("indexes", &descriptions)
            .finish()
    }
}

/// Resolves a record property by its possibly-nested key (`a/b`).
pub(crate) fn property<'a>(record: &'a Value, key: &str) -> Option<&'a Value> {
    let path = PathBuf::parse(key).ok()?;
    let keys: Vec<_> = path.keys().filter_map(|k| k.to_owned_key()).collect();
    record.descendant(&keys)
}

/// Captures the indexed key and included keys of a record.
pub(crate) fn capture(spec: &IndexSpec, record: &Value) -> BTreeMap<String, Value> {
    let mut captured = BTreeMap::new();
    if let Some(value) = property(record, &spec.key) {
        captured.insert(spec.key.clone(), value.clone());
    }
    for include in &spec.include {
        if let Some(value) = property(record, include) {
            captured.insert(include.clone(), value.clone());
        }
    }
    captured
}

/// Enumerates the record paths and values of every concrete collection
/// matching `pattern`, by walking wildcards through the existing tree.
pub(crate) async fn scan_records(
    engine: &StorageEngine,
    pattern: &Path,
) -> Result<Vec<(PathBuf, Value)>> {
    let mut collections = vec![PathBuf::root()];
    for key in pattern.keys() {
        let mut next = Vec::new();
        for collection in &collections {
            match key {
                Key::Any | Key::Var(_) => {
                    let children = engine.child_keys(collection).await?;
                    for child in children {
                        next.push(collection.to_path_buf().push_key(&child));
                    }
                }
                concrete => {
                    let owned = concrete.to_owned_key().expect("concrete key");
                    next.push(collection.to_path_buf().push_key(&owned));
                }
            }
        }
        collections = next;
    }

    let mut records = Vec::new();
    for collection in collections {
        for child in engine.child_keys(&collection).await? {
            let path = collection.to_path_buf().push_key(&child);
            if let Some(node) = engine.get_node(&path, Default::default()).await? {
                records.push((path, node.value));
            }
        }
    }
    Ok(records)
}
