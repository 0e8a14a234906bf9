//! References to nodes in the database tree.

use std::sync::Arc;

use crate::Result;
use crate::query::Query;
use crate::storage::{
    NodeAddress, ReadOptions, StorageEngine, TransactOptions, WriteOptions, time_sortable_id,
};
use crate::subscription::{DataEvent, EventStream, EventType};
use crate::value::{Value, ValueKind};
use crate::path::{Path, PathBuf};

use super::snapshot::{DataSnapshot, MutationsDataSnapshot};

/// Options for reading a node's value.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Keep only these relative paths; `*` matches one key.
    pub include: Vec<String>,
    /// Drop these relative paths.
    pub exclude: Vec<String>,
    /// `Some(false)` prunes composite children.
    pub child_objects: Option<bool>,
}

impl GetOptions {
    fn into_read_options(self) -> Result<ReadOptions> {
        let parse = |paths: Vec<String>| -> Result<Vec<PathBuf>> {
            paths
                .into_iter()
                .map(|p| PathBuf::parse(p).map_err(Into::into))
                .collect()
        };
        Ok(ReadOptions {
            include: parse(self.include)?,
            exclude: parse(self.exclude)?,
            child_objects: self.child_objects,
            tid: None,
        })
    }
}

/// Node metadata returned by [`DataReference::reflect_info`].
#[derive(Debug, Clone)]
pub struct ReflectInfo {
    /// The node's path.
    pub path: PathBuf,
    /// Whether the node exists.
    pub exists: bool,
    /// The node's value kind.
    pub kind: Option<ValueKind>,
    /// Whether the node lives inline or in a dedicated record.
    pub address: NodeAddress,
    /// Revision id of the owning record.
    pub revision: Option<String>,
    /// Write counter of the owning record.
    pub revision_nr: Option<u64>,
    /// Creation timestamp of the owning record.
    pub created: Option<i64>,
    /// Modification timestamp of the owning record.
    pub modified: Option<i64>,
}

/// One child entry returned by [`DataReference::reflect_children`].
#[derive(Debug, Clone)]
pub struct ReflectChildEntry {
    /// The child key, in canonical text form.
    pub key: String,
    /// The child's value kind.
    pub kind: Option<ValueKind>,
    /// Whether the child lives inline or in a dedicated record.
    pub address: NodeAddress,
}

/// Children listing returned by [`DataReference::reflect_children`].
#[derive(Debug, Clone, Default)]
pub struct ReflectChildren {
    /// The listed children.
    pub list: Vec<ReflectChildEntry>,
    /// True when the listing was cut short by the limit.
    pub more: bool,
}

/// A reference to a node in the tree, composing a path and an optional
/// write context.
///
/// References are cheap to clone and do not touch storage until one of
/// their operations runs. References with wildcard paths can only be used
/// through [`DataReference::query`] and event subscriptions; direct reads
/// and writes fail.
#[derive(Clone)]
pub struct DataReference {
    engine: Arc<StorageEngine>,
    path: PathBuf,
    context: Option<serde_json::Value>,
}

impl DataReference {
    pub(crate) fn new(engine: Arc<StorageEngine>, path: PathBuf) -> Self {
        Self {
            engine,
            path,
            context: None,
        }
    }

    /// The path this reference addresses.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last key of the path, or `None` for the root.
    pub fn key(&self) -> Option<String> {
        self.path.key().map(|k| k.to_string())
    }

    /// A reference to the parent node, or `None` at the root.
    pub fn parent(&self) -> Option<DataReference> {
        self.path.parent().map(|parent| DataReference {
            engine: Arc::clone(&self.engine),
            path: parent.to_path_buf(),
            context: self.context.clone(),
        })
    }

    /// A reference to a descendant, addressed by a relative path
    /// (`"name"`, `"a/b"`, `"[3]/title"`).
    pub fn child(&self, relative: impl AsRef<str>) -> Result<DataReference> {
        let relative = relative.as_ref();
        let combined = if relative.starts_with('[') {
            format!("{}{}", self.path.as_str(), relative)
        } else if self.path.is_root() {
            relative.to_string()
        } else {
            format!("{}/{}", self.path.as_str(), relative)
        };
        Ok(DataReference {
            engine: Arc::clone(&self.engine),
            path: PathBuf::parse(combined)?,
            context: self.context.clone(),
        })
    }

    /// Attaches an opaque context that every event caused by writes through
    /// this reference will carry. With `merge`, object contexts are merged
    /// key-wise into any previously set context.
    pub fn with_context(mut self, context: serde_json::Value, merge: bool) -> Self {
        self.context = Some(match (self.context.take(), merge) {
            (Some(serde_json::Value::Object(mut existing)), true) => {
                if let serde_json::Value::Object(additions) = context {
                    existing.extend(additions);
                    serde_json::Value::Object(existing)
                } else {
                    context
                }
            }
            _ => context,
        });
        self
    }

    /// The context currently attached to this reference.
    pub fn context(&self) -> Option<&serde_json::Value> {
        self.context.as_ref()
    }

    /// True when the path contains wildcards.
    pub fn is_wildcard_path(&self) -> bool {
        self.path.has_wildcards()
    }

    fn write_options(&self) -> WriteOptions {
        WriteOptions {
            context: self.context.clone(),
            ..Default::default()
        }
    }

    // === Writes ===

    /// Replaces this node's value. Null removes the node.
    pub async fn set(&self, value: impl Into<Value>) -> Result<()> {
        self.engine
            .set_node(&self.path, value.into(), self.write_options())
            .await
    }

    /// Merges properties into this node: listed properties are replaced
    /// wholly, null properties removed, others untouched.
    pub async fn update(&self, updates: impl Into<Value>) -> Result<()> {
        self.engine
            .update_node(&self.path, updates.into(), self.write_options())
            .await
    }

    /// Removes this node.
    pub async fn remove(&self) -> Result<()> {
        self.set(Value::Null).await
    }

    /// Generates a time-sortable child key, writes `value` there, and
    /// returns a reference to the new child.
    pub async fn push(&self, value: impl Into<Value>) -> Result<DataReference> {
        let child = self.push_ref()?;
        child.set(value).await?;
        Ok(child)
    }

    /// Generates a time-sortable child key without writing anything.
    pub fn push_ref(&self) -> Result<DataReference> {
        self.child(time_sortable_id())
    }

    /// Runs a transaction on this node: the callback receives the current
    /// value and returns the new one. Returning `None` cancels the
    /// transaction; returning null deletes the node. A write lock is held
    /// across the callback; the transaction retries once when a concurrent
    /// write interferes.
    pub async fn transaction(
        &self,
        callback: impl FnMut(Option<Value>) -> Option<Value> + Send,
    ) -> Result<DataReference> {
        self.transaction_with(callback, TransactOptions::default())
            .await
    }

    /// Runs a transaction with explicit options, including the lockless
    /// mode where a temporary `notify_value` subscription stands in for the
    /// write lock and the transaction restarts if it fires.
    pub async fn transaction_with(
        &self,
        callback: impl FnMut(Option<Value>) -> Option<Value> + Send,
        mut options: TransactOptions,
    ) -> Result<DataReference> {
        if options.context.is_none() {
            options.context = self.context.clone();
        }
        self.engine
            .transact_node(&self.path, callback, options)
            .await?;
        Ok(self.clone())
    }

    // === Reads ===

    /// Reads this node's value.
    pub async fn get(&self, options: GetOptions) -> Result<DataSnapshot> {
        let node = self
            .engine
            .get_node(&self.path, options.into_read_options()?)
            .await?;
        Ok(DataSnapshot::new(
            self.clone(),
            node.map(|nv| nv.value),
            None,
            None,
        ))
    }

    /// True when a node exists at this path.
    pub async fn exists(&self) -> Result<bool> {
        Ok(self.engine.get_node_info(&self.path).await?.exists)
    }

    /// Number of direct children.
    pub async fn count(&self) -> Result<usize> {
        let mut count = 0usize;
        let result = self
            .engine
            .get_children(&self.path, None, &mut |_| {
                count += 1;
                true
            })
            .await;
        match result {
            Ok(()) => Ok(count),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Existence and placement metadata for this node.
    pub async fn reflect_info(&self) -> Result<ReflectInfo> {
        let info = self.engine.get_node_info(&self.path).await?;
        Ok(ReflectInfo {
            path: info.path,
            exists: info.exists,
            kind: info.kind,
            address: info.address,
            revision: info.revision,
            revision_nr: info.revision_nr,
            created: info.created,
            modified: info.modified,
        })
    }

    /// Lists direct children with their kinds and placement, without
    /// loading values.
    pub async fn reflect_children(&self, skip: usize, limit: usize) -> Result<ReflectChildren> {
        let mut children = ReflectChildren::default();
        let mut seen = 0usize;
        let result = self
            .engine
            .get_children(&self.path, None, &mut |info| {
                seen += 1;
                if seen <= skip {
                    return true;
                }
                if limit > 0 && children.list.len() >= limit {
                    children.more = true;
                    return false;
                }
                children.list.push(ReflectChildEntry {
                    key: info
                        .path
                        .key()
                        .map(|k| k.to_string())
                        .unwrap_or_default(),
                    kind: info.kind,
                    address: info.address,
                });
                true
            })
            .await;
        match result {
            Ok(()) => Ok(children),
            Err(e) if e.is_not_found() => Ok(children),
            Err(e) => Err(e),
        }
    }

    // === Events ===

    /// Subscribes to events of `event_type` on this path. The returned
    /// stream yields raw [`DataEvent`]s; wrap them with
    /// [`DataReference::snapshot_of`] for the snapshot surface.
    pub fn on(&self, event_type: EventType) -> EventStream<DataEvent> {
        self.engine.subscriptions().subscribe(&self.path, event_type)
    }

    /// Waits for a single event of `event_type` and returns its snapshot.
    pub async fn once(&self, event_type: EventType) -> Result<Option<DataSnapshot>> {
        let mut stream = self.on(event_type);
        let event = stream.next().await;
        stream.stop();
        Ok(event.map(|e| self.snapshot_of(e)))
    }

    /// Removes all subscriptions of `event_type` on this exact path, or
    /// every subscription on it with `None`.
    pub fn off(&self, event_type: Option<EventType>) {
        self.engine
            .subscriptions()
            .unsubscribe_all(&self.path, event_type);
    }

    /// Builds the value snapshot of a delivered event. The snapshot's
    /// reference addresses the event's concrete path.
    pub fn snapshot_of(&self, event: DataEvent) -> DataSnapshot {
        let reference = DataReference {
            engine: Arc::clone(&self.engine),
            path: event.path.clone(),
            context: self.context.clone(),
        };
        DataSnapshot::from_event(reference, event)
    }

    /// Builds the mutations snapshot of a delivered `mutations` event.
    pub fn mutations_snapshot_of(&self, event: DataEvent) -> MutationsDataSnapshot {
        let reference = DataReference {
            engine: Arc::clone(&self.engine),
            path: event.path.clone(),
            context: self.context.clone(),
        };
        MutationsDataSnapshot::from_event(reference, event)
    }

    // === Queries ===

    /// Starts a query on the children of this path.
    pub fn query(&self) -> Query {
        Query::new(Arc::clone(&self.engine), self.path.clone())
    }

}

impl Query {
    /// Executes the query and returns references to the matching records
    /// instead of snapshots.
    pub async fn get_refs(self) -> Result<Vec<DataReference>> {
        let engine = Arc::clone(self.engine_handle());
        let results = self.get(crate::query::QueryOptions::default()).await?;
        Ok(results
            .rows
            .into_iter()
            .map(|row| DataReference::new(Arc::clone(&engine), row.path))
            .collect())
    }
}

impl std::fmt::Debug for DataReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReference")
            .field("path", &self.path.as_str())
            .field("context", &self.context)
            .finish()
    }
}
