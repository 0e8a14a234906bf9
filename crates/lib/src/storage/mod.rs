//! The storage engine core.
//!
//! This module implements path reads and writes on top of the backend
//! protocol, orchestrating the value codec, the lock manager, the
//! subscription registry and the index coordinator.
//!
//! # Record placement
//!
//! Every existing node is either an *inline child* inside its parent's
//! record (scalars small enough, and empty composites) or a *dedicated
//! record* of its own, never both. Writes move nodes between the two forms
//! when they cross the configured inline size threshold; reads assemble a
//! subtree from the target record's inline children plus a streamed
//! enumeration of its dedicated descendants.
//!
//! # Write pipeline
//!
//! A write resolves its *top event path* (the shallowest ancestor whose
//! pre-image a subscriber or straddled index needs), takes a write lock
//! there, loads the pre-image (restricted to the keys actually needed when
//! possible), stages all record changes in one backend transaction, commits,
//! and finally hands the old and new images to the mutation tracker for
//! index updates and event fan-out. When nothing needs previous values, the
//! pre-image read is skipped entirely.

pub mod errors;

pub use errors::StorageError;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::Result;
use crate::backend::{
    BackendTransaction, IncludeSpec, RecordValue, StorageBackend, StoredRecord, TransactionTarget,
};
use crate::config::DatabaseConfig;
use crate::events::{
    ChildOp, ChildOpKind, EventDispatcher, MutationRecord, NodeEffect, process_mutation,
};
use crate::index::{IndexManager, IndexSpec};
use crate::lock::{LockManager, LockOptions, TransactionId};
use crate::path::{Key, OwnedKey, Path, PathBuf};
use crate::subscription::{EventType, SubscriptionRegistry};
use crate::value::{Value, ValueKind, merge_into, sanitize_payload};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generates a time-sortable unique id, used for revisions and pushed child
/// keys.
pub fn time_sortable_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// A node's value together with its record metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeValue {
    /// The materialized value.
    pub value: Value,
    /// Revision id of the last write.
    pub revision: String,
    /// Per-record write counter.
    pub revision_nr: u64,
    /// Creation timestamp, epoch milliseconds.
    pub created: i64,
    /// Last-modification timestamp, epoch milliseconds.
    pub modified: i64,
}

/// Where a node lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAddress {
    /// The node does not exist.
    Absent,
    /// The node is stored inside its parent's record.
    Inline,
    /// The node has a record of its own.
    Dedicated,
}

/// Metadata about a node without its full value.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// The node's path.
    pub path: PathBuf,
    /// The node's value kind; `None` when absent.
    pub kind: Option<ValueKind>,
    /// Whether the node exists.
    pub exists: bool,
    /// Where the node is stored.
    pub address: NodeAddress,
    /// The value, for inline nodes.
    pub value: Option<Value>,
    /// Revision id, for dedicated records.
    pub revision: Option<String>,
    /// Write counter, for dedicated records.
    pub revision_nr: Option<u64>,
    /// Creation timestamp, for dedicated records.
    pub created: Option<i64>,
    /// Modification timestamp, for dedicated records.
    pub modified: Option<i64>,
}

impl NodeInfo {
    fn absent(path: PathBuf) -> Self {
        Self {
            path,
            kind: None,
            exists: false,
            address: NodeAddress::Absent,
            value: None,
            revision: None,
            revision_nr: None,
            created: None,
            modified: None,
        }
    }
}

/// Options for node reads.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Keep only these relative paths (and what is needed to reach them).
    /// `*` matches one key.
    pub include: Vec<PathBuf>,
    /// Drop these relative paths and everything below them.
    pub exclude: Vec<PathBuf>,
    /// `Some(false)` prunes composite children of the target.
    pub child_objects: Option<bool>,
    /// Reuse the lock context of an enclosing operation.
    pub tid: Option<TransactionId>,
}

/// Options for node writes.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Reuse the lock context of an enclosing operation.
    pub tid: Option<TransactionId>,
    /// Skip subscriber event dispatch (index updates still run).
    pub suppress_events: bool,
    /// Opaque context attached to every event this write causes.
    pub context: Option<serde_json::Value>,
    /// Fail with a revision mismatch unless the node still carries this
    /// revision.
    pub assert_revision: Option<String>,
}

/// Options for transactional updates.
#[derive(Debug, Clone, Default)]
pub struct TransactOptions {
    /// Run the callback without holding a write lock. A temporary
    /// `notify_value` subscription watches the node instead; if it fires
    /// while the callback runs, the transaction restarts.
    pub no_lock: bool,
    /// Skip subscriber event dispatch (index updates still run).
    pub suppress_events: bool,
    /// Opaque context attached to every event the final write causes.
    pub context: Option<serde_json::Value>,
}

/// The change a write applies at its target path.
#[derive(Debug, Clone)]
enum NodeChange {
    /// Replace the node wholly.
    Replace(Value),
    /// Merge properties into the node; null values delete.
    Merge(BTreeMap<String, Value>),
    /// Remove the node.
    Delete,
}

/// The path-oriented storage engine of one database.
pub struct StorageEngine {
    backend: Arc<dyn StorageBackend>,
    config: DatabaseConfig,
    locks: LockManager,
    subscriptions: SubscriptionRegistry,
    indexes: Arc<IndexManager>,
    dispatcher: EventDispatcher,
}

impl StorageEngine {
    /// Opens the engine over a backend, creating the root record if this is
    /// a fresh store.
    pub async fn new(backend: Arc<dyn StorageBackend>, config: DatabaseConfig) -> Result<Arc<Self>> {
        let locks = LockManager::new(config.effective_lock_timeout());
        let subscriptions = SubscriptionRegistry::new(config.event_queue_capacity);
        let dispatcher = EventDispatcher::start(subscriptions.clone());
        let engine = Arc::new(Self {
            backend,
            config,
            locks,
            subscriptions,
            indexes: Arc::new(IndexManager::new()),
            dispatcher,
        });
        engine.init_root().await?;
        Ok(engine)
    }

    async fn init_root(&self) -> Result<()> {
        let mut tx = self
            .backend
            .transaction(TransactionTarget::write(PathBuf::root()))
            .await?;
        if tx.get(&PathBuf::root()).await?.is_none() {
            let record = StoredRecord::composite(
                ValueKind::Object,
                BTreeMap::new(),
                time_sortable_id(),
                now_ms(),
            );
            tx.set(&PathBuf::root(), record).await?;
            tracing::debug!(backend = self.backend.name(), "Initialized root record");
        }
        tx.commit().await
    }

    /// The engine configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The subscription registry of this database.
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// The index coordinator of this database.
    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Creates and builds a secondary index, then registers it for
    /// incremental maintenance.
    pub async fn create_index(&self, spec: IndexSpec) -> Result<()> {
        let index = crate::index::create(spec);
        tracing::info!(index = index.spec().description(), "Building index");
        index.build(self).await?;
        self.indexes.add(index)
    }

    // === Reads ===

    /// Reads the node at `path`, assembling its subtree.
    ///
    /// Returns `None` when no node exists at the path.
    pub async fn get_node(&self, path: &Path, options: ReadOptions) -> Result<Option<NodeValue>> {
        ensure_concrete(path)?;
        let tid = options.tid.unwrap_or_else(Uuid::new_v4);
        let lock = self
            .locks
            .lock(path, tid, false, format!("read '{path}'"), LockOptions::default())
            .await?;
        let filter = PathFilter {
            include: options.include,
            exclude: options.exclude,
            child_objects: options.child_objects,
            top_keys: None,
        };
        let mut tx = self
            .backend
            .transaction(TransactionTarget::read(path))
            .await?;
        let result = self.read_tree(&mut tx, path, &filter).await;
        lock.release()?;
        result
    }

    /// Reads existence and placement metadata for the node at `path`.
    pub async fn get_node_info(&self, path: &Path) -> Result<NodeInfo> {
        ensure_concrete(path)?;
        let tid = Uuid::new_v4();
        let lock = self
            .locks
            .lock(path, tid, false, format!("info '{path}'"), LockOptions::default())
            .await?;
        let mut tx = self
            .backend
            .transaction(TransactionTarget::read(path))
            .await?;
        let result = self.node_info(&mut tx, path).await;
        lock.release()?;
        result
    }

    async fn node_info(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        path: &Path,
    ) -> Result<NodeInfo> {
        if let Some(record) = tx.get(path).await? {
            return Ok(NodeInfo {
                path: path.to_path_buf(),
                kind: Some(record.kind),
                exists: true,
                address: NodeAddress::Dedicated,
                value: None,
                revision: Some(record.revision.clone()),
                revision_nr: Some(record.revision_nr),
                created: Some(record.created),
                modified: Some(record.modified),
            });
        }
        let Some(parent) = path.parent() else {
            return Ok(NodeInfo::absent(path.to_path_buf()));
        };
        let key = key_string(path.key().expect("non-root path"));
        if let Some(parent_record) = tx.get(parent).await? {
            if let Some(inline) = parent_record
                .inline_children()
                .and_then(|children| children.get(&key))
            {
                return Ok(NodeInfo {
                    path: path.to_path_buf(),
                    kind: inline.kind(),
                    exists: true,
                    address: NodeAddress::Inline,
                    value: Some(inline.clone()),
                    revision: Some(parent_record.revision.clone()),
                    revision_nr: Some(parent_record.revision_nr),
                    created: Some(parent_record.created),
                    modified: Some(parent_record.modified),
                });
            }
        }
        Ok(NodeInfo::absent(path.to_path_buf()))
    }

    /// Streams the direct children of the node at `path` as [`NodeInfo`]
    /// entries: inline children first, then dedicated ones. The callback
    /// returns false to stop the enumeration.
    pub async fn get_children(
        &self,
        path: &Path,
        key_filter: Option<&[String]>,
        cb: &mut (dyn FnMut(NodeInfo) -> bool + Send),
    ) -> Result<()> {
        ensure_concrete(path)?;
        let tid = Uuid::new_v4();
        let lock = self
            .locks
            .lock(path, tid, false, format!("children '{path}'"), LockOptions::default())
            .await?;
        let mut tx = self
            .backend
            .transaction(TransactionTarget::read(path))
            .await?;
        let result = self.children_into(&mut tx, path, key_filter, cb).await;
        lock.release()?;
        result
    }

    async fn children_into(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        path: &Path,
        key_filter: Option<&[String]>,
        cb: &mut (dyn FnMut(NodeInfo) -> bool + Send),
    ) -> Result<()> {
        let Some(record) = tx.get(path).await? else {
            // An inline node has no children of its own.
            let info = self.node_info(tx, path).await?;
            if info.exists {
                return Ok(());
            }
            return Err(StorageError::NotFound {
                path: path.to_path_buf(),
            }
            .into());
        };
        let Some(children) = record.inline_children() else {
            return Ok(());
        };
        let passes = |key: &str| key_filter.map_or(true, |filter| filter.iter().any(|k| k == key));
        for (key, value) in children {
            if !passes(key) {
                continue;
            }
            let child_path = child_path_of(path, record.kind, key);
            let info = NodeInfo {
                path: child_path,
                kind: value.kind(),
                exists: true,
                address: NodeAddress::Inline,
                value: Some(value.clone()),
                revision: None,
                revision_nr: None,
                created: None,
                modified: None,
            };
            if !cb(info) {
                return Ok(());
            }
        }
        let mut result = Ok(());
        tx.children_of(
            path,
            IncludeSpec {
                metadata: true,
                value: false,
            },
            &mut |child| {
                child
                    .key()
                    .map(|k| passes(&key_string(k)))
                    .unwrap_or(false)
            },
            &mut |child, record| {
                let info = match record {
                    Some(record) => NodeInfo {
                        path: child.to_path_buf(),
                        kind: Some(record.kind),
                        exists: true,
                        address: NodeAddress::Dedicated,
                        value: None,
                        revision: Some(record.revision.clone()),
                        revision_nr: Some(record.revision_nr),
                        created: Some(record.created),
                        modified: Some(record.modified),
                    },
                    None => NodeInfo::absent(child.to_path_buf()),
                };
                cb(info)
            },
        )
        .await
        .unwrap_or_else(|e| result = Err(e));
        result
    }

    /// The concrete child keys of the node at `path`; empty when the node
    /// does not exist or is a leaf.
    pub async fn child_keys(&self, path: &Path) -> Result<Vec<OwnedKey>> {
        let mut keys = Vec::new();
        let result = self
            .get_children(path, None, &mut |info| {
                if let Some(key) = info.path.key().and_then(|k| k.to_owned_key()) {
                    keys.push(key);
                }
                true
            })
            .await;
        match result {
            Ok(()) => Ok(keys),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    // === Writes ===

    /// Replaces the node at `path` with `value`. A null value removes the
    /// node.
    pub async fn set_node(&self, path: &Path, value: Value, options: WriteOptions) -> Result<()> {
        self.write_node(path, value, false, options).await
    }

    /// Merges `updates` into the node at `path`: listed properties are
    /// replaced wholly, null properties are removed, everything else is
    /// untouched.
    pub async fn update_node(
        &self,
        path: &Path,
        updates: Value,
        options: WriteOptions,
    ) -> Result<()> {
        match updates {
            Value::Object(_) => self.write_node(path, updates, true, options).await,
            other => Err(StorageError::NotAllowed {
                path: path.to_path_buf(),
                reason: format!("update requires an object payload, got {}", other.type_name()),
            }
            .into()),
        }
    }

    /// Removes the node at `path`.
    pub async fn remove_node(&self, path: &Path, options: WriteOptions) -> Result<()> {
        self.write_node(path, Value::Null, false, options).await
    }

    /// Reads the node at `path`, lets `callback` compute a new value, and
    /// writes it back. Returning `None` cancels; returning null deletes.
    ///
    /// By default a write lock is held across the callback. With
    /// [`TransactOptions::no_lock`] a temporary `notify_value` subscription
    /// watches the node instead, and the transaction restarts when it
    /// fires. Either way a concurrent write detected at commit time causes
    /// one retry.
    pub async fn transact_node(
        &self,
        path: &Path,
        mut callback: impl FnMut(Option<Value>) -> Option<Value> + Send,
        options: TransactOptions,
    ) -> Result<()> {
        ensure_concrete(path)?;
        for attempt in 0..2 {
            let result = if options.no_lock {
                self.transact_without_lock(path, &mut callback, &options).await
            } else {
                self.transact_locked(path, &mut callback, &options).await
            };
            match result {
                Err(e) if e.is_revision_mismatch() && attempt == 0 => {
                    tracing::debug!(path = %path, "Transaction restart after concurrent update");
                    continue;
                }
                result => return result,
            }
        }
        unreachable!("transaction retries are bounded")
    }

    /// One transaction attempt with a write lock held across the callback.
    async fn transact_locked(
        &self,
        path: &Path,
        callback: &mut (dyn FnMut(Option<Value>) -> Option<Value> + Send),
        options: &TransactOptions,
    ) -> Result<()> {
        let tid = Uuid::new_v4();
        let lock = self
            .locks
            .lock(path, tid, true, format!("transaction '{path}'"), LockOptions::default())
            .await?;
        let current = self
            .get_node(
                path,
                ReadOptions {
                    tid: Some(tid),
                    ..Default::default()
                },
            )
            .await;
        let result = match current {
            Err(e) => Err(e),
            Ok(current) => {
                let revision = current.as_ref().map(|nv| nv.revision.clone());
                match callback(current.map(|nv| nv.value)) {
                    None => Ok(()), // canceled
                    Some(new_value) => {
                        let write_options = WriteOptions {
                            tid: Some(tid),
                            suppress_events: options.suppress_events,
                            context: options.context.clone(),
                            assert_revision: revision,
                        };
                        self.write_node(path, new_value, false, write_options).await
                    }
                }
            }
        };
        lock.release()?;
        result
    }

    /// One lockless transaction attempt: a temporary `notify_value`
    /// subscription stands in for the lock. If it fired by the time the
    /// callback returns, the attempt fails with a revision mismatch so the
    /// transaction restarts; the final write still asserts the revision it
    /// read.
    async fn transact_without_lock(
        &self,
        path: &Path,
        callback: &mut (dyn FnMut(Option<Value>) -> Option<Value> + Send),
        options: &TransactOptions,
    ) -> Result<()> {
        let mut watch = self.subscriptions.subscribe(path, EventType::NotifyValue);
        let current = self.get_node(path, ReadOptions::default()).await?;
        let revision = current.as_ref().map(|nv| nv.revision.clone());
        let Some(new_value) = callback(current.map(|nv| nv.value)) else {
            return Ok(()); // canceled
        };
        if watch.try_next().is_some() {
            return Err(StorageError::RevisionMismatch {
                path: path.to_path_buf(),
                expected: revision.unwrap_or_else(|| "(absent)".to_string()),
                found: "(concurrent update)".to_string(),
            }
            .into());
        }
        self.write_node(
            path,
            new_value,
            false,
            WriteOptions {
                tid: None,
                suppress_events: options.suppress_events,
                context: options.context.clone(),
                assert_revision: revision,
            },
        )
        .await
    }

    async fn write_node(
        &self,
        path: &Path,
        value: Value,
        merge: bool,
        options: WriteOptions,
    ) -> Result<()> {
        ensure_concrete(path)?;
        if path.is_root() {
            match (&value, merge) {
                (Value::Object(_), _) => {}
                (other, false) => {
                    return Err(StorageError::NotAllowed {
                        path: path.to_path_buf(),
                        reason: format!("the root must be an object, got {}", other.type_name()),
                    }
                    .into());
                }
                _ => unreachable!("update_node validates object payloads"),
            }
        }

        let change = match value {
            Value::Null => NodeChange::Delete,
            value if merge => {
                let Value::Object(updates) = value else {
                    unreachable!("update_node validates object payloads");
                };
                // Null update values mean deletion; everything else is
                // sanitized like a set payload.
                let mut sanitized = BTreeMap::new();
                for (key, child) in updates {
                    if child.is_null() {
                        sanitized.insert(key, Value::Null);
                    } else {
                        sanitized.insert(
                            key,
                            sanitize_payload(child, self.config.remove_void_properties)?,
                        );
                    }
                }
                NodeChange::Merge(sanitized)
            }
            value => NodeChange::Replace(sanitize_payload(
                value,
                self.config.remove_void_properties,
            )?),
        };

        let tid = options.tid.unwrap_or_else(Uuid::new_v4);
        let revision = time_sortable_id();

        // Plan: who needs previous values, and how shallow must they go.
        let value_subscribers = self.subscriptions.value_subscribers_for(path);
        let straddling = self.indexes.straddling(path);
        let needs_preimage = !value_subscribers.is_empty() || !straddling.is_empty();
        let mut top_depth = path.depth();
        for sub in &value_subscribers {
            if sub.data_path.depth() <= path.depth() {
                top_depth = top_depth.min(sub.data_path.depth());
            }
        }
        for index in &straddling {
            let record_depth = index.spec().record_pattern().depth();
            if record_depth <= path.depth() {
                top_depth = top_depth.min(record_depth);
            }
        }
        let top_path = truncate_path(path, top_depth);
        let keys_filter: Option<Vec<String>> = match &change {
            NodeChange::Merge(updates)
                if top_depth == path.depth()
                    && straddling.is_empty()
                    && value_subscribers
                        .iter()
                        .all(|s| s.data_path.depth() > path.depth()) =>
            {
                Some(updates.keys().cloned().collect())
            }
            _ => None,
        };

        let lock = self
            .locks
            .lock(&top_path, tid, true, format!("write '{path}'"), LockOptions::default())
            .await?;
        let mut tx = self
            .backend
            .transaction(TransactionTarget::write(&top_path))
            .await?;

        let staged = self
            .stage_write(
                &mut tx,
                path,
                &change,
                &revision,
                &options,
                needs_preimage,
                &top_path,
                keys_filter,
            )
            .await;

        match staged {
            Ok((previous, effect)) => {
                if let Err(e) = lock.check() {
                    tx.rollback("lock expired").await.ok();
                    return Err(e.into());
                }
                tx.commit().await?;

                let new_image = if needs_preimage {
                    let rel = keys_below(&top_path, path);
                    let mut image = previous.clone();
                    match &change {
                        NodeChange::Delete => crate::value::graft(&mut image, &rel, None),
                        NodeChange::Replace(v) => {
                            crate::value::graft(&mut image, &rel, Some(v.clone()));
                        }
                        NodeChange::Merge(updates) => {
                            let mut node = image
                                .as_ref()
                                .and_then(|v| v.descendant(&rel))
                                .cloned()
                                .unwrap_or_else(|| Value::Object(BTreeMap::new()));
                            merge_into(&mut node, updates.clone());
                            crate::value::graft(&mut image, &rel, Some(node));
                        }
                    }
                    image
                } else {
                    None
                };

                let record = MutationRecord {
                    path: path.to_path_buf(),
                    top_path,
                    preimage_loaded: needs_preimage,
                    previous,
                    value: new_image,
                    effect,
                    revision,
                    context: options.context,
                    suppress_events: options.suppress_events,
                };
                // Index updates run before the lock is released so they
                // observe mutations in commit order; event delivery itself
                // happens on the dispatcher task.
                let processed = process_mutation(
                    &self.subscriptions,
                    &self.indexes,
                    &self.dispatcher,
                    record,
                    self.config.wait_for_index_updates,
                )
                .await;
                lock.release()?;
                processed
            }
            Err(e) => {
                tx.rollback(&e.to_string()).await.ok();
                lock.release().ok();
                Err(e)
            }
        }
    }

    /// Stages all record changes of one write inside the open transaction.
    /// Returns the pre-image at the top event path (when requested) and the
    /// record-level effect summary.
    #[allow(clippy::too_many_arguments)]
    async fn stage_write(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        path: &Path,
        change: &NodeChange,
        revision: &str,
        options: &WriteOptions,
        needs_preimage: bool,
        top_path: &Path,
        keys_filter: Option<Vec<String>>,
    ) -> Result<(Option<Value>, NodeEffect)> {
        if let Some(expected) = &options.assert_revision {
            let found = self.current_revision(tx, path).await?;
            match found {
                Some(found) if &found == expected => {}
                found => {
                    return Err(StorageError::RevisionMismatch {
                        path: path.to_path_buf(),
                        expected: expected.clone(),
                        found: found.unwrap_or_else(|| "(absent)".to_string()),
                    }
                    .into());
                }
            }
        }

        let previous = if needs_preimage {
            let filter = PathFilter {
                include: Vec::new(),
                exclude: Vec::new(),
                child_objects: None,
                top_keys: keys_filter,
            };
            self.read_tree(tx, top_path, &filter)
                .await?
                .map(|nv| nv.value)
        } else {
            None
        };

        let now = now_ms();
        let mut effect = NodeEffect::default();
        if path.is_root() {
            let record = tx.get(path).await?;
            effect.existed_before = true;
            effect.exists_now = true;
            match change {
                NodeChange::Replace(value) => {
                    self.write_dedicated(tx, path, value, record, revision, now, Some(&mut effect))
                        .await?;
                }
                NodeChange::Merge(updates) => {
                    let record = record.expect("root record exists");
                    self.merge_dedicated(
                        tx,
                        path,
                        record,
                        updates.clone(),
                        revision,
                        now,
                        Some(&mut effect),
                    )
                    .await?;
                }
                NodeChange::Delete => unreachable!("root deletion rejected earlier"),
            }
        } else {
            if matches!(change, NodeChange::Delete) {
                // Deleting below a missing or leaf branch is a no-op; it
                // must not materialize ancestors.
                let parent = path.parent().expect("non-root path");
                match tx.get(parent).await? {
                    Some(record) if record.is_composite() => {}
                    _ => return Ok((previous, effect)),
                }
            } else {
                self.ensure_ancestors(tx, path, revision, now, &mut effect)
                    .await?;
            }
            let parent = path.parent().expect("non-root path").to_path_buf();
            let key = path.key().expect("non-root path").to_owned_key().expect("concrete");
            self.apply_child(tx, &parent, &key, change, revision, now, Some(&mut effect))
                .await?;
        }
        Ok((previous, effect))
    }

    /// The revision currently stored for `path`: its own record's, or its
    /// parent's for inline nodes.
    async fn current_revision(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        path: &Path,
    ) -> Result<Option<String>> {
        if let Some(record) = tx.get(path).await? {
            return Ok(Some(record.revision));
        }
        let Some(parent) = path.parent() else {
            return Ok(None);
        };
        let key = key_string(path.key().expect("non-root path"));
        Ok(tx.get(parent).await?.and_then(|record| {
            record
                .inline_children()
                .is_some_and(|children| children.contains_key(&key))
                .then_some(record.revision)
        }))
    }

    /// Ensures every ancestor of `path` exists as a dedicated composite
    /// record, promoting inline entries and overwriting scalar ancestors
    /// with fresh objects.
    async fn ensure_ancestors(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        path: &Path,
        revision: &str,
        now: i64,
        effect: &mut NodeEffect,
    ) -> Result<()> {
        let keys: Vec<OwnedKey> = path
            .keys()
            .filter_map(|k| k.to_owned_key())
            .collect();
        let mut ancestor = PathBuf::root();
        // All keys but the last: the target itself is handled by the caller.
        for key in &keys[..keys.len() - 1] {
            let parent = ancestor.clone();
            ancestor = ancestor.push_key(key);
            if let Some(record) = tx.get(&ancestor).await? {
                if record.is_composite() {
                    continue;
                }
                // A scalar ancestor is overwritten by an object holding the
                // new branch.
                let replacement = bump(
                    StoredRecord::composite(ValueKind::Object, BTreeMap::new(), revision, now),
                    Some(&record),
                    revision,
                    now,
                );
                tx.set(&ancestor, replacement).await?;
                continue;
            }
            let parent_record = tx.get(&parent).await?.expect("ancestor chain exists");
            self.check_array_insert(tx, &parent, &parent_record, key).await?;
            let key_str = key_string(key.as_key());
            let mut kind = ValueKind::Object;
            if let Some(children) = parent_record.inline_children() {
                if let Some(inline) = children.get(&key_str) {
                    if matches!(inline, Value::Array(_)) {
                        kind = ValueKind::Array;
                    }
                    // Promote: the inline entry leaves the parent record.
                    let mut updated = parent_record.clone();
                    if let RecordValue::Children(children) = &mut updated.value {
                        children.remove(&key_str);
                    }
                    let updated = bump(updated, Some(&parent_record), revision, now);
                    tx.set(&parent, updated).await?;
                }
            }
            let record = StoredRecord::composite(kind, BTreeMap::new(), revision, now);
            tx.set(&ancestor, record).await?;
            effect.created_ancestors.push(ancestor.clone());
        }
        Ok(())
    }

    /// Applies a change to one direct child of a composite parent record.
    #[allow(clippy::too_many_arguments)]
    async fn apply_child(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        parent_path: &Path,
        key: &OwnedKey,
        change: &NodeChange,
        revision: &str,
        now: i64,
        mut effect: Option<&mut NodeEffect>,
    ) -> Result<()> {
        let parent_record = tx.get(parent_path).await?.expect("parent record ensured");
        let key_str = key_string(key.as_key());
        let child_path = parent_path.to_path_buf().push_key(key);
        let existing_inline = parent_record
            .inline_children()
            .and_then(|children| children.get(&key_str))
            .cloned();
        let existing_dedicated = tx.get(&child_path).await?;
        let existed = existing_inline.is_some() || existing_dedicated.is_some();

        if let Some(effect) = effect.as_deref_mut() {
            effect.existed_before = existed;
            effect.exists_now = !matches!(change, NodeChange::Delete);
        }

        match change {
            NodeChange::Delete => {
                if parent_record.kind == ValueKind::Array && existed {
                    let count = self.count_children(tx, parent_path, &parent_record).await?;
                    let OwnedKey::Index(index) = key else {
                        return Err(array_key_error(parent_path));
                    };
                    if *index + 1 != count {
                        return Err(StorageError::ArrayConstraint {
                            path: parent_path.to_path_buf(),
                            reason: format!(
                                "cannot remove element {index} of {count}; only the trailing \
                                 element can be removed"
                            ),
                        }
                        .into());
                    }
                }
                if existing_inline.is_some() {
                    let mut updated = parent_record.clone();
                    if let RecordValue::Children(children) = &mut updated.value {
                        children.remove(&key_str);
                    }
                    tx.set(parent_path, bump(updated, Some(&parent_record), revision, now))
                        .await?;
                }
                if existing_dedicated.is_some() {
                    self.cascade_delete(tx, &child_path).await?;
                }
            }
            NodeChange::Replace(value) => {
                if !existed {
                    self.check_array_insert(tx, parent_path, &parent_record, key).await?;
                }
                if let (Some(effect), Some(children)) =
                    (effect.as_deref_mut(), value_children(value))
                {
                    let current = self
                        .current_child_names(tx, &child_path, &existing_inline, &existing_dedicated)
                        .await?;
                    let kind = if matches!(value, Value::Array(_)) {
                        ValueKind::Array
                    } else {
                        ValueKind::Object
                    };
                    record_child_ops(effect, kind, &current, &children);
                }
                if value.fits_inline(self.config.max_inline_value_size) {
                    if existing_dedicated.is_some() {
                        self.cascade_delete(tx, &child_path).await?;
                    }
                    let mut updated = parent_record.clone();
                    if let RecordValue::Children(children) = &mut updated.value {
                        children.insert(key_str, value.clone());
                    }
                    tx.set(parent_path, bump(updated, Some(&parent_record), revision, now))
                        .await?;
                } else {
                    if existing_inline.is_some() {
                        let mut updated = parent_record.clone();
                        if let RecordValue::Children(children) = &mut updated.value {
                            children.remove(&key_str);
                        }
                        tx.set(parent_path, bump(updated, Some(&parent_record), revision, now))
                            .await?;
                    }
                    self.write_dedicated(
                        tx,
                        &child_path,
                        value,
                        existing_dedicated,
                        revision,
                        now,
                        None,
                    )
                    .await?;
                }
            }
            NodeChange::Merge(updates) => {
                match existing_dedicated {
                    Some(record) if record.is_composite() => {
                        self.merge_dedicated(
                            tx,
                            &child_path,
                            record,
                            updates.clone(),
                            revision,
                            now,
                            effect,
                        )
                        .await?;
                    }
                    _ => {
                        // Inline, scalar, or absent target: materialize and
                        // replace.
                        let mut base = match existing_inline {
                            Some(inline @ (Value::Object(_) | Value::Array(_))) => inline,
                            _ => Value::Object(BTreeMap::new()),
                        };
                        if matches!(base, Value::Array(_)) {
                            validate_array_merge(&child_path, &BTreeSet::new(), updates)?;
                        }
                        merge_into(&mut base, updates.clone());
                        let replace = NodeChange::Replace(base);
                        Box::pin(self.apply_child(
                            tx,
                            parent_path,
                            key,
                            &replace,
                            revision,
                            now,
                            effect,
                        ))
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes a dedicated record for a value that does not fit inline,
    /// recursing into its own oversized children and cascading deletes of
    /// children that disappeared.
    #[allow(clippy::too_many_arguments)]
    fn write_dedicated<'a>(
        &'a self,
        tx: &'a mut Box<dyn BackendTransaction>,
        path: &'a Path,
        value: &'a Value,
        existing: Option<StoredRecord>,
        revision: &'a str,
        now: i64,
        effect: Option<&'a mut NodeEffect>,
    ) -> futures_box::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match value {
                Value::Object(_) | Value::Array(_) => {
                    let kind = if matches!(value, Value::Array(_)) {
                        ValueKind::Array
                    } else {
                        ValueKind::Object
                    };
                    let children = value_children(value).expect("composite value");
                    let mut inline = BTreeMap::new();
                    let mut dedicated: Vec<(String, &Value)> = Vec::new();
                    for (key_str, child) in &children {
                        if child.fits_inline(self.config.max_inline_value_size) {
                            inline.insert(key_str.clone(), (*child).clone());
                        } else {
                            dedicated.push((key_str.clone(), *child));
                        }
                    }

                    // Dedicated children of a previous composite that are no
                    // longer dedicated (or gone entirely) are cascaded away.
                    if existing.as_ref().is_some_and(StoredRecord::is_composite) {
                        let mut stale: Vec<PathBuf> = Vec::new();
                        let keep: BTreeSet<&str> =
                            dedicated.iter().map(|(k, _)| k.as_str()).collect();
                        tx.children_of(
                            path,
                            IncludeSpec::paths(),
                            &mut |child| {
                                child
                                    .key()
                                    .map(|k| !keep.contains(key_string(k).as_str()))
                                    .unwrap_or(false)
                            },
                            &mut |child, _| {
                                stale.push(child.to_path_buf());
                                true
                            },
                        )
                        .await?;
                        for child in stale {
                            self.cascade_delete(tx, &child).await?;
                        }
                    }

                    let record = bump(
                        StoredRecord::composite(kind, inline, revision, now),
                        existing.as_ref(),
                        revision,
                        now,
                    );
                    tx.set(path, record).await?;

                    for (key_str, child) in dedicated {
                        let child_path = push_child(path, kind, &key_str);
                        let child_existing = tx.get(&child_path).await?;
                        self.write_dedicated(
                            tx,
                            &child_path,
                            child,
                            child_existing,
                            revision,
                            now,
                            None,
                        )
                        .await?;
                    }
                    if let Some(effect) = effect {
                        effect.exists_now = true;
                    }
                    Ok(())
                }
                scalar => {
                    if existing.as_ref().is_some_and(StoredRecord::is_composite) {
                        // The node changes from composite to leaf; descendants
                        // go with it.
                        let mut stale: Vec<PathBuf> = Vec::new();
                        tx.descendants_of(
                            path,
                            IncludeSpec::paths(),
                            &mut |_| true,
                            &mut |child, _| {
                                stale.push(child.to_path_buf());
                                true
                            },
                        )
                        .await?;
                        tx.remove_multiple(&stale).await?;
                    }
                    let record = bump(
                        StoredRecord::scalar(scalar.clone(), revision, now),
                        existing.as_ref(),
                        revision,
                        now,
                    );
                    tx.set(path, record).await
                }
            }
        })
    }

    /// Merges property updates into an existing dedicated composite record.
    #[allow(clippy::too_many_arguments)]
    async fn merge_dedicated(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        path: &Path,
        record: StoredRecord,
        updates: BTreeMap<String, Value>,
        revision: &str,
        now: i64,
        mut effect: Option<&mut NodeEffect>,
    ) -> Result<()> {
        if record.kind == ValueKind::Array {
            let current = self.current_indices(tx, path, &record).await?;
            validate_array_merge(path, &current, &updates)?;
        }

        let mut updated = record.clone();
        for (key_str, value) in &updates {
            let child_path = push_child(path, record.kind, key_str);
            let existing_inline = record
                .inline_children()
                .and_then(|children| children.get(key_str))
                .cloned();
            let existing_dedicated = tx.get(&child_path).await?;
            let existed = existing_inline.is_some() || existing_dedicated.is_some();

            if let Some(effect) = effect.as_deref_mut() {
                let key = child_key(record.kind, key_str);
                let kind = if value.is_null() {
                    ChildOpKind::Delete
                } else if existed {
                    ChildOpKind::Update
                } else {
                    ChildOpKind::Insert
                };
                if !value.is_null() || existed {
                    effect.child_ops.push(ChildOp { key, kind });
                }
            }

            if value.is_null() {
                if let RecordValue::Children(children) = &mut updated.value {
                    children.remove(key_str);
                }
                if existing_dedicated.is_some() {
                    self.cascade_delete(tx, &child_path).await?;
                }
            } else if value.fits_inline(self.config.max_inline_value_size) {
                if existing_dedicated.is_some() {
                    self.cascade_delete(tx, &child_path).await?;
                }
                if let RecordValue::Children(children) = &mut updated.value {
                    children.insert(key_str.clone(), value.clone());
                }
            } else {
                if let RecordValue::Children(children) = &mut updated.value {
                    children.remove(key_str);
                }
                self.write_dedicated(tx, &child_path, value, existing_dedicated, revision, now, None)
                    .await?;
            }
        }
        tx.set(path, bump(updated, Some(&record), revision, now)).await
    }

    /// Removes the record at `path` and every dedicated descendant.
    async fn cascade_delete(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        path: &Path,
    ) -> Result<()> {
        let mut targets: Vec<PathBuf> = Vec::new();
        tx.descendants_of(path, IncludeSpec::paths(), &mut |_| true, &mut |child, _| {
            targets.push(child.to_path_buf());
            true
        })
        .await?;
        tx.remove_multiple(&targets).await?;
        tx.remove(path).await
    }

    /// Validates that inserting `key` into an array parent appends rather
    /// than leaving a gap.
    async fn check_array_insert(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        parent_path: &Path,
        parent_record: &StoredRecord,
        key: &OwnedKey,
    ) -> Result<()> {
        if parent_record.kind != ValueKind::Array {
            return Ok(());
        }
        let OwnedKey::Index(index) = key else {
            return Err(array_key_error(parent_path));
        };
        let count = self.count_children(tx, parent_path, parent_record).await?;
        if *index > count {
            return Err(StorageError::ArrayConstraint {
                path: parent_path.to_path_buf(),
                reason: format!("cannot insert element {index} into an array of {count}"),
            }
            .into());
        }
        Ok(())
    }

    async fn count_children(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        path: &Path,
        record: &StoredRecord,
    ) -> Result<usize> {
        let inline = record.inline_children().map(BTreeMap::len).unwrap_or(0);
        let mut dedicated = 0usize;
        tx.children_of(path, IncludeSpec::paths(), &mut |_| true, &mut |_, _| {
            dedicated += 1;
            true
        })
        .await?;
        Ok(inline + dedicated)
    }

    async fn current_indices(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        path: &Path,
        record: &StoredRecord,
    ) -> Result<BTreeSet<usize>> {
        let mut indices: BTreeSet<usize> = record
            .inline_children()
            .map(|children| children.keys().filter_map(|k| k.parse().ok()).collect())
            .unwrap_or_default();
        tx.children_of(path, IncludeSpec::paths(), &mut |_| true, &mut |child, _| {
            if let Some(Key::Index(index)) = child.key() {
                indices.insert(index);
            }
            true
        })
        .await?;
        Ok(indices)
    }

    /// The direct child names of a node that is being replaced, for effect
    /// summaries.
    async fn current_child_names(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        child_path: &Path,
        existing_inline: &Option<Value>,
        existing_dedicated: &Option<StoredRecord>,
    ) -> Result<BTreeSet<String>> {
        let mut names: BTreeSet<String> = BTreeSet::new();
        if let Some(inline) = existing_inline {
            for key in inline.child_keys() {
                names.insert(key_string(key.as_key()));
            }
        }
        if let Some(record) = existing_dedicated {
            if let Some(children) = record.inline_children() {
                names.extend(children.keys().cloned());
            }
            tx.children_of(child_path, IncludeSpec::paths(), &mut |_| true, &mut |child, _| {
                if let Some(key) = child.key() {
                    names.insert(key_string(key));
                }
                true
            })
            .await?;
        }
        Ok(names)
    }

    // === Subtree assembly ===

    /// Reads and assembles the node at `path` within an open transaction.
    async fn read_tree(
        &self,
        tx: &mut Box<dyn BackendTransaction>,
        path: &Path,
        filter: &PathFilter,
    ) -> Result<Option<NodeValue>> {
        let Some(record) = tx.get(path).await? else {
            // The node may live inline in its parent record.
            let Some(parent) = path.parent() else {
                return Ok(None);
            };
            let key = key_string(path.key().expect("non-root path"));
            let Some(parent_record) = tx.get(parent).await? else {
                return Ok(None);
            };
            let Some(inline) = parent_record
                .inline_children()
                .and_then(|children| children.get(&key))
            else {
                return Ok(None);
            };
            return Ok(Some(NodeValue {
                value: inline.clone(),
                revision: parent_record.revision.clone(),
                revision_nr: parent_record.revision_nr,
                created: parent_record.created,
                modified: parent_record.modified,
            }));
        };

        let value = match &record.value {
            RecordValue::Scalar(value) => value.clone(),
            RecordValue::Children(inline) => {
                let mut root = Slot::container(record.kind);
                for (key_str, child) in inline {
                    let key = child_key(record.kind, key_str);
                    let rel = PathBuf::root().push_key(&key);
                    if filter.allows(&rel) {
                        root.insert_value(std::slice::from_ref(&key), child.clone());
                    }
                }

                let base_depth = path.depth();
                let mut assembly_error: Option<crate::Error> = None;
                {
                    let root_ref = &mut root;
                    let err_ref = &mut assembly_error;
                    tx.descendants_of(
                        path,
                        IncludeSpec::all(),
                        &mut |candidate| {
                            let rel = relative_path(candidate, base_depth);
                            filter.allows(&rel)
                        },
                        &mut |candidate, record| {
                            let Some(record) = record else {
                                return true;
                            };
                            let rel_keys: Vec<OwnedKey> = candidate
                                .keys()
                                .skip(base_depth)
                                .filter_map(|k| k.to_owned_key())
                                .collect();
                            match record_slot(record, filter, &rel_keys) {
                                Ok(slot) => root_ref.insert_slot(&rel_keys, slot),
                                Err(e) => {
                                    *err_ref = Some(e);
                                    return false;
                                }
                            }
                            true
                        },
                    )
                    .await?;
                }
                if let Some(e) = assembly_error {
                    return Err(e);
                }

                let mut value = root.finalize();
                if filter.child_objects == Some(false) {
                    prune_composite_children(&mut value);
                }
                value
            }
        };

        Ok(Some(NodeValue {
            value,
            revision: record.revision.clone(),
            revision_nr: record.revision_nr,
            created: record.created,
            modified: record.modified,
        }))
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

mod futures_box {
    pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
}

/// A partially assembled subtree.
enum Slot {
    Value(Value),
    Container {
        kind: ValueKind,
        children: BTreeMap<OwnedKey, Slot>,
    },
}

impl Slot {
    fn container(kind: ValueKind) -> Slot {
        Slot::Container {
            kind,
            children: BTreeMap::new(),
        }
    }

    fn insert_value(&mut self, rel: &[OwnedKey], value: Value) {
        self.insert_slot(rel, Slot::Value(value));
    }

    fn insert_slot(&mut self, rel: &[OwnedKey], slot: Slot) {
        let Some((first, rest)) = rel.split_first() else {
            // A record for a node already holding assembled children: keep
            // the children, adopt the record's kind and inline values.
            if let (
                Slot::Container { kind, children },
                Slot::Container {
                    kind: new_kind,
                    children: new_children,
                },
            ) = (&mut *self, slot)
            {
                *kind = new_kind;
                for (key, child) in new_children {
                    children.entry(key).or_insert(child);
                }
            }
            return;
        };
        if matches!(self, Slot::Value(_)) {
            // A placeholder is upgraded to a container when descendants
            // arrive.
            *self = Slot::container(match first {
                OwnedKey::Index(_) => ValueKind::Array,
                OwnedKey::Name(_) => ValueKind::Object,
            });
        }
        let Slot::Container { children, .. } = self else {
            unreachable!("just ensured a container");
        };
        let entry = children.entry(first.clone()).or_insert_with(|| {
            Slot::container(match rest.first() {
                Some(OwnedKey::Index(_)) => ValueKind::Array,
                _ => ValueKind::Object,
            })
        });
        if rest.is_empty() {
            match slot {
                Slot::Container { .. } => entry.insert_slot(&[], slot),
                value => *entry = value,
            }
        } else {
            entry.insert_slot(rest, slot);
        }
    }

    fn finalize(self) -> Value {
        match self {
            Slot::Value(value) => value,
            Slot::Container { kind, children } => match kind {
                ValueKind::Array => {
                    let mut elements: Vec<(usize, Value)> = children
                        .into_iter()
                        .filter_map(|(key, slot)| match key {
                            OwnedKey::Index(index) => Some((index, slot.finalize())),
                            OwnedKey::Name(_) => None,
                        })
                        .collect();
                    elements.sort_by_key(|(index, _)| *index);
                    Value::Array(elements.into_iter().map(|(_, v)| v).collect())
                }
                _ => Value::Object(
                    children
                        .into_iter()
                        .map(|(key, slot)| (key_string(key.as_key()), slot.finalize()))
                        .collect(),
                ),
            },
        }
    }
}

/// Converts one stored record into a slot, applying the filter to its
/// inline children.
fn record_slot(record: &StoredRecord, filter: &PathFilter, rel_prefix: &[OwnedKey]) -> Result<Slot> {
    Ok(match &record.value {
        RecordValue::Scalar(value) => Slot::Value(value.clone()),
        RecordValue::Children(inline) => {
            let mut slot = Slot::container(record.kind);
            for (key_str, child) in inline {
                let key = child_key(record.kind, key_str);
                let mut rel = PathBuf::root();
                for k in rel_prefix {
                    rel = rel.push_key(k);
                }
                rel = rel.push_key(&key);
                if filter.allows(&rel) {
                    slot.insert_value(std::slice::from_ref(&key), child.clone());
                }
            }
            slot
        }
    })
}

/// Include/exclude/child-pruning rules for subtree reads, applied to paths
/// relative to the read target.
#[derive(Debug, Clone, Default)]
struct PathFilter {
    include: Vec<PathBuf>,
    exclude: Vec<PathBuf>,
    child_objects: Option<bool>,
    /// Restrict direct children to these keys (pre-image key filters).
    top_keys: Option<Vec<String>>,
}

impl PathFilter {
    fn allows(&self, rel: &Path) -> bool {
        if rel.is_root() {
            return true;
        }
        if let Some(keys) = &self.top_keys {
            let first = rel.keys().next().expect("non-root path");
            if !keys.iter().any(|k| k == &key_string(first)) {
                return false;
            }
        }
        if self.child_objects == Some(false) && rel.depth() > 1 {
            return false;
        }
        for exclude in &self.exclude {
            if exclude.depth() <= rel.depth() && exclude.is_on_trail_of(rel) {
                return false;
            }
        }
        if !self.include.is_empty() && !self.include.iter().any(|inc| inc.is_on_trail_of(rel)) {
            return false;
        }
        true
    }
}

/// Removes composite direct children after assembly (`child_objects:
/// false`).
fn prune_composite_children(value: &mut Value) {
    match value {
        Value::Object(map) => map.retain(|_, v| !v.is_composite()),
        Value::Array(vec) => vec.retain(|v| !v.is_composite()),
        _ => {}
    }
}

fn ensure_concrete(path: &Path) -> Result<()> {
    if path.has_wildcards() {
        return Err(StorageError::NotAllowed {
            path: path.to_path_buf(),
            reason: "wildcard paths cannot be addressed directly".to_string(),
        }
        .into());
    }
    Ok(())
}

/// The canonical string form of a key as used in record child maps.
fn key_string(key: Key<'_>) -> String {
    match key {
        Key::Name(name) => name.to_string(),
        Key::Index(index) => index.to_string(),
        wildcard => wildcard.to_string(),
    }
}

/// The owned key a record child map entry addresses, given the record kind.
fn child_key(kind: ValueKind, key_str: &str) -> OwnedKey {
    if kind == ValueKind::Array {
        if let Ok(index) = key_str.parse() {
            return OwnedKey::Index(index);
        }
    }
    OwnedKey::Name(key_str.to_string())
}

fn push_child(path: &Path, kind: ValueKind, key_str: &str) -> PathBuf {
    path.to_path_buf().push_key(&child_key(kind, key_str))
}

fn child_path_of(path: &Path, kind: ValueKind, key_str: &str) -> PathBuf {
    push_child(path, kind, key_str)
}

/// The direct children of a composite payload, keyed the way records key
/// them.
fn value_children(value: &Value) -> Option<BTreeMap<String, &Value>> {
    match value {
        Value::Object(map) => Some(map.iter().map(|(k, v)| (k.clone(), v)).collect()),
        Value::Array(vec) => Some(
            vec.iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
        ),
        _ => None,
    }
}

fn record_child_ops(
    effect: &mut NodeEffect,
    kind: ValueKind,
    current: &BTreeSet<String>,
    new_children: &BTreeMap<String, &Value>,
) {
    for key_str in new_children.keys() {
        effect.child_ops.push(ChildOp {
            key: child_key(kind, key_str),
            kind: if current.contains(key_str) {
                ChildOpKind::Update
            } else {
                ChildOpKind::Insert
            },
        });
    }
    for key_str in current {
        if !new_children.contains_key(key_str) {
            effect.child_ops.push(ChildOp {
                key: child_key(kind, key_str),
                kind: ChildOpKind::Delete,
            });
        }
    }
}

/// Carries record metadata forward across a rewrite: `created` is
/// preserved, the write counter increments, revision and `modified` take
/// the current operation's values.
fn bump(mut record: StoredRecord, existing: Option<&StoredRecord>, revision: &str, now: i64) -> StoredRecord {
    if let Some(existing) = existing {
        record.created = existing.created;
        record.revision_nr = existing.revision_nr + 1;
    }
    record.revision = revision.to_string();
    record.modified = now;
    record
}

/// Validates an index-keyed merge against an array's current index set:
/// the final set must stay dense and removals must be trailing.
fn validate_array_merge(
    path: &Path,
    current: &BTreeSet<usize>,
    updates: &BTreeMap<String, Value>,
) -> Result<()> {
    let mut final_set = current.clone();
    let mut removed: Vec<usize> = Vec::new();
    for (key_str, value) in updates {
        let index: usize = key_str.parse().map_err(|_| StorageError::ArrayConstraint {
            path: path.to_path_buf(),
            reason: format!("'{key_str}' is not an array index"),
        })?;
        if value.is_null() {
            final_set.remove(&index);
            removed.push(index);
        } else {
            final_set.insert(index);
        }
    }
    for (expected, index) in final_set.iter().enumerate() {
        if *index != expected {
            return Err(StorageError::ArrayConstraint {
                path: path.to_path_buf(),
                reason: format!("elements must stay contiguous; gap at index {expected}"),
            }
            .into());
        }
    }
    let len = final_set.len();
    if removed.iter().any(|index| *index < len) {
        return Err(StorageError::ArrayConstraint {
            path: path.to_path_buf(),
            reason: "only trailing elements can be removed".to_string(),
        }
        .into());
    }
    Ok(())
}

fn array_key_error(path: &Path) -> crate::Error {
    StorageError::ArrayConstraint {
        path: path.to_path_buf(),
        reason: "array children are addressed by index".to_string(),
    }
    .into()
}

/// The first `depth` keys of a concrete path.
fn truncate_path(path: &Path, depth: usize) -> PathBuf {
    path.keys()
        .take(depth)
        .filter_map(|k| k.to_owned_key())
        .fold(PathBuf::root(), |p, k| p.push_key(&k))
}

/// The concrete keys of `deeper` below `base`.
fn keys_below(base: &Path, deeper: &Path) -> Vec<OwnedKey> {
    deeper
        .keys()
        .skip(base.depth())
        .filter_map(|k| k.to_owned_key())
        .collect()
}

/// The path of `candidate` relative to a base depth, as a borrowed-keys
/// path buffer.
fn relative_path(candidate: &Path, base_depth: usize) -> PathBuf {
    candidate
        .keys()
        .skip(base_depth)
        .filter_map(|k| k.to_owned_key())
        .fold(PathBuf::root(), |p, k| p.push_key(&k))
}
