//! Query planning and execution.
//!
//! A query targets the children of a base path (possibly containing
//! wildcards), applies filters and ordering, and returns matching record
//! paths with optional values. Planning picks the best index per filter,
//! scoring candidates by how many other filter and sort keys their captured
//! properties cover; filters without an index become table-scan filters over
//! the streamed children of the base path. Queries on wildcard paths must be
//! fully index-backed, as must any specialized `<indextype>:<op>` operator.
//!
//! With monitoring enabled the executor registers notify-only child
//! subscriptions on the base path and re-evaluates the filters against each
//! changed child, emitting add/change/remove events for membership changes.

pub mod errors;
pub mod ops;

pub use errors::QueryError;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::Result;
use crate::index::TreeIndex;
use crate::index::key::compare_indexable;
use crate::path::{Path, PathBuf};
use crate::storage::{ReadOptions, StorageEngine, WriteOptions};
use crate::subscription::{EventStream, EventType};
use crate::value::Value;

/// One query filter: `key op compare`.
#[derive(Debug, Clone)]
pub struct QueryFilter {
    /// Property key, relative to each record; may be nested (`a/b`).
    pub key: String,
    /// The operator.
    pub op: String,
    /// The compare operand.
    pub compare: Value,
}

/// One sort instruction.
#[derive(Debug, Clone)]
pub struct QueryOrder {
    /// Property key to order by.
    pub key: String,
    /// Ascending or descending.
    pub ascending: bool,
}

/// Options for executing a query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Load each matched record's value.
    pub snapshots: bool,
    /// Value load filters, as in node reads.
    pub include: Vec<PathBuf>,
    /// Value load filters, as in node reads.
    pub exclude: Vec<PathBuf>,
    /// Prune composite children of loaded values.
    pub child_objects: Option<bool>,
    /// Live-match tracking.
    pub monitor: MonitorOptions,
}

/// Which membership changes a live query reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorOptions {
    /// Report records that start matching.
    pub add: bool,
    /// Report matching records that change.
    pub change: bool,
    /// Report records that stop matching.
    pub remove: bool,
}

impl MonitorOptions {
    /// True when any change kind is monitored.
    pub fn any(&self) -> bool {
        self.add || self.change || self.remove
    }
}

/// A live-query membership event.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    /// What happened to the record's membership.
    pub name: QueryEventName,
    /// The record's path.
    pub path: PathBuf,
    /// The record's value, when the query was executed with snapshots.
    pub value: Option<Value>,
}

/// The kinds of live-query events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryEventName {
    /// The record started matching the query.
    Add,
    /// A matching record's value changed.
    Change,
    /// The record stopped matching the query.
    Remove,
}

/// One matched record.
#[derive(Debug, Clone)]
pub struct QueryRow {
    /// The record's path.
    pub path: PathBuf,
    /// The record's value, loaded when snapshots were requested.
    pub value: Option<Value>,
}

/// The outcome of a query execution.
pub struct QueryResults {
    /// Matched records after sorting and pagination.
    pub rows: Vec<QueryRow>,
    /// Live membership events, present when monitoring was requested.
    /// Stopping or dropping the stream cancels the monitors.
    pub events: Option<EventStream<QueryEvent>>,
}

impl std::fmt::Debug for QueryResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResults")
            .field("rows", &self.rows)
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// A query over the children of a base path.
#[derive(Clone)]
pub struct Query {
    engine: Arc<StorageEngine>,
    path: PathBuf,
    filters: Vec<QueryFilter>,
    order: Vec<QueryOrder>,
    skip: usize,
    take: usize,
}

/// A planned filter: evaluated through an index, or table-scanned.
struct PlannedFilter {
    filter: QueryFilter,
    index: Option<Arc<dyn TreeIndex>>,
}

/// A candidate row during execution.
struct Candidate {
    path: PathBuf,
    /// Property values captured by indexes.
    captured: BTreeMap<String, Value>,
    /// Partial record value loaded from storage.
    loaded: Option<Value>,
    /// Keys that have been loaded, present in the record or not.
    loaded_keys: HashSet<String>,
}

impl Candidate {
    fn new(path: PathBuf, captured: BTreeMap<String, Value>) -> Self {
        Self {
            path,
            captured,
            loaded: None,
            loaded_keys: HashSet::new(),
        }
    }

    fn property(&self, key: &str) -> Option<&Value> {
        self.captured
            .get(key)
            .or_else(|| self.loaded.as_ref().and_then(|v| crate::index::property(v, key)))
    }

    fn has_key(&self, key: &str) -> bool {
        self.captured.contains_key(key) || self.loaded_keys.contains(key)
    }
}

impl Query {
    /// Creates a query on the children of `path`.
    pub fn new(engine: Arc<StorageEngine>, path: PathBuf) -> Self {
        Self {
            engine,
            path,
            filters: Vec::new(),
            order: Vec::new(),
            skip: 0,
            take: 0,
        }
    }

    /// Adds a filter.
    pub fn filter(mut self, key: impl Into<String>, op: impl Into<String>, compare: impl Into<Value>) -> Self {
        self.filters.push(QueryFilter {
            key: key.into(),
            op: op.into(),
            compare: compare.into(),
        });
        self
    }

    /// Adds a sort key. Sorts are applied in the order they are added.
    pub fn sort(mut self, key: impl Into<String>, ascending: bool) -> Self {
        self.order.push(QueryOrder {
            key: key.into(),
            ascending,
        });
        self
    }

    /// Skips the first `n` results.
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Limits the number of results. Zero means no limit.
    pub fn take(mut self, n: usize) -> Self {
        self.take = n;
        self
    }

    pub(crate) fn engine_handle(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Counts the matching records without loading values.
    pub async fn count(&self) -> Result<usize> {
        let results = self.clone().get(QueryOptions::default()).await?;
        Ok(results.rows.len())
    }

    /// Removes every matching record.
    pub async fn remove(&self) -> Result<()> {
        let results = self.clone().get(QueryOptions::default()).await?;
        for row in results.rows {
            self.engine
                .remove_node(&row.path, WriteOptions::default())
                .await?;
        }
        Ok(())
    }

    /// Executes the query.
    pub async fn get(self, options: QueryOptions) -> Result<QueryResults> {
        for filter in &self.filters {
            ops::validate_operand(&filter.op, &filter.compare)?;
        }
        let planned = self.plan()?;

        let mut candidates = self.gather(&planned).await?;

        self.sort_candidates(&mut candidates).await?;
        let candidates: Vec<Candidate> = {
            let take = if self.take == 0 {
                usize::MAX
            } else {
                self.take
            };
            candidates.into_iter().skip(self.skip).take(take).collect()
        };

        let mut rows = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let value = if options.snapshots {
                self.engine
                    .get_node(
                        &candidate.path,
                        ReadOptions {
                            include: options.include.clone(),
                            exclude: options.exclude.clone(),
                            child_objects: options.child_objects,
                            tid: None,
                        },
                    )
                    .await?
                    .map(|nv| nv.value)
            } else {
                None
            };
            rows.push(QueryRow {
                path: candidate.path,
                value,
            });
        }

        let events = if options.monitor.any() {
            Some(self.start_monitor(&planned, &rows, &options))
        } else {
            None
        };

        Ok(QueryResults { rows, events })
    }

    /// Chooses an index per filter where possible and checks that the rest
    /// may legally table-scan.
    fn plan(&self) -> Result<Vec<PlannedFilter>> {
        let other_keys: Vec<&str> = self
            .filters
            .iter()
            .map(|f| f.key.as_str())
            .chain(self.order.iter().map(|o| o.key.as_str()))
            .collect();

        let mut planned = Vec::with_capacity(self.filters.len());
        for filter in &self.filters {
            let candidates = self.engine.indexes().for_filter(&self.path, &filter.key, &filter.op);
            // Prefer the index covering the most other filter and sort keys
            // with its captured properties.
            let best = candidates.into_iter().max_by_key(|index| {
                other_keys
                    .iter()
                    .filter(|key| {
                        **key != filter.key
                            && (index.spec().include.iter().any(|i| i == *key)
                                || index.spec().key == **key)
                    })
                    .count()
            });

            if best.is_none() {
                if ops::is_specialized(&filter.op) {
                    return Err(QueryError::IndexUnavailable {
                        path: self.path.as_str().to_string(),
                        key: filter.key.clone(),
                        op: filter.op.clone(),
                    }
                    .into());
                }
                if !ops::is_standard(&filter.op) {
                    return Err(QueryError::UnknownOperator {
                        op: filter.op.clone(),
                    }
                    .into());
                }
                if self.path.has_wildcards() {
                    // A wildcard collection cannot be streamed; every filter
                    // must be index-backed.
                    return Err(QueryError::IndexUnavailable {
                        path: self.path.as_str().to_string(),
                        key: filter.key.clone(),
                        op: filter.op.clone(),
                    }
                    .into());
                }
            }
            planned.push(PlannedFilter {
                filter: filter.clone(),
                index: best,
            });
        }
        Ok(planned)
    }

    /// Produces the candidate set: intersected index results, further
    /// narrowed by table-scan filters, or a full stream of the base path's
    /// children when no filter is indexed.
    async fn gather(&self, planned: &[PlannedFilter]) -> Result<Vec<Candidate>> {
        let indexed: Vec<&PlannedFilter> = planned.iter().filter(|p| p.index.is_some()).collect();
        let scans: Vec<&PlannedFilter> = planned.iter().filter(|p| p.index.is_none()).collect();

        if !indexed.is_empty() {
            // Run all indexed filters, intersect smallest-first.
            let mut sets = Vec::with_capacity(indexed.len());
            for p in &indexed {
                let index = p.index.as_ref().expect("indexed filter");
                sets.push(index.query(&p.filter.op, &p.filter.compare).await?);
            }
            sets.sort_by_key(crate::index::IndexResultSet::len);
            let mut merged = sets.remove(0);
            for set in sets {
                merged = merged.intersect(set);
                if merged.is_empty() {
                    break;
                }
            }

            let mut candidates = Vec::with_capacity(merged.len());
            for m in merged.matches {
                let mut candidate = Candidate::new(m.path, m.indexed);
                if self.matches_scans(&mut candidate, &scans).await? {
                    candidates.push(candidate);
                }
            }
            return Ok(candidates);
        }

        if self.filters.is_empty() {
            // Sort-only use of an index short-circuits to an ordered take.
            if let [order] = self.order.as_slice() {
                if let Some(index) = self.engine.indexes().for_sort(&self.path, &order.key) {
                    let take = if self.take == 0 {
                        usize::MAX
                    } else {
                        self.take + self.skip
                    };
                    let set = index.take(0, take, order.ascending).await?;
                    return Ok(set
                        .matches
                        .into_iter()
                        .map(|m| Candidate::new(m.path, m.indexed))
                        .collect());
                }
            }
        }

        // A wildcard collection cannot be streamed child-by-child; anything
        // reaching this point needs an index.
        if self.path.has_wildcards() {
            return Err(QueryError::IndexUnavailable {
                path: self.path.as_str().to_string(),
                key: "*".to_string(),
                op: "*".to_string(),
            }
            .into());
        }

        // Table scan over the base path's direct children.
        let mut children: Vec<PathBuf> = Vec::new();
        let listing = self
            .engine
            .get_children(&self.path, None, &mut |info| {
                children.push(info.path.clone());
                true
            })
            .await;
        match listing {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut candidates = Vec::new();
        let bound = if self.take == 0 {
            usize::MAX
        } else {
            self.skip + self.take
        };
        // Load filter and sort keys in one read per candidate.
        let mut preload: Vec<&str> = scans
            .iter()
            .map(|p| p.filter.key.as_str())
            .chain(self.order.iter().map(|o| o.key.as_str()))
            .collect();
        preload.sort_unstable();
        preload.dedup();
        for path in children {
            let mut candidate = Candidate::new(path, BTreeMap::new());
            if !preload.is_empty() {
                self.load_properties(&mut candidate, &preload).await?;
            }
            if self.matches_scans(&mut candidate, &scans).await? {
                candidates.push(candidate);
                // Keep memory bounded: retain only the current top slice
                // when an order and limit are set.
                if self.take > 0 && !self.order.is_empty() && candidates.len() > bound * 2 {
                    self.sort_candidates(&mut candidates).await?;
                    candidates.truncate(bound);
                }
            }
        }
        Ok(candidates)
    }

    /// Evaluates the table-scan filters on one candidate, loading the
    /// properties that no index captured.
    async fn matches_scans(
        &self,
        candidate: &mut Candidate,
        scans: &[&PlannedFilter],
    ) -> Result<bool> {
        let needed: Vec<&str> = scans.iter().map(|p| p.filter.key.as_str()).collect();
        self.load_properties(candidate, &needed).await?;
        for p in scans {
            let value = candidate.property(&p.filter.key);
            if !ops::evaluate(value, &p.filter.op, &p.filter.compare) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Loads record properties the candidate does not have yet, merging
    /// them into its partial value.
    async fn load_properties(&self, candidate: &mut Candidate, keys: &[&str]) -> Result<()> {
        let missing: Vec<&str> = keys
            .iter()
            .filter(|key| !candidate.has_key(key))
            .copied()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let mut include = Vec::with_capacity(missing.len());
        for key in &missing {
            include.push(PathBuf::parse(key).map_err(|source| QueryError::InvalidFilterKey {
                key: key.to_string(),
                source,
            })?);
        }
        let fetched = self
            .engine
            .get_node(
                &candidate.path,
                ReadOptions {
                    include,
                    ..Default::default()
                },
            )
            .await?
            .map(|nv| nv.value);
        match (&mut candidate.loaded, fetched) {
            (Some(Value::Object(existing)), Some(Value::Object(additions))) => {
                existing.extend(additions);
            }
            (loaded, fetched @ Some(_)) if loaded.is_none() => *loaded = fetched,
            _ => {}
        }
        candidate
            .loaded_keys
            .extend(missing.into_iter().map(str::to_string));
        Ok(())
    }

    /// Sorts candidates per the order instructions: absent values first,
    /// ties broken by path.
    async fn sort_candidates(&self, candidates: &mut Vec<Candidate>) -> Result<()> {
        if self.order.is_empty() {
            candidates.sort_by(|a, b| a.path.as_str().cmp(b.path.as_str()));
            return Ok(());
        }
        // Make sure every sort key is available on every candidate.
        let keys: Vec<&str> = self.order.iter().map(|o| o.key.as_str()).collect();
        for candidate in candidates.iter_mut() {
            self.load_properties(candidate, &keys).await?;
        }
        let order = self.order.clone();
        candidates.sort_by(|a, b| {
            for o in &order {
                let ordering = compare_indexable(a.property(&o.key), b.property(&o.key));
                let ordering = if o.ascending {
                    ordering
                } else {
                    ordering.reverse()
                };
                if !ordering.is_eq() {
                    return ordering;
                }
            }
            a.path.as_str().cmp(b.path.as_str())
        });
        Ok(())
    }

    /// Registers notify subscriptions on the base path and spawns the
    /// re-evaluation task.
    fn start_monitor(
        &self,
        planned: &[PlannedFilter],
        rows: &[QueryRow],
        options: &QueryOptions,
    ) -> EventStream<QueryEvent> {
        let (sender, receiver) = mpsc::channel(self.engine.config().event_queue_capacity);
        let mut matched: HashSet<String> =
            rows.iter().map(|r| r.path.as_str().to_string()).collect();

        let registry = self.engine.subscriptions();
        let mut added = registry.subscribe(&self.path, EventType::NotifyChildAdded);
        let mut changed = registry.subscribe(&self.path, EventType::NotifyChildChanged);
        let mut removed = registry.subscribe(&self.path, EventType::NotifyChildRemoved);

        let engine = Arc::clone(&self.engine);
        let filters: Vec<(QueryFilter, Option<Arc<dyn TreeIndex>>)> = planned
            .iter()
            .map(|p| (p.filter.clone(), p.index.clone()))
            .collect();
        let monitor = options.monitor;
        let snapshots = options.snapshots;

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    Some(e) = added.next() => e,
                    Some(e) = changed.next() => e,
                    Some(e) = removed.next() => e,
                    else => break,
                };
                let path = event.path.clone();
                let key = path.as_str().to_string();
                let was_matched = matched.contains(&key);

                let matches_now = if event.event_type == EventType::NotifyChildRemoved {
                    false
                } else {
                    match evaluate_filters(&engine, &path, &filters).await {
                        Ok(matches) => matches,
                        Err(error) => {
                            tracing::warn!(path = %path, %error, "Live query re-evaluation failed");
                            continue;
                        }
                    }
                };

                let emitted = match (was_matched, matches_now) {
                    (false, true) => {
                        matched.insert(key);
                        monitor.add.then_some(QueryEventName::Add)
                    }
                    (true, false) => {
                        matched.remove(&key);
                        monitor.remove.then_some(QueryEventName::Remove)
                    }
                    (true, true) => monitor.change.then_some(QueryEventName::Change),
                    (false, false) => None,
                };
                let Some(name) = emitted else {
                    continue;
                };
                let value = if snapshots && name != QueryEventName::Remove {
                    engine
                        .get_node(&path, ReadOptions::default())
                        .await
                        .ok()
                        .flatten()
                        .map(|nv| nv.value)
                } else {
                    None
                };
                if sender.send(QueryEvent { name, path, value }).await.is_err() {
                    break;
                }
            }
        });

        EventStream::new(
            receiver,
            Box::new(move || {
                task.abort();
            }),
        )
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("path", &self.path.as_str())
            .field("filters", &self.filters.len())
            .field("order", &self.order.len())
            .field("skip", &self.skip)
            .field("take", &self.take)
            .finish()
    }
}

/// Re-evaluates all query filters against one record, loading only the keys
/// the indexes did not capture.
async fn evaluate_filters(
    engine: &StorageEngine,
    path: &Path,
    filters: &[(QueryFilter, Option<Arc<dyn TreeIndex>>)],
) -> Result<bool> {
    let mut include = Vec::new();
    for (filter, _) in filters {
        match PathBuf::parse(&filter.key) {
            Ok(p) => include.push(p),
            Err(source) => {
                return Err(QueryError::InvalidFilterKey {
                    key: filter.key.clone(),
                    source,
                }
                .into());
            }
        }
    }
    let value = engine
        .get_node(
            path,
            ReadOptions {
                include,
                ..Default::default()
            },
        )
        .await?
        .map(|nv| nv.value);
    let Some(value) = value else {
        return Ok(false);
    };
    for (filter, index) in filters {
        let property = crate::index::property(&value, &filter.key);
        let matches = match index {
            Some(index) => index.test(property, &filter.op, &filter.compare),
            None => ops::evaluate(property, &filter.op, &filter.compare),
        };
        if !matches {
            return Ok(false);
        }
    }
    Ok(true)
}
