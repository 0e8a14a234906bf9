//! Mutation tracking and event dispatch.
//!
//! After a write commits, the engine hands the mutation to this module:
//! first every straddled index receives the record updates it cares about
//! (deepest index paths first), then subscriber events are computed by
//! walking the old and new images in lockstep along each subscriber's data
//! path, expanding wildcards into the keys actually present on either side.
//!
//! Dispatch happens on a dedicated task, never inline with the mutation:
//! the engine enqueues a batch of jobs and returns; the dispatcher drains
//! the queue and pushes events into the subscribers' bounded channels.
//! Within one mutation, events fire deepest path first.

use std::collections::BTreeSet;

use tokio::sync::mpsc;

use crate::Result;
use crate::index::IndexManager;
use crate::path::{Key, OwnedKey, Path, PathBuf};
use crate::subscription::{
    DataEvent, EventType, MutationEntry, RelevantSubscription, SubscriptionRegistry,
};
use crate::value::{Value, ValueChange, compare_values};

/// How a write affected one direct child of the written node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOpKind {
    /// The child did not exist before.
    Insert,
    /// The child existed and was overwritten or merged.
    Update,
    /// The child was removed.
    Delete,
}

/// A direct-child operation recorded during the write.
#[derive(Debug, Clone)]
pub struct ChildOp {
    /// The child key.
    pub key: OwnedKey,
    /// What happened to it.
    pub kind: ChildOpKind,
}

/// Record-level facts about a write that are known without a pre-image
/// load. These drive notify-only events on the fast path.
#[derive(Debug, Clone, Default)]
pub struct NodeEffect {
    /// The written node existed before the write.
    pub existed_before: bool,
    /// The written node exists after the write.
    pub exists_now: bool,
    /// Ancestor records the write created.
    pub created_ancestors: Vec<PathBuf>,
    /// Operations on the written node's direct children.
    pub child_ops: Vec<ChildOp>,
}

/// Everything the tracker needs to know about one committed write.
#[derive(Debug, Clone)]
pub struct MutationRecord {
    /// The written path.
    pub path: PathBuf,
    /// The top event path: the shallowest ancestor whose pre-image a
    /// subscriber or index needed. Ancestor-or-equal of `path`.
    pub top_path: PathBuf,
    /// Whether the pre-image at `top_path` was loaded. When false,
    /// `previous` and `value` are unusable and only notify events fire.
    pub preimage_loaded: bool,
    /// The value at `top_path` before the write.
    pub previous: Option<Value>,
    /// The value at `top_path` after the write.
    pub value: Option<Value>,
    /// Record-level facts for the fast path.
    pub effect: NodeEffect,
    /// Revision id shared by all records the write touched.
    pub revision: String,
    /// The caller-supplied opaque context.
    pub context: Option<serde_json::Value>,
    /// Skip subscriber dispatch entirely (index updates still run).
    pub suppress_events: bool,
}

/// One event addressed to one subscription.
#[derive(Debug)]
pub struct DispatchJob {
    /// The registry id of the target subscription.
    pub subscription_id: u64,
    /// The event to deliver.
    pub event: DataEvent,
}

/// Handle to the background dispatch task.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: mpsc::UnboundedSender<Vec<DispatchJob>>,
}

impl EventDispatcher {
    /// Spawns the dispatch task delivering into `registry`.
    pub fn start(registry: SubscriptionRegistry) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<DispatchJob>>();
        tokio::spawn(async move {
            while let Some(batch) = receiver.recv().await {
                for job in batch {
                    registry.deliver(job.subscription_id, job.event).await;
                }
            }
        });
        Self { sender }
    }

    /// Queues a batch of events for delivery on the dispatch task.
    pub fn enqueue(&self, jobs: Vec<DispatchJob>) {
        if !jobs.is_empty() && self.sender.send(jobs).is_err() {
            tracing::warn!("Event dispatcher is gone, dropping events");
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher").finish_non_exhaustive()
    }
}

/// Routes a committed mutation to straddled indexes and subscribers.
pub async fn process_mutation(
    registry: &SubscriptionRegistry,
    indexes: &IndexManager,
    dispatcher: &EventDispatcher,
    record: MutationRecord,
    wait_for_index_updates: bool,
) -> Result<()> {
    update_indexes(indexes, &record, wait_for_index_updates).await?;

    if record.suppress_events {
        return Ok(());
    }
    let mut jobs: Vec<DispatchJob> = Vec::new();
    for sub in registry.all_subscribers_for(&record.path) {
        for event in events_for(&sub, &record) {
            jobs.push(DispatchJob {
                subscription_id: sub.id,
                event,
            });
        }
    }
    // Deepest paths fire first: a value event on a child precedes the
    // child_changed on its parent.
    jobs.sort_by(|a, b| b.event.path.depth().cmp(&a.event.path.depth()));
    dispatcher.enqueue(jobs);
    Ok(())
}

/// Feeds every straddled index the record updates under its pattern,
/// deepest index paths first.
async fn update_indexes(
    indexes: &IndexManager,
    record: &MutationRecord,
    wait: bool,
) -> Result<()> {
    let straddling = indexes.straddling(&record.path);
    if straddling.is_empty() {
        return Ok(());
    }
    for index in straddling {
        let pattern = index.spec().record_pattern();
        for (trail, old, new) in expand(record, &pattern) {
            if compare_values(old.as_ref(), new.as_ref()).is_identical() {
                continue;
            }
            let target = trail
                .iter()
                .fold(record.top_path.clone(), |p, k| p.push_key(k));
            if wait {
                index.handle_record_update(&target, old.as_ref(), new.as_ref()).await?;
            } else {
                let index = index.clone();
                tokio::spawn(async move {
                    if let Err(error) = index
                        .handle_record_update(&target, old.as_ref(), new.as_ref())
                        .await
                    {
                        tracing::warn!(
                            index = index.spec().description(),
                            path = %target,
                            %error,
                            "Detached index update failed"
                        );
                    }
                });
            }
        }
    }
    Ok(())
}

/// Computes the events one subscriber receives for a mutation.
fn events_for(sub: &RelevantSubscription, record: &MutationRecord) -> Vec<DataEvent> {
    // Notify subscribers never force a pre-image; one loaded for somebody
    // else may also be too shallow to serve them.
    if sub.event_type.is_notify()
        && (!record.preimage_loaded || sub.data_path.depth() < record.top_path.depth())
    {
        return notify_fallback(sub, record);
    }
    if !record.preimage_loaded {
        // A value-carrying subscriber without a pre-image cannot be served;
        // the engine prevents this by loading the pre-image for them.
        tracing::warn!(pattern = %sub.pattern, "No pre-image for value subscriber");
        return Vec::new();
    }

    let notify = sub.event_type.is_notify();
    let mut events = Vec::new();
    match sub.event_type.base() {
        EventType::Value => {
            for (trail, old, new) in expand(record, &sub.data_path) {
                if compare_values(old.as_ref(), new.as_ref()).is_identical() {
                    continue;
                }
                events.push(make_event(sub, record, concrete(record, &trail), old, new, notify));
            }
        }
        EventType::ChildAdded | EventType::ChildRemoved | EventType::ChildChanged => {
            for (trail, old, new) in expand(record, &sub.data_path) {
                let fire = match sub.event_type.base() {
                    EventType::ChildAdded => old.is_none() && new.is_some(),
                    EventType::ChildRemoved => old.is_some() && new.is_none(),
                    _ => {
                        old.is_some()
                            && new.is_some()
                            && !compare_values(old.as_ref(), new.as_ref()).is_identical()
                    }
                };
                if fire {
                    events.push(make_event(sub, record, concrete(record, &trail), old, new, notify));
                }
            }
        }
        EventType::Mutated | EventType::Mutations => {
            for (trail, old, new) in expand(record, &sub.event_path) {
                let mut entries = Vec::new();
                let mut prefix = Vec::new();
                leaf_changes(old.as_ref(), new.as_ref(), &mut prefix, &mut entries);
                if entries.is_empty() {
                    continue;
                }
                let instance = concrete(record, &trail);
                if sub.event_type.base() == EventType::Mutated {
                    for entry in entries {
                        let path = entry
                            .target
                            .iter()
                            .fold(instance.clone(), |p, k| p.push_key(k));
                        let (prev, val) = if notify {
                            (None, None)
                        } else {
                            (entry.prev, entry.val)
                        };
                        events.push(DataEvent {
                            event_type: sub.event_type,
                            path,
                            subscription_path: sub.pattern.clone(),
                            previous: prev,
                            value: val,
                            mutations: Vec::new(),
                            context: record.context.clone(),
                        });
                    }
                } else {
                    let entries = if notify {
                        entries
                            .into_iter()
                            .map(|e| MutationEntry {
                                target: e.target,
                                prev: None,
                                val: None,
                            })
                            .collect()
                    } else {
                        entries
                    };
                    events.push(DataEvent {
                        event_type: sub.event_type,
                        path: instance,
                        subscription_path: sub.pattern.clone(),
                        previous: None,
                        value: None,
                        mutations: entries,
                        context: record.context.clone(),
                    });
                }
            }
        }
        _ => {}
    }
    events
}

fn make_event(
    sub: &RelevantSubscription,
    record: &MutationRecord,
    path: PathBuf,
    old: Option<Value>,
    new: Option<Value>,
    notify: bool,
) -> DataEvent {
    DataEvent {
        event_type: sub.event_type,
        path,
        subscription_path: sub.pattern.clone(),
        previous: if notify { None } else { old },
        value: if notify { None } else { new },
        mutations: Vec::new(),
        context: record.context.clone(),
    }
}

/// Notify events computed from record-level facts when no pre-image was
/// loaded.
fn notify_fallback(sub: &RelevantSubscription, record: &MutationRecord) -> Vec<DataEvent> {
    let p = &record.path;
    let event = |event_type: EventType, path: PathBuf, mutations: Vec<MutationEntry>| DataEvent {
        event_type,
        path,
        subscription_path: sub.pattern.clone(),
        previous: None,
        value: None,
        mutations,
        context: record.context.clone(),
    };
    match sub.event_type.base() {
        EventType::Value => {
            if sub.event_path.has_wildcards() {
                return Vec::new();
            }
            vec![event(sub.event_type, sub.event_path.clone(), Vec::new())]
        }
        EventType::Mutated => {
            if sub.event_path.depth() > p.depth() {
                return Vec::new();
            }
            vec![event(sub.event_type, p.clone(), Vec::new())]
        }
        EventType::Mutations => {
            if sub.event_path.has_wildcards() {
                return Vec::new();
            }
            let target = keys_below(&sub.event_path, p);
            vec![event(
                sub.event_type,
                sub.event_path.clone(),
                vec![MutationEntry {
                    target,
                    prev: None,
                    val: None,
                }],
            )]
        }
        EventType::ChildAdded | EventType::ChildRemoved | EventType::ChildChanged => {
            let wanted = sub.event_type.base();
            let mut events = Vec::new();
            if sub.event_path.depth() < p.depth() {
                if sub.event_path.has_wildcards() {
                    return Vec::new();
                }
                let child = truncate_to(p, sub.event_path.depth() + 1);
                let kind = if child.as_str() == p.as_str() {
                    match (record.effect.existed_before, record.effect.exists_now) {
                        (false, true) => Some(EventType::ChildAdded),
                        (true, false) => Some(EventType::ChildRemoved),
                        (true, true) => Some(EventType::ChildChanged),
                        (false, false) => None,
                    }
                } else if record
                    .effect
                    .created_ancestors
                    .iter()
                    .any(|a| a.as_str() == child.as_str())
                {
                    Some(EventType::ChildAdded)
                } else {
                    Some(EventType::ChildChanged)
                };
                if kind == Some(wanted) {
                    events.push(event(sub.event_type, child, Vec::new()));
                }
            } else if sub.event_path.depth() == p.depth() {
                for op in &record.effect.child_ops {
                    let kind = match op.kind {
                        ChildOpKind::Insert => EventType::ChildAdded,
                        ChildOpKind::Update => EventType::ChildChanged,
                        ChildOpKind::Delete => EventType::ChildRemoved,
                    };
                    if kind == wanted {
                        events.push(event(sub.event_type, p.clone().push_key(&op.key), Vec::new()));
                    }
                }
            }
            events
        }
        _ => Vec::new(),
    }
}

/// The concrete path of a trail below the top event path.
fn concrete(record: &MutationRecord, trail: &[OwnedKey]) -> PathBuf {
    trail
        .iter()
        .fold(record.top_path.clone(), |p, k| p.push_key(k))
}

/// The concrete keys of `deeper` below `base`.
fn keys_below(base: &Path, deeper: &Path) -> Vec<OwnedKey> {
    deeper
        .keys()
        .skip(base.depth())
        .filter_map(|k| k.to_owned_key())
        .collect()
}

/// The first `depth` keys of a concrete path.
fn truncate_to(path: &Path, depth: usize) -> PathBuf {
    path.keys()
        .take(depth)
        .filter_map(|k| k.to_owned_key())
        .fold(PathBuf::root(), |p, k| p.push_key(&k))
}

/// Expands a (possibly wildcarded) pattern below the top event path against
/// the keys present in the old or new image, yielding each concrete trail
/// with its values on both sides.
fn expand(record: &MutationRecord, pattern: &Path) -> Vec<(Vec<OwnedKey>, Option<Value>, Option<Value>)> {
    let pattern_keys: Vec<Key> = pattern.keys().collect();
    let start = record.top_path.depth();
    if pattern_keys.len() < start {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut trail = Vec::new();
    descend(
        &pattern_keys[start..],
        record.previous.as_ref(),
        record.value.as_ref(),
        &mut trail,
        &mut out,
    );
    out
}

fn descend(
    keys: &[Key<'_>],
    old: Option<&Value>,
    new: Option<&Value>,
    trail: &mut Vec<OwnedKey>,
    out: &mut Vec<(Vec<OwnedKey>, Option<Value>, Option<Value>)>,
) {
    let Some((key, rest)) = keys.split_first() else {
        out.push((trail.clone(), old.cloned(), new.cloned()));
        return;
    };
    if key.is_wildcard() {
        let mut children: BTreeSet<OwnedKey> = BTreeSet::new();
        if let Some(old) = old {
            children.extend(old.child_keys());
        }
        if let Some(new) = new {
            children.extend(new.child_keys());
        }
        for child in children {
            trail.push(child.clone());
            descend(
                rest,
                old.and_then(|v| v.child(&child)),
                new.and_then(|v| v.child(&child)),
                trail,
                out,
            );
            trail.pop();
        }
    } else {
        let child = key.to_owned_key().expect("concrete key");
        trail.push(child.clone());
        descend(
            rest,
            old.and_then(|v| v.child(&child)),
            new.and_then(|v| v.child(&child)),
            trail,
            out,
        );
        trail.pop();
    }
}

/// Enumerates leaf-level changes between two images, treating arrays as
/// atomic: one entry on the array itself rather than per element.
fn leaf_changes(
    old: Option<&Value>,
    new: Option<&Value>,
    prefix: &mut Vec<OwnedKey>,
    out: &mut Vec<MutationEntry>,
) {
    match compare_values(old, new) {
        ValueChange::Identical => {}
        ValueChange::Children(_)
            if matches!(old, Some(Value::Array(_))) || matches!(new, Some(Value::Array(_))) =>
        {
            out.push(MutationEntry {
                target: prefix.clone(),
                prev: old.cloned(),
                val: new.cloned(),
            });
        }
        ValueChange::Children(set) => {
            for key in set.added {
                prefix.push(key.clone());
                out.push(MutationEntry {
                    target: prefix.clone(),
                    prev: None,
                    val: old_or_new_child(new, &key),
                });
                prefix.pop();
            }
            for key in set.removed {
                prefix.push(key.clone());
                out.push(MutationEntry {
                    target: prefix.clone(),
                    prev: old_or_new_child(old, &key),
                    val: None,
                });
                prefix.pop();
            }
            for (key, _) in set.changed {
                prefix.push(key.clone());
                leaf_changes(
                    old.and_then(|v| v.child(&key)),
                    new.and_then(|v| v.child(&key)),
                    prefix,
                    out,
                );
                prefix.pop();
            }
        }
        _ => {
            out.push(MutationEntry {
                target: prefix.clone(),
                prev: old.cloned(),
                val: new.cloned(),
            });
        }
    }
}

fn old_or_new_child(side: Option<&Value>, key: &OwnedKey) -> Option<Value> {
    side.and_then(|v| v.child(key)).cloned()
}
