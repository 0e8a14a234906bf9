//! Subscription registry and event streams.
//!
//! Subscribers register an event type on a path pattern and receive
//! [`DataEvent`]s through a bounded channel wrapped in an [`EventStream`].
//! The registry answers two queries for the engine: which subscribers force
//! a pre-image load for a mutation (`value_subscribers_for`), and the full
//! set of subscribers a mutation may concern (`all_subscribers_for`),
//! together with the concrete event path and the deepest data path each one
//! needs.
//!
//! Delivery never happens inline with a mutation; the event dispatcher sends
//! from its own task, and a subscriber that went away is unregistered on the
//! next failed send.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::path::{OwnedKey, Path, PathBuf};
use crate::value::Value;

/// The event types a subscriber can register for.
///
/// Each value-carrying type has a `Notify*` variant that delivers a path
/// reference but no value payload, letting the engine skip pre-image loads
/// when nothing else demands them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// The value at the subscribed path changed.
    Value,
    /// A direct child appeared under the subscribed path.
    ChildAdded,
    /// A direct child's value changed.
    ChildChanged,
    /// A direct child disappeared.
    ChildRemoved,
    /// One event per changed leaf under the subscribed path.
    Mutated,
    /// One batched event per write, listing all changed leaves.
    Mutations,
    /// Notify-only variant of [`EventType::Value`].
    NotifyValue,
    /// Notify-only variant of [`EventType::ChildAdded`].
    NotifyChildAdded,
    /// Notify-only variant of [`EventType::ChildChanged`].
    NotifyChildChanged,
    /// Notify-only variant of [`EventType::ChildRemoved`].
    NotifyChildRemoved,
    /// Notify-only variant of [`EventType::Mutated`].
    NotifyMutated,
    /// Notify-only variant of [`EventType::Mutations`].
    NotifyMutations,
}

impl EventType {
    /// True for the notify-only variants.
    pub fn is_notify(self) -> bool {
        matches!(
            self,
            EventType::NotifyValue
                | EventType::NotifyChildAdded
                | EventType::NotifyChildChanged
                | EventType::NotifyChildRemoved
                | EventType::NotifyMutated
                | EventType::NotifyMutations
        )
    }

    /// The value-carrying counterpart of a notify variant; identity for the
    /// value-carrying types themselves.
    pub fn base(self) -> EventType {
        match self {
            EventType::NotifyValue => EventType::Value,
            EventType::NotifyChildAdded => EventType::ChildAdded,
            EventType::NotifyChildChanged => EventType::ChildChanged,
            EventType::NotifyChildRemoved => EventType::ChildRemoved,
            EventType::NotifyMutated => EventType::Mutated,
            EventType::NotifyMutations => EventType::Mutations,
            other => other,
        }
    }

    /// The event name as used in the public API.
    pub fn name(self) -> &'static str {
        match self {
            EventType::Value => "value",
            EventType::ChildAdded => "child_added",
            EventType::ChildChanged => "child_changed",
            EventType::ChildRemoved => "child_removed",
            EventType::Mutated => "mutated",
            EventType::Mutations => "mutations",
            EventType::NotifyValue => "notify_value",
            EventType::NotifyChildAdded => "notify_child_added",
            EventType::NotifyChildChanged => "notify_child_changed",
            EventType::NotifyChildRemoved => "notify_child_removed",
            EventType::NotifyMutated => "notify_mutated",
            EventType::NotifyMutations => "notify_mutations",
        }
    }

    /// Parses an event name as used in the public API.
    pub fn parse(name: &str) -> Option<EventType> {
        Some(match name {
            "value" => EventType::Value,
            "child_added" => EventType::ChildAdded,
            "child_changed" => EventType::ChildChanged,
            "child_removed" => EventType::ChildRemoved,
            "mutated" => EventType::Mutated,
            "mutations" => EventType::Mutations,
            "notify_value" => EventType::NotifyValue,
            "notify_child_added" => EventType::NotifyChildAdded,
            "notify_child_changed" => EventType::NotifyChildChanged,
            "notify_child_removed" => EventType::NotifyChildRemoved,
            "notify_mutated" => EventType::NotifyMutated,
            "notify_mutations" => EventType::NotifyMutations,
            _ => return None,
        })
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One leaf-level mutation inside a batched `mutations` event.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEntry {
    /// Key trail from the subscribed path to the mutated node.
    pub target: Vec<OwnedKey>,
    /// The value before the write, if any.
    pub prev: Option<Value>,
    /// The value after the write, if any.
    pub val: Option<Value>,
}

/// An event delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct DataEvent {
    /// The type of event that fired.
    pub event_type: EventType,
    /// The concrete path the event applies to (the child path for child
    /// events).
    pub path: PathBuf,
    /// The pattern the subscription was registered on.
    pub subscription_path: PathBuf,
    /// The value before the write. `None` for notify variants and added
    /// nodes.
    pub previous: Option<Value>,
    /// The value after the write. `None` for notify variants and removed
    /// nodes.
    pub value: Option<Value>,
    /// Batched leaf mutations; only populated for `mutations` events.
    pub mutations: Vec<MutationEntry>,
    /// The opaque context the triggering write carried.
    pub context: Option<serde_json::Value>,
}

/// A subscriber relevant to a specific mutation, with the concrete paths it
/// needs.
#[derive(Debug, Clone)]
pub struct RelevantSubscription {
    /// Registry id of the subscription.
    pub id: u64,
    /// The registered pattern.
    pub pattern: PathBuf,
    /// The registered event type.
    pub event_type: EventType,
    /// The pattern with wildcards filled from the mutation path where
    /// possible; keys deeper than the mutation path keep their wildcards.
    pub event_path: PathBuf,
    /// The deepest path whose data the subscriber needs. May contain
    /// wildcards that the dispatcher expands against the actual data.
    pub data_path: PathBuf,
}

struct Subscription {
    id: u64,
    pattern: PathBuf,
    event_type: EventType,
    sender: mpsc::Sender<DataEvent>,
    created: std::time::Instant,
}

struct RegistryInner {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

/// The process-wide subscription registry of one database.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    /// Creates a registry whose subscriber queues hold `queue_capacity`
    /// undelivered events each.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                subscriptions: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                queue_capacity,
            }),
        }
    }

    /// Registers a subscription and returns the stream its events arrive on.
    pub fn subscribe(
        &self,
        pattern: impl AsRef<Path>,
        event_type: EventType,
    ) -> EventStream<DataEvent> {
        let pattern = pattern.as_ref().to_path_buf();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.queue_capacity);
        {
            let mut subscriptions = self
                .inner
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            subscriptions.push(Subscription {
                id,
                pattern: pattern.clone(),
                event_type,
                sender,
                created: std::time::Instant::now(),
            });
        }
        tracing::debug!(pattern = %pattern, event = %event_type, id, "Subscription added");
        let registry = Arc::downgrade(&self.inner);
        EventStream::new(
            receiver,
            Box::new(move || {
                if let Some(inner) = registry.upgrade() {
                    SubscriptionRegistry { inner }.unsubscribe(id);
                }
            }),
        )
    }

    /// Removes a subscription by id.
    pub fn unsubscribe(&self, id: u64) {
        let mut subscriptions = self
            .inner
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned");
        subscriptions.retain(|s| s.id != id);
    }

    /// Removes all subscriptions of an event type on an exact pattern.
    /// With `event_type` `None`, removes every subscription on the pattern.
    pub fn unsubscribe_all(&self, pattern: &Path, event_type: Option<EventType>) {
        let mut subscriptions = self
            .inner
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned");
        subscriptions
            .retain(|s| s.pattern.as_str() != pattern.as_str() || event_type.is_some_and(|t| t != s.event_type));
    }

    /// Number of live subscriptions.
    pub fn count(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .len()
    }

    /// Subscribers whose contract requires the engine to load previous data
    /// for a mutation at `path`. Notify variants are excluded.
    pub fn value_subscribers_for(&self, path: &Path) -> Vec<RelevantSubscription> {
        self.relevant(path, |s| !s.event_type.is_notify())
    }

    /// Every subscriber on the same trail as `path`, including notify
    /// variants.
    pub fn all_subscribers_for(&self, path: &Path) -> Vec<RelevantSubscription> {
        self.relevant(path, |_| true)
    }

    fn relevant(
        &self,
        path: &Path,
        filter: impl Fn(&Subscription) -> bool,
    ) -> Vec<RelevantSubscription> {
        let subscriptions = self
            .inner
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned");
        let mut relevant: Vec<RelevantSubscription> = subscriptions
            .iter()
            .filter(|s| filter(s) && s.pattern.is_on_trail_of(path))
            .map(|s| {
                let event_path = fill_pattern_from(&s.pattern, path);
                let data_path = data_path_for(s.event_type, &event_path, path);
                RelevantSubscription {
                    id: s.id,
                    pattern: s.pattern.clone(),
                    event_type: s.event_type,
                    event_path,
                    data_path,
                }
            })
            .collect();
        // Oldest subscriptions first, for deterministic dispatch order among
        // equal depths.
        relevant.sort_by_key(|r| {
            subscriptions
                .iter()
                .find(|s| s.id == r.id)
                .map(|s| s.created)
                .expect("subscription present")
        });
        relevant
    }

    /// Sends an event to a subscriber, waiting while its queue is full.
    /// Returns false and unregisters the subscription when the receiving
    /// stream is gone.
    pub async fn deliver(&self, id: u64, event: DataEvent) -> bool {
        let sender = {
            let subscriptions = self
                .inner
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            subscriptions
                .iter()
                .find(|s| s.id == id)
                .map(|s| s.sender.clone())
        };
        let Some(sender) = sender else {
            return false;
        };
        if sender.send(event).await.is_err() {
            tracing::debug!(id, "Subscriber went away, unregistering");
            self.unsubscribe(id);
            return false;
        }
        true
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.count())
            .finish()
    }
}

/// Fills the wildcards of `pattern` with keys of `concrete` at the same
/// positions; keys beyond `concrete`'s depth keep their wildcards.
fn fill_pattern_from(pattern: &Path, concrete: &Path) -> PathBuf {
    let concrete_keys: Vec<_> = concrete.keys().collect();
    let mut filled = PathBuf::root();
    for (position, key) in pattern.keys().enumerate() {
        let effective = if key.is_wildcard() {
            match concrete_keys.get(position) {
                Some(concrete_key) if !concrete_key.is_wildcard() => *concrete_key,
                _ => key,
            }
        } else {
            key
        };
        filled = match effective.to_owned_key() {
            Some(owned) => filled.push_key(&owned),
            None => filled.push_any(),
        };
    }
    filled
}

/// The deepest path whose data a subscriber of `event_type` needs for a
/// mutation at `mutation_path`.
fn data_path_for(event_type: EventType, event_path: &Path, mutation_path: &Path) -> PathBuf {
    match event_type.base() {
        EventType::ChildAdded | EventType::ChildChanged | EventType::ChildRemoved => {
            if event_path.depth() < mutation_path.depth() {
                truncate(mutation_path, event_path.depth() + 1)
            } else {
                // The mutation happened at or above the subscribed path;
                // affected children are found by expanding a wildcard.
                event_path.to_path_buf().push_any()
            }
        }
        _ => event_path.to_path_buf(),
    }
}

/// The first `depth` keys of a concrete path.
fn truncate(path: &Path, depth: usize) -> PathBuf {
    let mut truncated = PathBuf::root();
    for key in path.keys().take(depth) {
        truncated = match key.to_owned_key() {
            Some(owned) => truncated.push_key(&owned),
            None => truncated.push_any(),
        };
    }
    truncated
}

/// A stream of events for one subscription.
///
/// Dropping the stream or calling [`EventStream::stop`] unregisters the
/// subscription and releases its queue.
pub struct EventStream<T> {
    receiver: mpsc::Receiver<T>,
    on_stop: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> EventStream<T> {
    pub(crate) fn new(receiver: mpsc::Receiver<T>, on_stop: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            receiver,
            on_stop: Some(on_stop),
        }
    }

    /// Waits for the next event. Returns `None` once the stream is stopped
    /// and drained.
    pub async fn next(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Returns an already-queued event without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Unregisters the subscription. Queued events can still be drained.
    pub fn stop(&mut self) {
        if let Some(on_stop) = self.on_stop.take() {
            on_stop();
        }
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T> std::fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}
