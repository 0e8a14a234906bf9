//! Snapshots delivered by reads and events.

use crate::path::{OwnedKey, PathBuf};
use crate::subscription::{DataEvent, MutationEntry};
use crate::value::Value;

use super::DataReference;

/// The keys of a relative path, accepting a leading index (`"[3]/title"`).
fn relative_keys(relative: &str) -> crate::Result<Vec<OwnedKey>> {
    let leading_index = relative.starts_with('[');
    let parsed = if leading_index {
        PathBuf::parse(format!("x{relative}"))?
    } else {
        PathBuf::parse(relative)?
    };
    let mut keys: Vec<OwnedKey> = parsed.keys().filter_map(|k| k.to_owned_key()).collect();
    if leading_index {
        keys.remove(0);
    }
    Ok(keys)
}

/// An immutable view of a node's value at one point in time, together with
/// the previous value when the snapshot came from an event.
#[derive(Debug, Clone)]
pub struct DataSnapshot {
    reference: DataReference,
    value: Option<Value>,
    previous: Option<Value>,
    context: Option<serde_json::Value>,
}

impl DataSnapshot {
    pub(crate) fn new(
        reference: DataReference,
        value: Option<Value>,
        previous: Option<Value>,
        context: Option<serde_json::Value>,
    ) -> Self {
        Self {
            reference,
            value,
            previous,
            context,
        }
    }

    /// Builds the snapshot for a delivered event.
    pub(crate) fn from_event(reference: DataReference, event: DataEvent) -> Self {
        Self {
            reference,
            value: event.value,
            previous: event.previous,
            context: event.context,
        }
    }

    /// The current value, if the node exists.
    pub fn val(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// The previous value, for event snapshots.
    pub fn previous(&self) -> Option<&Value> {
        self.previous.as_ref()
    }

    /// True when the node exists.
    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    /// The reference this snapshot was taken of.
    pub fn reference(&self) -> &DataReference {
        &self.reference
    }

    /// The last key of the snapshot's path.
    pub fn key(&self) -> Option<String> {
        self.reference.path().key().map(|k| k.to_string())
    }

    /// The opaque context of the write that produced this snapshot.
    pub fn context(&self) -> Option<&serde_json::Value> {
        self.context.as_ref()
    }

    /// A snapshot of a descendant, addressed by a relative path.
    pub fn child(&self, relative: impl AsRef<str>) -> crate::Result<DataSnapshot> {
        let keys = relative_keys(relative.as_ref())?;
        Ok(DataSnapshot {
            reference: self.reference.child(relative)?,
            value: self
                .value
                .as_ref()
                .and_then(|v| v.descendant(&keys))
                .cloned(),
            previous: self
                .previous
                .as_ref()
                .and_then(|v| v.descendant(&keys))
                .cloned(),
            context: self.context.clone(),
        })
    }

    /// True when a descendant exists at the relative path.
    pub fn has_child(&self, relative: impl AsRef<str>) -> bool {
        self.child(relative).map(|s| s.exists()).unwrap_or(false)
    }

    /// True when the value is a composite with at least one child.
    pub fn has_children(&self) -> bool {
        self.num_children() > 0
    }

    /// Number of direct children of the value.
    pub fn num_children(&self) -> usize {
        match &self.value {
            Some(Value::Object(map)) => map.len(),
            Some(Value::Array(vec)) => vec.len(),
            _ => 0,
        }
    }

    /// Invokes `cb` for each direct child snapshot, stopping when it
    /// returns false.
    pub fn for_each(&self, mut cb: impl FnMut(DataSnapshot) -> bool) {
        let Some(value) = &self.value else {
            return;
        };
        for key in value.child_keys() {
            let Ok(reference) = self.reference.child(key.to_string()) else {
                continue;
            };
            let child = DataSnapshot {
                reference,
                value: value.child(&key).cloned(),
                previous: self.previous.as_ref().and_then(|p| p.child(&key)).cloned(),
                context: self.context.clone(),
            };
            if !cb(child) {
                return;
            }
        }
    }
}

/// The snapshot type of `mutations` events: a batch of leaf-level changes.
#[derive(Debug, Clone)]
pub struct MutationsDataSnapshot {
    reference: DataReference,
    mutations: Vec<MutationEntry>,
    context: Option<serde_json::Value>,
}

impl MutationsDataSnapshot {
    pub(crate) fn from_event(reference: DataReference, event: DataEvent) -> Self {
        Self {
            reference,
            mutations: event.mutations,
            context: event.context,
        }
    }

    /// The batched mutations as a value:
    /// `[{target: [keys], prev, val}, ...]`.
    pub fn val(&self) -> Value {
        Value::Array(
            self.mutations
                .iter()
                .map(|m| {
                    Value::object([
                        (
                            "target",
                            Value::Array(
                                m.target.iter().map(|k| Value::Text(k.to_string())).collect(),
                            ),
                        ),
                        ("prev", m.prev.clone().unwrap_or(Value::Null)),
                        ("val", m.val.clone().unwrap_or(Value::Null)),
                    ])
                })
                .collect(),
        )
    }

    /// The raw mutation entries.
    pub fn mutations(&self) -> &[MutationEntry] {
        &self.mutations
    }

    /// The reference the mutations were observed on.
    pub fn reference(&self) -> &DataReference {
        &self.reference
    }

    /// The opaque context of the triggering write.
    pub fn context(&self) -> Option<&serde_json::Value> {
        self.context.as_ref()
    }

    /// A per-mutation snapshot by ordinal.
    pub fn child(&self, index: usize) -> Option<DataSnapshot> {
        let entry = self.mutations.get(index)?;
        let mut reference = self.reference.clone();
        for key in &entry.target {
            reference = reference.child(key.to_string()).ok()?;
        }
        Some(DataSnapshot::new(
            reference,
            entry.val.clone(),
            entry.prev.clone(),
            self.context.clone(),
        ))
    }

    /// Invokes `cb` for each mutation as an individual snapshot, stopping
    /// when it returns false.
    pub fn for_each(&self, mut cb: impl FnMut(DataSnapshot) -> bool) {
        for index in 0..self.mutations.len() {
            let Some(snapshot) = self.child(index) else {
                continue;
            };
            if !cb(snapshot) {
                return;
            }
        }
    }
}
