//! Structural comparison of node values.
//!
//! [`compare_values`] computes the change between an old and a new value.
//! Composite values report per-key change sets; everything else collapses to
//! added/removed/changed. The event dispatcher walks these results to decide
//! which subscribers fire, and the storage engine uses them to route record
//! updates to indexes.

use crate::path::OwnedKey;

use super::Value;

/// The change between two versions of a node value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueChange {
    /// Both sides are structurally equal.
    Identical,
    /// The node did not exist before.
    Added,
    /// The node no longer exists.
    Removed,
    /// A leaf value changed, or the value kind changed.
    Changed,
    /// A composite changed in some of its children.
    Children(ChangeSet),
}

impl ValueChange {
    /// Returns true if nothing changed.
    pub fn is_identical(&self) -> bool {
        matches!(self, ValueChange::Identical)
    }
}

/// Per-key changes of a composite value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeSet {
    /// Keys present only on the new side.
    pub added: Vec<OwnedKey>,
    /// Keys present only on the old side.
    pub removed: Vec<OwnedKey>,
    /// Keys present on both sides with different values.
    pub changed: Vec<(OwnedKey, ValueChange)>,
}

impl ChangeSet {
    /// Returns true if no keys changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// All keys touched by this change set.
    pub fn touched_keys(&self) -> impl Iterator<Item = &OwnedKey> {
        self.added
            .iter()
            .chain(self.removed.iter())
            .chain(self.changed.iter().map(|(k, _)| k))
    }
}

/// Compares two optional values structurally.
///
/// Binary values compare byte-wise and datetimes by their millisecond value.
pub fn compare_values(old: Option<&Value>, new: Option<&Value>) -> ValueChange {
    match (old, new) {
        (None, None) => ValueChange::Identical,
        (None, Some(_)) => ValueChange::Added,
        (Some(_), None) => ValueChange::Removed,
        (Some(old), Some(new)) => compare_existing(old, new),
    }
}

fn compare_existing(old: &Value, new: &Value) -> ValueChange {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut set = ChangeSet::default();
            for (key, old_child) in old_map {
                match new_map.get(key) {
                    None => set.removed.push(OwnedKey::Name(key.clone())),
                    Some(new_child) => {
                        let change = compare_existing(old_child, new_child);
                        if !change.is_identical() {
                            set.changed.push((OwnedKey::Name(key.clone()), change));
                        }
                    }
                }
            }
            for key in new_map.keys() {
                if !old_map.contains_key(key) {
                    set.added.push(OwnedKey::Name(key.clone()));
                }
            }
            if set.is_empty() {
                ValueChange::Identical
            } else {
                ValueChange::Children(set)
            }
        }
        (Value::Array(old_vec), Value::Array(new_vec)) => {
            let mut set = ChangeSet::default();
            for (index, old_element) in old_vec.iter().enumerate() {
                match new_vec.get(index) {
                    None => set.removed.push(OwnedKey::Index(index)),
                    Some(new_element) => {
                        let change = compare_existing(old_element, new_element);
                        if !change.is_identical() {
                            set.changed.push((OwnedKey::Index(index), change));
                        }
                    }
                }
            }
            for index in old_vec.len()..new_vec.len() {
                set.added.push(OwnedKey::Index(index));
            }
            if set.is_empty() {
                ValueChange::Identical
            } else {
                ValueChange::Children(set)
            }
        }
        (old, new) if values_equal(old, new) => ValueChange::Identical,
        _ => ValueChange::Changed,
    }
}

/// Leaf equality: byte-wise for binary, millisecond for datetimes, bitwise
/// for numbers.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.to_bits() == y.to_bits(),
        (Value::Binary(x), Value::Binary(y)) => x == y,
        (Value::DateTime(x), Value::DateTime(y)) => x == y,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_changes() {
        assert_eq!(compare_values(None, None), ValueChange::Identical);
        assert_eq!(
            compare_values(None, Some(&Value::Number(1.0))),
            ValueChange::Added
        );
        assert_eq!(
            compare_values(Some(&Value::Number(1.0)), None),
            ValueChange::Removed
        );
        assert_eq!(
            compare_values(Some(&Value::Number(1.0)), Some(&Value::Number(2.0))),
            ValueChange::Changed
        );
        assert_eq!(
            compare_values(Some(&Value::Number(1.0)), Some(&Value::Number(1.0))),
            ValueChange::Identical
        );
    }

    #[test]
    fn test_kind_change_is_changed() {
        assert_eq!(
            compare_values(Some(&Value::Number(1.0)), Some(&Value::Text("1".into()))),
            ValueChange::Changed
        );
    }

    #[test]
    fn test_object_change_set() {
        let old = Value::object([("a", 1), ("b", 2), ("c", 3)]);
        let new = Value::object([("a", 1), ("b", 20), ("d", 4)]);
        let ValueChange::Children(set) = compare_values(Some(&old), Some(&new)) else {
            panic!("expected child changes");
        };
        assert_eq!(set.added, vec![OwnedKey::Name("d".into())]);
        assert_eq!(set.removed, vec![OwnedKey::Name("c".into())]);
        assert_eq!(set.changed.len(), 1);
        assert_eq!(set.changed[0].0, OwnedKey::Name("b".into()));
    }

    #[test]
    fn test_array_change_set() {
        let old = Value::array([1, 2, 3]);
        let new = Value::array([1, 5]);
        let ValueChange::Children(set) = compare_values(Some(&old), Some(&new)) else {
            panic!("expected child changes");
        };
        assert_eq!(set.removed, vec![OwnedKey::Index(2)]);
        assert_eq!(set.changed.len(), 1);
        assert_eq!(set.changed[0].0, OwnedKey::Index(1));
    }

    #[test]
    fn test_binary_and_datetime_equality() {
        assert!(compare_values(
            Some(&Value::Binary(vec![1, 2])),
            Some(&Value::Binary(vec![1, 2]))
        )
        .is_identical());
        assert_eq!(
            compare_values(
                Some(&Value::Binary(vec![1, 2])),
                Some(&Value::Binary(vec![1, 3]))
            ),
            ValueChange::Changed
        );
        assert!(compare_values(
            Some(&Value::DateTime(1000)),
            Some(&Value::DateTime(1000))
        )
        .is_identical());
    }

    #[test]
    fn test_nested_changes() {
        let old = Value::object([("user", Value::object([("age", 29)]))]);
        let new = Value::object([("user", Value::object([("age", 30)]))]);
        let ValueChange::Children(set) = compare_values(Some(&old), Some(&new)) else {
            panic!("expected child changes");
        };
        let (key, nested) = &set.changed[0];
        assert_eq!(key, &OwnedKey::Name("user".into()));
        assert!(matches!(nested, ValueChange::Children(_)));
    }
}
