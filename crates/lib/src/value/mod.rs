//! Node value types.
//!
//! This module provides the [`Value`] enum representing every value that can
//! be stored at a node, the [`ValueKind`] wire codes, and the inline-size
//! classification used by the storage engine to decide whether a child lives
//! inside its parent's record or in a dedicated record of its own.
//!
//! # Value kinds
//!
//! ## Leaf values
//! - [`Value::Number`] - 64-bit floating point numbers
//! - [`Value::Bool`] - booleans
//! - [`Value::Text`] - UTF-8 strings
//! - [`Value::DateTime`] - instants, millisecond precision
//! - [`Value::Binary`] - raw byte strings
//! - [`Value::Reference`] - a path pointing at another node
//!
//! ## Composite values
//! - [`Value::Object`] - unordered string-keyed maps
//! - [`Value::Array`] - ordered dense sequences
//!
//! ## Write-time marker
//! - [`Value::Null`] - marks a deletion in write payloads; never stored

pub mod codec;
pub mod compare;
mod errors;

use std::collections::BTreeMap;
use std::fmt;

pub use compare::{ChangeSet, ValueChange, compare_values};
pub use errors::ValueError;

use crate::path::{OwnedKey, PathBuf};

/// The wire type codes of storable values.
///
/// Codes are stable across versions; backends persist them as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ValueKind {
    /// String-keyed map of child nodes.
    Object,
    /// Ordered dense sequence of child nodes.
    Array,
    /// 64-bit floating point number.
    Number,
    /// Boolean.
    Boolean,
    /// UTF-8 string.
    String,
    /// Instant with millisecond precision.
    DateTime,
    /// Raw byte string.
    Binary,
    /// Path of another node.
    Reference,
}

impl ValueKind {
    /// Returns the stable wire code, 1..=8.
    pub fn code(self) -> u8 {
        match self {
            ValueKind::Object => 1,
            ValueKind::Array => 2,
            ValueKind::Number => 3,
            ValueKind::Boolean => 4,
            ValueKind::String => 5,
            ValueKind::DateTime => 6,
            ValueKind::Binary => 7,
            ValueKind::Reference => 8,
        }
    }

    /// Looks up a kind by its wire code.
    pub fn from_code(code: u8) -> Result<Self, ValueError> {
        Ok(match code {
            1 => ValueKind::Object,
            2 => ValueKind::Array,
            3 => ValueKind::Number,
            4 => ValueKind::Boolean,
            5 => ValueKind::String,
            6 => ValueKind::DateTime,
            7 => ValueKind::Binary,
            8 => ValueKind::Reference,
            code => return Err(ValueError::UnknownTypeCode { code }),
        })
    }

    /// Returns true for object and array kinds.
    pub fn is_composite(self) -> bool {
        matches!(self, ValueKind::Object | ValueKind::Array)
    }

    /// Returns the kind name as used in reflection output.
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Object => "object",
            ValueKind::Array => "array",
            ValueKind::Number => "number",
            ValueKind::Boolean => "boolean",
            ValueKind::String => "string",
            ValueKind::DateTime => "datetime",
            ValueKind::Binary => "binary",
            ValueKind::Reference => "reference",
        }
    }
}

impl From<ValueKind> for u8 {
    fn from(kind: ValueKind) -> u8 {
        kind.code()
    }
}

impl TryFrom<u8> for ValueKind {
    type Error = ValueError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        ValueKind::from_code(code)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A value stored at (or written to) a node.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Deletion marker in write payloads; never stored.
    #[default]
    Null,
    /// String-keyed map of child values.
    Object(BTreeMap<String, Value>),
    /// Ordered dense sequence of child values.
    Array(Vec<Value>),
    /// 64-bit floating point number.
    Number(f64),
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    Text(String),
    /// Instant, milliseconds since the Unix epoch.
    DateTime(i64),
    /// Raw byte string.
    Binary(Vec<u8>),
    /// Path of another node. References are stored as plain paths and never
    /// participate in ownership.
    Reference(PathBuf),
}

impl Value {
    /// Creates an object value from key/value pairs.
    pub fn object<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Creates an array value from elements.
    pub fn array<V, I>(elements: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Value::Array(elements.into_iter().map(Into::into).collect())
    }

    /// Returns the storable kind of this value, or `None` for [`Value::Null`].
    pub fn kind(&self) -> Option<ValueKind> {
        Some(match self {
            Value::Null => return None,
            Value::Object(_) => ValueKind::Object,
            Value::Array(_) => ValueKind::Array,
            Value::Number(_) => ValueKind::Number,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Text(_) => ValueKind::String,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::Binary(_) => ValueKind::Binary,
            Value::Reference(_) => ValueKind::Reference,
        })
    }

    /// Returns the kind name, with `"null"` for the deletion marker.
    pub fn type_name(&self) -> &'static str {
        self.kind().map(ValueKind::name).unwrap_or("null")
    }

    /// Returns true for the deletion marker.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns true for objects and arrays.
    pub fn is_composite(&self) -> bool {
        matches!(self, Value::Object(_) | Value::Array(_))
    }

    /// Returns true for a composite with no children.
    pub fn is_empty_composite(&self) -> bool {
        match self {
            Value::Object(map) => map.is_empty(),
            Value::Array(vec) => vec.is_empty(),
            _ => false,
        }
    }

    /// Attempts to view this value as an object map.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Attempts to view this value as a mutable object map.
    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Attempts to view this value as an array.
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(vec) => Some(vec),
            _ => None,
        }
    }

    /// Attempts to view this value as a mutable array.
    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(vec) => Some(vec),
            _ => None,
        }
    }

    /// Attempts to convert to a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Attempts to convert to a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Attempts to convert to a string slice.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Attempts to convert to an epoch-milliseconds instant.
    pub fn as_datetime(&self) -> Option<i64> {
        match self {
            Value::DateTime(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Attempts to view this value as raw bytes.
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Attempts to view this value as a path reference.
    pub fn as_reference(&self) -> Option<&crate::path::Path> {
        match self {
            Value::Reference(path) => Some(path),
            _ => None,
        }
    }

    /// Returns the direct child at `key`, if any.
    pub fn child(&self, key: &OwnedKey) -> Option<&Value> {
        match (self, key) {
            (Value::Object(map), OwnedKey::Name(name)) => map.get(name),
            (Value::Array(vec), OwnedKey::Index(index)) => vec.get(*index),
            _ => None,
        }
    }

    /// Returns the value at a relative key trail below this value.
    pub fn descendant(&self, keys: &[OwnedKey]) -> Option<&Value> {
        let mut current = self;
        for key in keys {
            current = current.child(key)?;
        }
        Some(current)
    }

    /// Returns the direct child keys of a composite, in deterministic order.
    pub fn child_keys(&self) -> Vec<OwnedKey> {
        match self {
            Value::Object(map) => map.keys().map(|k| OwnedKey::Name(k.clone())).collect(),
            Value::Array(vec) => (0..vec.len()).map(OwnedKey::Index).collect(),
            _ => Vec::new(),
        }
    }

    /// The number of bytes this value occupies when stored inline.
    pub fn serialized_size(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Object(map) if map.is_empty() => 0,
            Value::Array(vec) if vec.is_empty() => 0,
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| k.len() + v.serialized_size())
                .sum(),
            Value::Array(vec) => vec.iter().map(Value::serialized_size).sum(),
            Value::Number(_) | Value::DateTime(_) => 8,
            Value::Bool(_) => 1,
            Value::Text(s) => s.len(),
            Value::Binary(bytes) => bytes.len(),
            Value::Reference(path) => path.as_str().len(),
        }
    }

    /// Decides whether this value is small enough to live inside its
    /// parent's record.
    ///
    /// Non-empty composites never fit inline; empty composites always do.
    pub fn fits_inline(&self, max_inline_value_size: usize) -> bool {
        if self.is_composite() {
            return self.is_empty_composite();
        }
        self.serialized_size() <= max_inline_value_size
    }
}

/// Sanitizes a write payload before it reaches storage.
///
/// Null array elements are always rejected. Null object properties below the
/// top level of a full set payload are dropped when `remove_void_properties`
/// is enabled and rejected otherwise. The top level itself is the caller's
/// concern: there, null means deletion.
pub fn sanitize_payload(value: Value, remove_void_properties: bool) -> Result<Value, ValueError> {
    match value {
        Value::Object(map) => {
            let mut sanitized = BTreeMap::new();
            for (key, child) in map {
                if child.is_null() {
                    if remove_void_properties {
                        continue;
                    }
                    return Err(ValueError::VoidProperty { key });
                }
                sanitized.insert(key, sanitize_payload(child, remove_void_properties)?);
            }
            Ok(Value::Object(sanitized))
        }
        Value::Array(vec) => {
            let mut sanitized = Vec::with_capacity(vec.len());
            for (index, element) in vec.into_iter().enumerate() {
                if element.is_null() {
                    return Err(ValueError::NullArrayElement { index });
                }
                sanitized.push(sanitize_payload(element, remove_void_properties)?);
            }
            Ok(Value::Array(sanitized))
        }
        other => Ok(other),
    }
}

/// Inserts `new` at the relative key trail `keys` below `root`, creating
/// intermediate containers as needed. `None` removes the node at the trail.
///
/// Used to reconstruct post-write images from pre-images without re-reading
/// storage.
pub fn graft(root: &mut Option<Value>, keys: &[OwnedKey], new: Option<Value>) {
    let Some((first, rest)) = keys.split_first() else {
        *root = new;
        return;
    };
    if root.is_none() {
        *root = Some(match first {
            OwnedKey::Name(_) => Value::Object(BTreeMap::new()),
            OwnedKey::Index(_) => Value::Array(Vec::new()),
        });
    }
    match (root.as_mut().expect("container"), first) {
        (Value::Object(map), OwnedKey::Name(name)) => {
            if rest.is_empty() && new.is_none() {
                map.remove(name);
            } else {
                let mut slot = map.remove(name);
                graft(&mut slot, rest, new);
                if let Some(slot) = slot {
                    map.insert(name.clone(), slot);
                }
            }
        }
        (Value::Array(vec), OwnedKey::Index(index)) => {
            if rest.is_empty() && new.is_none() {
                if *index < vec.len() {
                    vec.remove(*index);
                }
            } else {
                while vec.len() <= *index {
                    vec.push(Value::Object(BTreeMap::new()));
                }
                let mut slot = Some(std::mem::take(&mut vec[*index]));
                graft(&mut slot, rest, new);
                vec[*index] = slot.unwrap_or_default();
            }
        }
        (slot, _) => {
            // A scalar in the trail is overwritten by a fresh container.
            let mut replacement = None;
            graft(&mut replacement, keys, new);
            if let Some(replacement) = replacement {
                *slot = replacement;
            }
        }
    }
}

/// Merges `updates` into `target` property-wise; null updates delete.
pub fn merge_into(target: &mut Value, updates: BTreeMap<String, Value>) {
    if !target.is_composite() {
        *target = Value::Object(BTreeMap::new());
    }
    match target {
        Value::Object(map) => {
            for (key, value) in updates {
                if value.is_null() {
                    map.remove(&key);
                } else {
                    map.insert(key, value);
                }
            }
        }
        Value::Array(vec) => {
            // Index-keyed merges on arrays; validated by the engine before
            // this point (dense, trailing removals only).
            let mut removals: Vec<usize> = Vec::new();
            for (key, value) in updates {
                let Ok(index) = key.parse::<usize>() else {
                    continue;
                };
                if value.is_null() {
                    removals.push(index);
                } else if index < vec.len() {
                    vec[index] = value;
                } else {
                    while vec.len() < index {
                        vec.push(Value::Object(BTreeMap::new()));
                    }
                    vec.push(value);
                }
            }
            removals.sort_unstable_by(|a, b| b.cmp(a));
            for index in removals {
                if index < vec.len() {
                    vec.remove(index);
                }
            }
        }
        _ => unreachable!(),
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Text(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Value {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Value {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<PathBuf> for Value {
    fn from(path: PathBuf) -> Value {
        Value::Reference(path)
    }
}

impl From<Vec<Value>> for Value {
    fn from(elements: Vec<Value>) -> Value {
        Value::Array(elements)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", codec::encode_value(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_kind_codes_round_trip() {
        for code in 1..=8u8 {
            let kind = ValueKind::from_code(code).expect("valid code");
            assert_eq!(kind.code(), code);
        }
        assert!(ValueKind::from_code(0).is_err());
        assert!(ValueKind::from_code(9).is_err());
    }

    #[test]
    fn test_fits_inline() {
        assert!(Value::Text("short".into()).fits_inline(50));
        assert!(!Value::Text("x".repeat(51)).fits_inline(50));
        assert!(Value::Number(42.0).fits_inline(50));
        assert!(Value::Bool(true).fits_inline(50));
        assert!(Value::DateTime(1_700_000_000_000).fits_inline(50));
        assert!(Value::Binary(vec![0; 50]).fits_inline(50));
        assert!(!Value::Binary(vec![0; 51]).fits_inline(50));
        // Empty composites are always inline, non-empty never.
        assert!(Value::Object(BTreeMap::new()).fits_inline(0));
        assert!(Value::Array(Vec::new()).fits_inline(0));
        assert!(!Value::object([("a", 1)]).fits_inline(1_000_000));
    }

    #[test]
    fn test_child_access() {
        let value = Value::object([("list", Value::array([1, 2, 3]))]);
        let keys = vec![OwnedKey::Name("list".into()), OwnedKey::Index(1)];
        assert_eq!(value.descendant(&keys), Some(&Value::Number(2.0)));
        assert_eq!(value.descendant(&[OwnedKey::Name("nope".into())]), None);
    }

    #[test]
    fn test_sanitize_rejects_null_array_element() {
        let value = Value::Array(vec![Value::Number(1.0), Value::Null]);
        assert!(matches!(
            sanitize_payload(value, true),
            Err(ValueError::NullArrayElement { index: 1 })
        ));
    }

    #[test]
    fn test_sanitize_void_properties() {
        let value = Value::object([("keep", Value::Number(1.0)), ("drop", Value::Null)]);
        assert!(matches!(
            sanitize_payload(value.clone(), false),
            Err(ValueError::VoidProperty { .. })
        ));
        let cleaned = sanitize_payload(value, true).expect("Failed to sanitize");
        assert_eq!(cleaned, Value::object([("keep", Value::Number(1.0))]));
    }

    #[test]
    fn test_graft() {
        let mut tree = Some(Value::object([("a", Value::object([("b", "old")]))]));
        let keys = vec![OwnedKey::Name("a".into()), OwnedKey::Name("b".into())];
        graft(&mut tree, &keys, Some(Value::Text("new".into())));
        assert_eq!(
            tree.as_ref().unwrap().descendant(&keys),
            Some(&Value::Text("new".into()))
        );

        graft(&mut tree, &keys, None);
        assert_eq!(tree.as_ref().unwrap().descendant(&keys), None);

        // Grafting below an absent root creates containers.
        let mut empty = None;
        graft(&mut empty, &keys, Some(Value::Bool(true)));
        assert_eq!(
            empty.as_ref().unwrap().descendant(&keys),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_merge_into() {
        let mut target = Value::object([("name", "Alice"), ("city", "Oslo")]);
        merge_into(
            &mut target,
            BTreeMap::from([
                ("age".to_string(), Value::Number(30.0)),
                ("city".to_string(), Value::Null),
            ]),
        );
        assert_eq!(
            target,
            Value::object([
                ("age", Value::Number(30.0)),
                ("name", Value::Text("Alice".into()))
            ])
        );
    }

    #[test]
    fn test_reference_value() {
        let path = crate::path::PathBuf::from_str("users/alice").expect("valid");
        let value = Value::Reference(path.clone());
        assert_eq!(value.as_reference().unwrap().as_str(), "users/alice");
        assert_eq!(value.kind(), Some(ValueKind::Reference));
    }
}
