//! Ordered single-value index.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::Result;
use crate::path::{Path, PathBuf};
use crate::query::ops;
use crate::value::Value;

use super::key::IndexableKey;
use super::{IndexMatch, IndexResultSet, IndexSpec, TreeIndex, capture, property};

/// An index ordering records by the value of one property.
///
/// Records whose property is absent are tracked under the undefined key so
/// `exists`/`!exists` filters stay index-backed.
pub struct NormalIndex {
    spec: IndexSpec,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    /// key value -> record path -> captured properties.
    entries: BTreeMap<IndexableKey, BTreeMap<String, BTreeMap<String, Value>>>,
    /// record path -> key value, for removal.
    by_path: HashMap<String, IndexableKey>,
}

impl NormalIndex {
    /// Creates an empty index for a spec.
    pub fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            state: RwLock::new(State::default()),
        }
    }

    /// Number of indexed records.
    pub fn len(&self) -> usize {
        self.state.read().expect("index state poisoned").by_path.len()
    }

    /// True when no records are indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl State {
    fn remove(&mut self, path: &str) {
        if let Some(key) = self.by_path.remove(path) {
            if let Some(paths) = self.entries.get_mut(&key) {
                paths.remove(path);
                if paths.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    fn insert(&mut self, path: String, key: IndexableKey, captured: BTreeMap<String, Value>) {
        self.by_path.insert(path.clone(), key.clone());
        self.entries.entry(key).or_default().insert(path, captured);
    }
}

#[async_trait]
impl TreeIndex for NormalIndex {
    fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    async fn handle_record_update(
        &self,
        path: &Path,
        _old: Option<&Value>,
        new: Option<&Value>,
    ) -> Result<()> {
        let mut state = self.state.write().expect("index state poisoned");
        state.remove(path.as_str());
        if let Some(new) = new {
            let key = IndexableKey::from_value(property(new, &self.spec.key));
            state.insert(path.as_str().to_string(), key, capture(&self.spec, new));
        }
        Ok(())
    }

    async fn query(&self, op: &str, compare: &Value) -> Result<IndexResultSet> {
        let state = self.state.read().expect("index state poisoned");
        let mut matches = Vec::new();
        for paths in state.entries.values() {
            for (path, captured) in paths {
                let value = captured.get(&self.spec.key);
                if ops::evaluate(value, op, compare) {
                    matches.push(IndexMatch {
                        path: PathBuf::parse(path).expect("indexed paths are canonical"),
                        indexed: captured.clone(),
                    });
                }
            }
        }
        Ok(IndexResultSet { matches })
    }

    async fn take(&self, skip: usize, take: usize, ascending: bool) -> Result<IndexResultSet> {
        let state = self.state.read().expect("index state poisoned");
        let ordered: Box<dyn Iterator<Item = (&String, &BTreeMap<String, Value>)>> = if ascending {
            Box::new(state.entries.values().flatten())
        } else {
            Box::new(state.entries.values().rev().flatten())
        };
        let matches = ordered
            .skip(skip)
            .take(take)
            .map(|(path, captured)| IndexMatch {
                path: PathBuf::parse(path).expect("indexed paths are canonical"),
                indexed: captured.clone(),
            })
            .collect();
        Ok(IndexResultSet { matches })
    }

    fn test(&self, value: Option<&Value>, op: &str, compare: &Value) -> bool {
        ops::evaluate(value, op, compare)
    }

    fn valid_operators(&self) -> &'static [&'static str] {
        &[
            "<", "<=", "==", "!=", ">=", ">", "exists", "!exists", "between", "!between", "like",
            "!like", "matches", "!matches", "in", "!in",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn index() -> NormalIndex {
        NormalIndex::new(IndexSpec::new(
            PathBuf::from_str("users/*/posts").unwrap(),
            "likes",
        ))
    }

    fn post(likes: f64) -> Value {
        Value::object([("likes", Value::Number(likes)), ("status", "live".into())])
    }

    async fn seed(idx: &NormalIndex) {
        for (name, likes) in [("p1", 5.0), ("p2", 12.0), ("p3", 30.0)] {
            let path = PathBuf::from_str(&format!("users/alice/posts/{name}")).unwrap();
            idx.handle_record_update(&path, None, Some(&post(likes)))
                .await
                .expect("Failed to update index");
        }
    }

    #[tokio::test]
    async fn test_query_range() {
        let idx = index();
        seed(&idx).await;
        let result = idx
            .query(">", &Value::Number(10.0))
            .await
            .expect("Failed to query");
        let paths: Vec<&str> = result.matches.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["users/alice/posts/p2", "users/alice/posts/p3"]);
        // Captured key values ride along.
        assert_eq!(
            result.matches[0].indexed.get("likes"),
            Some(&Value::Number(12.0))
        );
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let idx = index();
        seed(&idx).await;
        let p2 = PathBuf::from_str("users/alice/posts/p2").unwrap();
        idx.handle_record_update(&p2, Some(&post(12.0)), Some(&post(1.0)))
            .await
            .expect("Failed to update");
        assert_eq!(idx.query(">", &Value::Number(10.0)).await.unwrap().len(), 1);

        idx.handle_record_update(&p2, Some(&post(1.0)), None)
            .await
            .expect("Failed to remove");
        assert_eq!(idx.len(), 2);
    }

    #[tokio::test]
    async fn test_take_ordering() {
        let idx = index();
        seed(&idx).await;
        let asc = idx.take(0, 2, true).await.expect("Failed to take");
        assert_eq!(asc.matches[0].path.as_str(), "users/alice/posts/p1");
        let desc = idx.take(0, 1, false).await.expect("Failed to take");
        assert_eq!(desc.matches[0].path.as_str(), "users/alice/posts/p3");
    }

    #[tokio::test]
    async fn test_undefined_keys_tracked() {
        let idx = index();
        let path = PathBuf::from_str("users/alice/posts/nolikes").unwrap();
        let record = Value::object([("status", "draft")]);
        idx.handle_record_update(&path, None, Some(&record))
            .await
            .expect("Failed to update");
        let result = idx.query("!exists", &Value::Null).await.expect("Failed to query");
        assert_eq!(result.len(), 1);
        assert!(idx.query("exists", &Value::Null).await.unwrap().is_empty());
    }
}
