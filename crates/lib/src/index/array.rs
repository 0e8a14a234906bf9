//! Per-element array index.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::Result;
use crate::path::{Path, PathBuf};
use crate::query::ops;
use crate::value::Value;

use super::{IndexMatch, IndexResultSet, IndexSpec, TreeIndex, capture, property};

/// An index over the elements of an array property, answering
/// `contains`/`!contains` without record loads.
pub struct ArrayIndex {
    spec: IndexSpec,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    /// record path -> (element snapshot, captured properties).
    records: HashMap<String, (Vec<Value>, BTreeMap<String, Value>)>,
}

impl ArrayIndex {
    /// Creates an empty index for a spec.
    pub fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            state: RwLock::new(State::default()),
        }
    }

    /// Number of indexed records.
    pub fn len(&self) -> usize {
        self.state.read().expect("index state poisoned").records.len()
    }
}

#[async_trait]
impl TreeIndex for ArrayIndex {
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
        state.records.remove(path.as_str());
        if let Some(new) = new {
            let elements = property(new, &self.spec.key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            state
                .records
                .insert(path.as_str().to_string(), (elements, capture(&self.spec, new)));
        }
        Ok(())
    }

    async fn query(&self, op: &str, compare: &Value) -> Result<IndexResultSet> {
        let state = self.state.read().expect("index state poisoned");
        let mut matches: Vec<IndexMatch> = state
            .records
            .iter()
            .filter(|(_, (elements, _))| {
                ops::evaluate(Some(&Value::Array(elements.clone())), op, compare)
            })
            .map(|(path, (_, captured))| IndexMatch {
                path: PathBuf::parse(path).expect("indexed paths are canonical"),
                indexed: captured.clone(),
            })
            .collect();
        matches.sort_by(|a, b| a.path.as_str().cmp(b.path.as_str()));
        Ok(IndexResultSet { matches })
    }

    async fn take(&self, skip: usize, take: usize, ascending: bool) -> Result<IndexResultSet> {
        let state = self.state.read().expect("index state poisoned");
        let mut paths: Vec<&String> = state.records.keys().collect();
        paths.sort();
        if !ascending {
            paths.reverse();
        }
        let matches = paths
            .into_iter()
            .skip(skip)
            .take(take)
            .map(|path| IndexMatch {
                path: PathBuf::parse(path).expect("indexed paths are canonical"),
                indexed: state.records[path].1.clone(),
            })
            .collect();
        Ok(IndexResultSet { matches })
    }

    fn test(&self, value: Option<&Value>, op: &str, compare: &Value) -> bool {
        ops::evaluate(value, op, compare)
    }

    fn valid_operators(&self) -> &'static [&'static str] {
        &["contains", "!contains"]
    }
}
