//! Word-token index over text properties.
//!
//! Tokenization is a plain word splitter: lowercase (unless the spec is
//! case-sensitive), split at non-alphanumeric boundaries, tokens shorter
//! than two characters dropped. Stemming and language-aware analysis are a
//! concern of external analyzers and out of scope here.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::Result;
use crate::path::{Path, PathBuf};
use crate::value::Value;

use super::errors::IndexError;
use super::{IndexMatch, IndexResultSet, IndexSpec, TreeIndex, capture, property};

const MIN_TOKEN_LENGTH: usize = 2;

/// A fulltext index answering `fulltext:contains` / `fulltext:!contains`.
pub struct FulltextIndex {
    spec: IndexSpec,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    /// record path -> (token set, captured properties).
    records: HashMap<String, (HashSet<String>, BTreeMap<String, Value>)>,
}

impl FulltextIndex {
    /// Creates an empty index for a spec.
    pub fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            state: RwLock::new(State::default()),
        }
    }

    fn tokenize(&self, text: &str) -> HashSet<String> {
        tokenize(text, self.spec.case_sensitive)
    }

    /// One needle per word of the search phrase; a trailing `*` makes a
    /// needle a prefix match.
    fn matches_phrase(&self, tokens: &HashSet<String>, phrase: &str) -> bool {
        let phrase = if self.spec.case_sensitive {
            phrase.to_string()
        } else {
            phrase.to_lowercase()
        };
        let mut needles = phrase
            .split(|c: char| !c.is_alphanumeric() && c != '*')
            .filter(|w| !w.is_empty())
            .peekable();
        if needles.peek().is_none() {
            return false;
        }
        needles.all(|needle| match needle.strip_suffix('*') {
            Some(prefix) if !prefix.is_empty() => tokens.iter().any(|t| t.starts_with(prefix)),
            _ => tokens.contains(needle.trim_end_matches('*')),
        })
    }
}

fn tokenize(text: &str, case_sensitive: bool) -> HashSet<String> {
    let text = if case_sensitive {
        text.to_string()
    } else {
        text.to_lowercase()
    };
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= MIN_TOKEN_LENGTH)
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl TreeIndex for FulltextIndex {
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
            let tokens = property(new, &self.spec.key)
                .and_then(Value::as_text)
                .map(|text| self.tokenize(text))
                .unwrap_or_default();
            state
                .records
                .insert(path.as_str().to_string(), (tokens, capture(&self.spec, new)));
        }
        Ok(())
    }

    async fn query(&self, op: &str, compare: &Value) -> Result<IndexResultSet> {
        let phrase = compare
            .as_text()
            .ok_or_else(|| IndexError::InvalidCompareValue {
                op: op.to_string(),
                reason: "expected a search phrase".to_string(),
            })?;
        let negate = match op {
            "fulltext:contains" => false,
            "fulltext:!contains" => true,
            _ => {
                return Err(IndexError::UnsupportedOperator {
                    index_path: self.spec.path.as_str().to_string(),
                    key: self.spec.key.clone(),
                    op: op.to_string(),
                }
                .into());
            }
        };
        let state = self.state.read().expect("index state poisoned");
        let mut matches: Vec<IndexMatch> = state
            .records
            .iter()
            .filter(|(_, (tokens, _))| self.matches_phrase(tokens, phrase) != negate)
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
        let (Some(text), Some(phrase)) = (value.and_then(Value::as_text), compare.as_text())
        else {
            return false;
        };
        let tokens = self.tokenize(text);
        let contained = self.matches_phrase(&tokens, phrase);
        match op {
            "fulltext:contains" => contained,
            "fulltext:!contains" => !contained,
            _ => false,
        }
    }

    fn valid_operators(&self) -> &'static [&'static str] {
        &["fulltext:contains", "fulltext:!contains"]
    }
}
