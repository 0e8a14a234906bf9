//! Latitude/longitude radius index.
//!
//! Records are indexed by a `{lat, long}` object property and queried with
//! `geo:nearby` against a `{lat, long, radius}` compare value (radius in
//! meters). Candidate selection is a haversine distance test over the
//! indexed coordinates; geohash-bucketed neighborhood search belongs to
//! external index storage and is out of scope.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::Result;
use crate::path::{Path, PathBuf};
use crate::value::Value;

use super::errors::IndexError;
use super::{IndexMatch, IndexResultSet, IndexSpec, TreeIndex, capture, property};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A geo index answering `geo:nearby`.
pub struct GeoIndex {
    spec: IndexSpec,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    /// record path -> (coordinates, captured properties).
    records: HashMap<String, ((f64, f64), BTreeMap<String, Value>)>,
}

impl GeoIndex {
    /// Creates an empty index for a spec.
    pub fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            state: RwLock::new(State::default()),
        }
    }
}

/// Reads a `{lat, long}` coordinate pair from a value.
fn coordinates(value: &Value) -> Option<(f64, f64)> {
    let map = value.as_object()?;
    let lat = map.get("lat")?.as_number()?;
    let long = map.get("long")?.as_number()?;
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&long)).then_some((lat, long))
}

/// Great-circle distance in meters.
fn haversine(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, long1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, long2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlong = long2 - long1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlong / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

struct NearbyQuery {
    center: (f64, f64),
    radius: f64,
}

fn parse_nearby(op: &str, compare: &Value) -> std::result::Result<NearbyQuery, IndexError> {
    let invalid = |reason: &str| IndexError::InvalidCompareValue {
        op: op.to_string(),
        reason: reason.to_string(),
    };
    let center = coordinates(compare).ok_or_else(|| invalid("expected {lat, long, radius}"))?;
    let radius = compare
        .as_object()
        .and_then(|m| m.get("radius"))
        .and_then(Value::as_number)
        .ok_or_else(|| invalid("expected a radius in meters"))?;
    if radius < 0.0 {
        return Err(invalid("radius cannot be negative"));
    }
    Ok(NearbyQuery { center, radius })
}

#[async_trait]
impl TreeIndex for GeoIndex {
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
            if let Some(coords) = property(new, &self.spec.key).and_then(coordinates) {
                state
                    .records
                    .insert(path.as_str().to_string(), (coords, capture(&self.spec, new)));
            }
        }
        Ok(())
    }

    async fn query(&self, op: &str, compare: &Value) -> Result<IndexResultSet> {
        if op != "geo:nearby" {
            return Err(IndexError::UnsupportedOperator {
                index_path: self.spec.path.as_str().to_string(),
                key: self.spec.key.clone(),
                op: op.to_string(),
            }
            .into());
        }
        let nearby = parse_nearby(op, compare)?;
        let state = self.state.read().expect("index state poisoned");
        let mut matches: Vec<(f64, IndexMatch)> = state
            .records
            .iter()
            .filter_map(|(path, (coords, captured))| {
                let distance = haversine(*coords, nearby.center);
                (distance <= nearby.radius).then(|| {
                    (
                        distance,
                        IndexMatch {
                            path: PathBuf::parse(path).expect("indexed paths are canonical"),
                            indexed: captured.clone(),
                        },
                    )
                })
            })
            .collect();
        matches.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(IndexResultSet {
            matches: matches.into_iter().map(|(_, m)| m).collect(),
        })
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
        let (Some(coords), Ok(nearby)) = (
            value.and_then(coordinates),
            parse_nearby(op, compare),
        ) else {
            return false;
        };
        op == "geo:nearby" && haversine(coords, nearby.center) <= nearby.radius
    }

    fn valid_operators(&self) -> &'static [&'static str] {
        &["geo:nearby"]
    }
}
