//! Index integration tests: builds over existing data, incremental
//! maintenance, specialized index types.

use arbordb::index::{IndexKind, IndexSpec};
use arbordb::path::PathBuf;
use arbordb::query::QueryOptions;
use arbordb::value::Value;
use std::str::FromStr;

use crate::helpers::*;

#[tokio::test]
async fn test_index_builds_over_existing_data() {
    let db = setup_db().await;
    seed_posts(&db).await;
    db.create_index("posts", "likes")
        .await
        .expect("Failed to create index");
    assert_eq!(db.indexes().len(), 1);

    let results = db
        .reference("posts")
        .expect("valid path")
        .query()
        .filter("likes", ">=", 18)
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    let mut keys: Vec<String> = results
        .rows
        .iter()
        .map(|r| r.path.key().unwrap().to_string())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["p3", "p4"]);
}

#[tokio::test]
async fn test_index_maintained_on_mutation() {
    let db = setup_db().await;
    db.create_index("posts", "likes")
        .await
        .expect("Failed to create index");
    seed_posts(&db).await;

    // Mutate: p1 gains likes, p3 is deleted.
    db.reference("posts/p1")
        .expect("valid path")
        .update(Value::object([("likes", 100)]))
        .await
        .expect("Failed to update");
    db.reference("posts/p3")
        .expect("valid path")
        .remove()
        .await
        .expect("Failed to remove");

    let results = db
        .reference("posts")
        .expect("valid path")
        .query()
        .filter("likes", ">", 20)
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    let keys: Vec<String> = results
        .rows
        .iter()
        .map(|r| r.path.key().unwrap().to_string())
        .collect();
    assert_eq!(keys, vec!["p1"]);
}

#[tokio::test]
async fn test_two_indexed_filters_intersect() {
    let db = setup_db().await;
    seed_posts(&db).await;
    db.create_index("posts", "likes")
        .await
        .expect("Failed to create index");
    db.create_index("posts", "status")
        .await
        .expect("Failed to create index");

    let results = db
        .reference("posts")
        .expect("valid path")
        .query()
        .filter("status", "==", "live")
        .filter("likes", ">", 10)
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    let mut keys: Vec<String> = results
        .rows
        .iter()
        .map(|r| r.path.key().unwrap().to_string())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["p3", "p4"]);
}

#[tokio::test]
async fn test_duplicate_index_rejected() {
    let db = setup_db().await;
    db.create_index("posts", "likes")
        .await
        .expect("Failed to create index");
    assert!(db.create_index("posts", "likes").await.is_err());
}

#[tokio::test]
async fn test_included_keys_cover_other_filters() {
    let db = setup_db().await;
    seed_posts(&db).await;
    db.create_index_with(
        IndexSpec::new(PathBuf::from_str("posts").unwrap(), "status")
            .with_include(["likes"]),
    )
    .await
    .expect("Failed to create index");

    let results = db
        .reference("posts")
        .expect("valid path")
        .query()
        .filter("status", "==", "live")
        .filter("likes", ">", 10)
        .sort("likes", true)
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    let keys: Vec<String> = results
        .rows
        .iter()
        .map(|r| r.path.key().unwrap().to_string())
        .collect();
    assert_eq!(keys, vec!["p4", "p3"]);
}

#[tokio::test]
async fn test_fulltext_index_query() {
    let db = setup_db().await;
    seed_posts(&db).await;
    db.create_index_with(
        IndexSpec::new(PathBuf::from_str("posts").unwrap(), "text")
            .with_kind(IndexKind::Fulltext),
    )
    .await
    .expect("Failed to create index");

    let results = db
        .reference("posts")
        .expect("valid path")
        .query()
        .filter("text", "fulltext:contains", "ducks")
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    let mut keys: Vec<String> = results
        .rows
        .iter()
        .map(|r| r.path.key().unwrap().to_string())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["p2", "p3"]);
}

#[tokio::test]
async fn test_array_index_contains() {
    let db = setup_db().await;
    for (key, tags) in [("p1", vec!["rust", "db"]), ("p2", vec!["js"])] {
        db.reference(format!("tagged/{key}"))
            .expect("valid path")
            .set(Value::object([("tags", Value::array(tags))]))
            .await
            .expect("Failed to set");
    }
    db.create_index_with(
        IndexSpec::new(PathBuf::from_str("tagged").unwrap(), "tags")
            .with_kind(IndexKind::Array),
    )
    .await
    .expect("Failed to create index");

    let results = db
        .reference("tagged")
        .expect("valid path")
        .query()
        .filter("tags", "contains", "rust")
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    assert_eq!(results.rows.len(), 1);
    assert_eq!(results.rows[0].path.as_str(), "tagged/p1");
}

#[tokio::test]
async fn test_geo_index_nearby() {
    let db = setup_db().await;
    for (key, lat, long) in [
        ("office", 52.3676, 4.9041),
        ("harbor", 52.3936, 4.9118),
        ("far", 48.8584, 2.2945),
    ] {
        db.reference(format!("places/{key}"))
            .expect("valid path")
            .set(Value::object([(
                "location",
                Value::object([("lat", lat), ("long", long)]),
            )]))
            .await
            .expect("Failed to set");
    }
    db.create_index_with(
        IndexSpec::new(PathBuf::from_str("places").unwrap(), "location")
            .with_kind(IndexKind::Geo),
    )
    .await
    .expect("Failed to create index");

    let results = db
        .reference("places")
        .expect("valid path")
        .query()
        .filter(
            "location",
            "geo:nearby",
            Value::object([
                ("lat", Value::Number(52.3676)),
                ("long", Value::Number(4.9041)),
                ("radius", Value::Number(10_000.0)),
            ]),
        )
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    let keys: Vec<String> = results
        .rows
        .iter()
        .map(|r| r.path.key().unwrap().to_string())
        .collect();
    assert_eq!(keys, vec!["office", "harbor"]);
}

#[tokio::test]
async fn test_wildcard_index_straddles_deep_writes() {
    let db = setup_db().await;
    db.create_index("users/*/posts", "likes")
        .await
        .expect("Failed to create index");

    db.reference("users/alice/posts/p1")
        .expect("valid path")
        .set(Value::object([("likes", 50)]))
        .await
        .expect("Failed to set");
    // A deep write below the record level must update the index too.
    db.reference("users/alice/posts/p1/likes")
        .expect("valid path")
        .set(5)
        .await
        .expect("Failed to set");

    let results = db
        .reference("users/*/posts")
        .expect("valid path")
        .query()
        .filter("likes", ">", 10)
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    assert!(results.rows.is_empty());

    let results = db
        .reference("users/*/posts")
        .expect("valid path")
        .query()
        .filter("likes", "<=", 10)
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    assert_eq!(results.rows.len(), 1);
}
