//! Query planner/executor integration tests.

use arbordb::query::{MonitorOptions, QueryEventName, QueryOptions};
use arbordb::value::Value;

use crate::helpers::*;

fn snapshots() -> QueryOptions {
    QueryOptions {
        snapshots: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_filter_sort_and_paginate() {
    let db = setup_db().await;
    seed_posts(&db).await;

    let results = db
        .reference("posts")
        .expect("valid path")
        .query()
        .filter("likes", ">", 10)
        .sort("likes", false)
        .get(snapshots())
        .await
        .expect("Failed to query");

    let keys: Vec<String> = results
        .rows
        .iter()
        .map(|r| r.path.key().unwrap().to_string())
        .collect();
    assert_eq!(keys, vec!["p3", "p4", "p2"]);
    assert!(results.rows[0].value.is_some());

    let page = db
        .reference("posts")
        .expect("valid path")
        .query()
        .filter("likes", ">", 10)
        .sort("likes", false)
        .skip(1)
        .take(1)
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    let keys: Vec<String> = page
        .rows
        .iter()
        .map(|r| r.path.key().unwrap().to_string())
        .collect();
    assert_eq!(keys, vec!["p4"]);
    assert!(page.rows[0].value.is_none());
}

#[tokio::test]
async fn test_multiple_filters_intersect() {
    let db = setup_db().await;
    seed_posts(&db).await;

    let results = db
        .reference("posts")
        .expect("valid path")
        .query()
        .filter("status", "==", "live")
        .filter("likes", "<", 20)
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");

    let mut keys: Vec<String> = results
        .rows
        .iter()
        .map(|r| r.path.key().unwrap().to_string())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["p1", "p4"]);
}

#[tokio::test]
async fn test_like_and_nested_keys() {
    let db = setup_db().await;
    for (key, city) in [("u1", "Oslo"), ("u2", "Bergen"), ("u3", "Odense")] {
        db.reference(format!("users/{key}"))
            .expect("valid path")
            .set(Value::object([(
                "address",
                Value::object([("city", city)]),
            )]))
            .await
            .expect("Failed to set");
    }

    let results = db
        .reference("users")
        .expect("valid path")
        .query()
        .filter("address/city", "like", "o*")
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    let mut keys: Vec<String> = results
        .rows
        .iter()
        .map(|r| r.path.key().unwrap().to_string())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["u1", "u3"]);
}

#[tokio::test]
async fn test_invalid_operands_rejected() {
    let db = setup_db().await;
    seed_posts(&db).await;
    let query = db.reference("posts").expect("valid path").query();

    let error = query
        .clone()
        .filter("likes", "in", Value::Array(Vec::new()))
        .get(QueryOptions::default())
        .await
        .expect_err("empty in-list must fail");
    assert!(error.is_invalid_argument(), "{error}");

    let error = db
        .reference("posts")
        .expect("valid path")
        .query()
        .filter("likes", "between", Value::array([1]))
        .get(QueryOptions::default())
        .await
        .expect_err("one-element between must fail");
    assert!(error.is_invalid_argument(), "{error}");
}

#[tokio::test]
async fn test_wildcard_query_requires_index() {
    let db = setup_db().await;
    for (user, post, likes) in [("alice", "p1", 5), ("alice", "p2", 15), ("bob", "p3", 25)] {
        db.reference(format!("users/{user}/posts/{post}"))
            .expect("valid path")
            .set(Value::object([("likes", Value::Number(likes as f64))]))
            .await
            .expect("Failed to set");
    }

    let error = db
        .reference("users/*/posts")
        .expect("valid path")
        .query()
        .filter("likes", ">", 10)
        .get(QueryOptions::default())
        .await
        .expect_err("wildcard query without index must fail");
    assert!(error.is_index_unavailable(), "{error}");

    db.create_index("users/*/posts", "likes")
        .await
        .expect("Failed to create index");

    let results = db
        .reference("users/*/posts")
        .expect("valid path")
        .query()
        .filter("likes", ">", 10)
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    let mut paths: Vec<&str> = results.rows.iter().map(|r| r.path.as_str()).collect();
    paths.sort();
    assert_eq!(paths, vec!["users/alice/posts/p2", "users/bob/posts/p3"]);
}

#[tokio::test]
async fn test_specialized_operator_requires_index() {
    let db = setup_db().await;
    seed_posts(&db).await;
    let error = db
        .reference("posts")
        .expect("valid path")
        .query()
        .filter("text", "fulltext:contains", "ducks")
        .get(QueryOptions::default())
        .await
        .expect_err("specialized operator without index must fail");
    assert!(error.is_index_unavailable(), "{error}");
}

#[tokio::test]
async fn test_sort_only_index_take() {
    let db = setup_db().await;
    seed_posts(&db).await;
    db.create_index("posts", "likes")
        .await
        .expect("Failed to create index");

    let results = db
        .reference("posts")
        .expect("valid path")
        .query()
        .sort("likes", true)
        .take(2)
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    let keys: Vec<String> = results
        .rows
        .iter()
        .map(|r| r.path.key().unwrap().to_string())
        .collect();
    assert_eq!(keys, vec!["p1", "p2"]);
}

#[tokio::test]
async fn test_count_and_remove() {
    let db = setup_db().await;
    seed_posts(&db).await;

    let drafts = db
        .reference("posts")
        .expect("valid path")
        .query()
        .filter("status", "==", "draft");
    assert_eq!(drafts.count().await.expect("Failed to count"), 1);

    drafts.remove().await.expect("Failed to remove");
    assert_eq!(
        db.reference("posts")
            .expect("valid path")
            .count()
            .await
            .expect("Failed to count"),
        3
    );
}

#[tokio::test]
async fn test_live_query_monitor() {
    let db = setup_db().await;
    seed_posts(&db).await;

    let results = db
        .reference("posts")
        .expect("valid path")
        .query()
        .filter("status", "==", "live")
        .get(QueryOptions {
            monitor: MonitorOptions {
                add: true,
                change: false,
                remove: true,
            },
            ..Default::default()
        })
        .await
        .expect("Failed to query");
    assert_eq!(results.rows.len(), 3);
    let mut events = results.events.expect("monitor stream expected");

    // p2 goes live: add.
    db.reference("posts/p2")
        .expect("valid path")
        .update(Value::object([("status", "live")]))
        .await
        .expect("Failed to update");
    let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.next())
        .await
        .expect("timed out waiting for add")
        .expect("event expected");
    assert_eq!(event.name, QueryEventName::Add);
    assert_eq!(event.path.as_str(), "posts/p2");

    // p1 back to draft: remove.
    db.reference("posts/p1")
        .expect("valid path")
        .update(Value::object([("status", "draft")]))
        .await
        .expect("Failed to update");
    let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.next())
        .await
        .expect("timed out waiting for remove")
        .expect("event expected");
    assert_eq!(event.name, QueryEventName::Remove);
    assert_eq!(event.path.as_str(), "posts/p1");
}

#[tokio::test]
async fn test_query_on_missing_path_is_empty() {
    let db = setup_db().await;
    let results = db
        .reference("nothing/here")
        .expect("valid path")
        .query()
        .filter("x", "==", 1)
        .get(QueryOptions::default())
        .await
        .expect("Failed to query");
    assert!(results.rows.is_empty());
}
