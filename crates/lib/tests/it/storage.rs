//! Storage engine integration tests: reads, writes, record placement,
//! array constraints.

use std::str::FromStr;
use std::sync::Arc;

use arbordb::backend::MemoryBackend;
use arbordb::path::PathBuf;
use arbordb::storage::NodeAddress;
use arbordb::value::Value;
use arbordb::{Database, DatabaseConfig};

use crate::helpers::*;

#[tokio::test]
async fn test_set_and_get_round_trip() {
    let db = setup_db().await;
    let value = Value::object([
        ("name", Value::Text("Alice".into())),
        ("age", Value::Number(30.0)),
        ("verified", Value::Bool(true)),
        ("joined", Value::DateTime(1_600_000_000_000)),
        ("avatar", Value::Binary((0..100).collect())),
        (
            "best_friend",
            Value::Reference(PathBuf::from_str("users/bob").unwrap()),
        ),
        (
            "address",
            Value::object([("city", "Oslo"), ("street", "Main st 1")]),
        ),
        ("scores", Value::array([1, 2, 3])),
    ]);
    db.reference("users/alice")
        .expect("valid path")
        .set(value.clone())
        .await
        .expect("Failed to set");

    let read = get_value(&db, "users/alice").await;
    assert_eq!(read, value);
}

#[tokio::test]
async fn test_inline_promotion() {
    let db = setup_db().await;
    let a_b = db.reference("a/b").expect("valid path");

    a_b.set("short").await.expect("Failed to set");
    assert_eq!(get_value(&db, "a").await, Value::object([("b", "short")]));
    let info = a_b.reflect_info().await.expect("Failed to reflect");
    assert_eq!(info.address, NodeAddress::Inline);

    // Crossing the inline threshold moves the node to a dedicated record.
    let long = "x".repeat(200);
    a_b.set(long.as_str()).await.expect("Failed to set");
    assert_eq!(
        get_value(&db, "a").await,
        Value::object([("b", long.as_str())])
    );
    let info = a_b.reflect_info().await.expect("Failed to reflect");
    assert_eq!(info.address, NodeAddress::Dedicated);

    // The backend now holds a record at a/b.
    let backend = db
        .engine()
        .backend()
        .as_any()
        .downcast_ref::<MemoryBackend>()
        .expect("memory backend");
    assert!(backend.contains_record(&PathBuf::from_str("a/b").unwrap()));

    // And shrinking moves it back inline.
    a_b.set("tiny").await.expect("Failed to set");
    assert!(!backend.contains_record(&PathBuf::from_str("a/b").unwrap()));
}

#[tokio::test]
async fn test_null_removes_node() {
    let db = setup_db().await;
    let reference = db.reference("temp").expect("valid path");
    reference
        .set(Value::object([("x", 1)]))
        .await
        .expect("Failed to set");
    assert!(reference.exists().await.expect("Failed to check"));

    reference.set(Value::Null).await.expect("Failed to remove");
    assert!(!reference.exists().await.expect("Failed to check"));
    assert!(!get_snapshot(&db, "temp").await.exists());
}

#[tokio::test]
async fn test_remove_cascades_to_descendants() {
    let db = setup_db().await;
    db.reference("books/b1")
        .expect("valid path")
        .set(Value::object([
            ("title", Value::Text("t".repeat(100))),
            ("meta", Value::object([("pages", 300)])),
        ]))
        .await
        .expect("Failed to set");

    db.reference("books").expect("valid path").remove().await.expect("Failed to remove");

    let backend = db
        .engine()
        .backend()
        .as_any()
        .downcast_ref::<MemoryBackend>()
        .expect("memory backend");
    // Only the root record remains.
    assert_eq!(backend.record_count(), 1);
}

#[tokio::test]
async fn test_revision_nr_increments() {
    let db = setup_db().await;
    let reference = db.reference("counter_holder").expect("valid path");
    reference
        .set(Value::object([("n", Value::Text("y".repeat(100)))]))
        .await
        .expect("Failed to set");
    let first = reference.reflect_info().await.expect("Failed to reflect");

    reference
        .update(Value::object([("n", Value::Text("z".repeat(100)))]))
        .await
        .expect("Failed to update");
    let second = reference.reflect_info().await.expect("Failed to reflect");

    assert_eq!(first.revision_nr.unwrap() + 1, second.revision_nr.unwrap());
    assert_eq!(first.created, second.created);
    assert_ne!(first.revision, second.revision);
}

#[tokio::test]
async fn test_update_merges_and_null_deletes_property() {
    let db = setup_db().await;
    let reference = db.reference("users/bob").expect("valid path");
    reference
        .set(Value::object([("name", "Bob"), ("city", "Berlin")]))
        .await
        .expect("Failed to set");
    reference
        .update(Value::object([
            ("age", Value::Number(40.0)),
            ("city", Value::Null),
        ]))
        .await
        .expect("Failed to update");

    assert_eq!(
        get_value(&db, "users/bob").await,
        Value::object([("age", Value::Number(40.0)), ("name", Value::Text("Bob".into()))])
    );
}

#[tokio::test]
async fn test_merge_idempotence() {
    let db = setup_db().await;
    let reference = db.reference("idem").expect("valid path");
    let updates = Value::object([("a", Value::Number(1.0)), ("b", Value::Text("two".into()))]);
    reference.update(updates.clone()).await.expect("Failed to update");
    let after_one = get_value(&db, "idem").await;
    reference.update(updates).await.expect("Failed to update");
    assert_eq!(get_value(&db, "idem").await, after_one);
}

#[tokio::test]
async fn test_array_trailing_remove() {
    let db = setup_db().await;
    let arr = db.reference("arr").expect("valid path");
    arr.set(Value::array(["u", "v", "w"]))
        .await
        .expect("Failed to set");

    arr.update(Value::object([("2", Value::Null)]))
        .await
        .expect("Failed to remove trailing element");
    assert_eq!(get_value(&db, "arr").await, Value::array(["u", "v"]));

    let error = arr
        .update(Value::object([("0", Value::Null)]))
        .await
        .expect_err("non-trailing removal must fail");
    assert!(error.is_array_constraint(), "{error}");
}

#[tokio::test]
async fn test_array_element_update_and_read_by_index() {
    let db = setup_db().await;
    db.reference("list")
        .expect("valid path")
        .set(Value::array([10, 20, 30]))
        .await
        .expect("Failed to set");

    db.reference("list[1]")
        .expect("valid path")
        .set(99)
        .await
        .expect("Failed to set element");

    assert_eq!(get_value(&db, "list").await, Value::array([10, 99, 30]));
    assert_eq!(get_value(&db, "list[2]").await, Value::Number(30.0));
}

#[tokio::test]
async fn test_array_rejects_null_elements() {
    let db = setup_db().await;
    let error = db
        .reference("bad")
        .expect("valid path")
        .set(Value::Array(vec![Value::Number(1.0), Value::Null]))
        .await
        .expect_err("null array element must fail");
    assert!(error.is_invalid_value(), "{error}");
}

#[tokio::test]
async fn test_root_non_object_rejected() {
    let db = setup_db().await;
    let error = db.root().set(42).await.expect_err("non-object root must fail");
    assert!(error.is_not_allowed(), "{error}");
    let error = db.root().remove().await.expect_err("root removal must fail");
    assert!(error.is_not_allowed(), "{error}");
}

#[tokio::test]
async fn test_wildcard_write_rejected() {
    let db = setup_db().await;
    let reference = db.reference("users/*").expect("valid path");
    assert!(reference.set(1).await.expect_err("must fail").is_not_allowed());
    assert!(reference
        .get(Default::default())
        .await
        .expect_err("must fail")
        .is_not_allowed());
}

#[tokio::test]
async fn test_void_properties_config() {
    let db = setup_db().await;
    let error = db
        .reference("strict")
        .expect("valid path")
        .set(Value::object([("keep", Value::Number(1.0)), ("drop", Value::Null)]))
        .await
        .expect_err("null property in set payload must fail");
    assert!(error.is_invalid_value(), "{error}");

    let lenient = Database::open(
        Arc::new(MemoryBackend::new()),
        DatabaseConfig::default().with_remove_void_properties(true),
    )
    .await
    .expect("Failed to open database");
    lenient
        .reference("lenient")
        .expect("valid path")
        .set(Value::object([("keep", Value::Number(1.0)), ("drop", Value::Null)]))
        .await
        .expect("Failed to set");
    assert_eq!(
        get_value(&lenient, "lenient").await,
        Value::object([("keep", 1)])
    );
}

#[tokio::test]
async fn test_include_exclude_filters() {
    let db = setup_db().await;
    db.reference("profile")
        .expect("valid path")
        .set(Value::object([
            ("name", Value::Text("Alice".into())),
            ("secret", Value::Text("hunter2".into())),
            (
                "address",
                Value::object([("city", "Oslo"), ("zip", "0150")]),
            ),
        ]))
        .await
        .expect("Failed to set");

    let snapshot = db
        .reference("profile")
        .expect("valid path")
        .get(arbordb::api::GetOptions {
            include: vec!["name".into(), "address/city".into()],
            ..Default::default()
        })
        .await
        .expect("Failed to get");
    assert_eq!(
        snapshot.val().unwrap(),
        &Value::object([
            ("address", Value::object([("city", "Oslo")])),
            ("name", Value::Text("Alice".into()))
        ])
    );

    let snapshot = db
        .reference("profile")
        .expect("valid path")
        .get(arbordb::api::GetOptions {
            exclude: vec!["secret".into()],
            ..Default::default()
        })
        .await
        .expect("Failed to get");
    assert!(!snapshot.has_child("secret"));
    assert!(snapshot.has_child("address"));
}

#[tokio::test]
async fn test_child_objects_false() {
    let db = setup_db().await;
    db.reference("mixed")
        .expect("valid path")
        .set(Value::object([
            ("title", Value::Text("hello".into())),
            ("meta", Value::object([("x", 1)])),
        ]))
        .await
        .expect("Failed to set");

    let snapshot = db
        .reference("mixed")
        .expect("valid path")
        .get(arbordb::api::GetOptions {
            child_objects: Some(false),
            ..Default::default()
        })
        .await
        .expect("Failed to get");
    assert_eq!(
        snapshot.val().unwrap(),
        &Value::object([("title", "hello")])
    );
}

#[tokio::test]
async fn test_scalar_ancestor_overwritten_by_branch() {
    let db = setup_db().await;
    db.reference("a").expect("valid path").set("text").await.expect("Failed to set");
    db.reference("a/b").expect("valid path").set(1).await.expect("Failed to set");
    assert_eq!(get_value(&db, "a").await, Value::object([("b", 1)]));
}

#[tokio::test]
async fn test_deep_path_creates_ancestors() {
    let db = setup_db().await;
    db.reference("x/y/z")
        .expect("valid path")
        .set("deep")
        .await
        .expect("Failed to set");
    assert_eq!(
        get_value(&db, "x").await,
        Value::object([("y", Value::object([("z", "deep")]))])
    );
}

#[tokio::test]
async fn test_push_generates_sortable_keys() {
    let db = setup_db().await;
    let chat = db.reference("chat").expect("valid path");
    let first = chat.push("one").await.expect("Failed to push");
    let second = chat.push("two").await.expect("Failed to push");
    assert!(first.key().unwrap() < second.key().unwrap());
    assert_eq!(chat.count().await.expect("Failed to count"), 2);
}

#[tokio::test]
async fn test_reflect_children_listing() {
    let db = setup_db().await;
    db.reference("zoo")
        .expect("valid path")
        .set(Value::object([
            ("ant", Value::Number(1.0)),
            ("bee", Value::Number(2.0)),
            ("cat", Value::object([("legs", 4)])),
        ]))
        .await
        .expect("Failed to set");

    let children = db
        .reference("zoo")
        .expect("valid path")
        .reflect_children(0, 10)
        .await
        .expect("Failed to reflect");
    assert_eq!(children.list.len(), 3);
    assert!(!children.more);

    let limited = db
        .reference("zoo")
        .expect("valid path")
        .reflect_children(0, 2)
        .await
        .expect("Failed to reflect");
    assert_eq!(limited.list.len(), 2);
    assert!(limited.more);
}

#[tokio::test]
async fn test_empty_composites_stay_inline() {
    let db = setup_db().await;
    db.reference("holder")
        .expect("valid path")
        .set(Value::object([
            ("empty_map", Value::object::<&str, Value, _>([])),
            ("empty_list", Value::array::<Value, _>([])),
        ]))
        .await
        .expect("Failed to set");
    assert_eq!(
        get_value(&db, "holder").await,
        Value::object([
            ("empty_list", Value::array::<Value, _>([])),
            ("empty_map", Value::object::<&str, Value, _>([])),
        ])
    );
    let info = db
        .reference("holder/empty_map")
        .expect("valid path")
        .reflect_info()
        .await
        .expect("Failed to reflect");
    assert_eq!(info.address, NodeAddress::Inline);
}
