//! Event system integration tests: subscription granularity, payloads,
//! notify variants, contexts.

use arbordb::subscription::EventType;
use arbordb::value::Value;

use crate::helpers::*;

#[tokio::test]
async fn test_value_event_granularity() {
    let db = setup_db().await;
    let alice = db.reference("users/alice").expect("valid path");
    alice
        .set(Value::object([("name", "Alice")]))
        .await
        .expect("Failed to set");

    let mut stream = alice.on(EventType::Value);

    alice
        .update(Value::object([("age", 30)]))
        .await
        .expect("Failed to update");
    db.reference("users/bob")
        .expect("valid path")
        .update(Value::object([("age", 31)]))
        .await
        .expect("Failed to update");
    settle().await;

    let event = stream.try_next().expect("value event expected");
    assert_eq!(event.path.as_str(), "users/alice");
    assert_eq!(
        event.previous,
        Some(Value::object([("name", "Alice")]))
    );
    assert_eq!(
        event.value,
        Some(Value::object([
            ("age", Value::Number(30.0)),
            ("name", Value::Text("Alice".into()))
        ]))
    );
    // The write to bob must not reach alice's subscriber.
    assert!(stream.try_next().is_none());
}

#[tokio::test]
async fn test_value_event_fires_once_per_write() {
    let db = setup_db().await;
    let reference = db.reference("single").expect("valid path");
    let mut stream = reference.on(EventType::Value);

    reference
        .set(Value::object([("a", 1), ("b", 2)]))
        .await
        .expect("Failed to set");
    settle().await;

    assert!(stream.try_next().is_some());
    assert!(stream.try_next().is_none());
}

#[tokio::test]
async fn test_child_added_and_removed() {
    let db = setup_db().await;
    let users = db.reference("users").expect("valid path");
    users
        .set(Value::object([("alice", Value::object([("age", 30)]))]))
        .await
        .expect("Failed to set");

    let mut added = users.on(EventType::ChildAdded);
    let mut removed = users.on(EventType::ChildRemoved);

    db.reference("users/bob")
        .expect("valid path")
        .set(Value::object([("age", 40)]))
        .await
        .expect("Failed to set");
    db.reference("users/alice")
        .expect("valid path")
        .remove()
        .await
        .expect("Failed to remove");
    settle().await;

    let event = added.try_next().expect("child_added expected");
    assert_eq!(event.path.as_str(), "users/bob");
    assert_eq!(event.value, Some(Value::object([("age", 40)])));
    assert!(event.previous.is_none());

    let event = removed.try_next().expect("child_removed expected");
    assert_eq!(event.path.as_str(), "users/alice");
    assert_eq!(event.previous, Some(Value::object([("age", 30)])));
    assert!(event.value.is_none());
}

#[tokio::test]
async fn test_child_changed_on_ancestor() {
    let db = setup_db().await;
    db.reference("store/items/i1")
        .expect("valid path")
        .set(Value::object([("price", 10)]))
        .await
        .expect("Failed to set");

    let mut changed = db.reference("store").expect("valid path").on(EventType::ChildChanged);

    db.reference("store/items/i1/price")
        .expect("valid path")
        .set(12)
        .await
        .expect("Failed to set");
    settle().await;

    // The changed child of "store" is "store/items".
    let event = changed.try_next().expect("child_changed expected");
    assert_eq!(event.path.as_str(), "store/items");
}

#[tokio::test]
async fn test_wildcard_subscription_binds_concrete_paths() {
    let db = setup_db().await;
    let pattern = db.reference("users/*/posts").expect("valid path");
    let mut stream = pattern.on(EventType::Value);

    db.reference("users/alice/posts")
        .expect("valid path")
        .set(Value::object([("p1", Value::object([("title", "hi")]))]))
        .await
        .expect("Failed to set");
    settle().await;

    let event = stream.try_next().expect("value event expected");
    assert_eq!(event.path.as_str(), "users/alice/posts");
    assert_eq!(event.subscription_path.as_str(), "users/*/posts");
}

#[tokio::test]
async fn test_notify_value_has_no_payload() {
    let db = setup_db().await;
    let reference = db.reference("silent").expect("valid path");
    let mut stream = reference.on(EventType::NotifyValue);

    reference.set(Value::object([("x", 1)])).await.expect("Failed to set");
    settle().await;

    let event = stream.try_next().expect("notify_value expected");
    assert!(event.previous.is_none());
    assert!(event.value.is_none());
    assert_eq!(event.path.as_str(), "silent");
}

#[tokio::test]
async fn test_notify_child_added_without_preimage() {
    let db = setup_db().await;
    let users = db.reference("people").expect("valid path");
    users
        .set(Value::object([("alice", Value::object([("age", 30)]))]))
        .await
        .expect("Failed to set");

    // Only notify subscribers: the engine skips the pre-image read and
    // still classifies the child operation.
    let mut added = users.on(EventType::NotifyChildAdded);
    db.reference("people/bob")
        .expect("valid path")
        .set(Value::object([("age", 41)]))
        .await
        .expect("Failed to set");
    settle().await;

    let event = added.try_next().expect("notify_child_added expected");
    assert_eq!(event.path.as_str(), "people/bob");
    assert!(event.value.is_none());
}

#[tokio::test]
async fn test_mutations_event_batches_leaf_changes() {
    let db = setup_db().await;
    let reference = db.reference("doc").expect("valid path");
    reference
        .set(Value::object([
            ("title", Value::Text("old".into())),
            ("tags", Value::array(["a"])),
        ]))
        .await
        .expect("Failed to set");

    let mut stream = reference.on(EventType::Mutations);
    reference
        .update(Value::object([
            ("title", Value::Text("new".into())),
            ("tags", Value::array(["a", "b"])),
        ]))
        .await
        .expect("Failed to update");
    settle().await;

    let event = stream.try_next().expect("mutations event expected");
    assert_eq!(event.path.as_str(), "doc");
    assert_eq!(event.mutations.len(), 2);
    // Arrays report one atomic mutation on the array path.
    let snapshot = reference.mutations_snapshot_of(event);
    let Value::Array(entries) = snapshot.val() else {
        panic!("mutations val() must be a list");
    };
    assert_eq!(entries.len(), 2);
}

#[tokio::test]
async fn test_mutated_fires_per_leaf() {
    let db = setup_db().await;
    let reference = db.reference("doc2").expect("valid path");
    reference
        .set(Value::object([("a", 1), ("b", 2)]))
        .await
        .expect("Failed to set");

    let mut stream = reference.on(EventType::Mutated);
    reference
        .update(Value::object([("a", 10), ("c", 3)]))
        .await
        .expect("Failed to update");
    settle().await;

    let mut paths = Vec::new();
    while let Some(event) = stream.try_next() {
        paths.push(event.path.as_str().to_string());
    }
    paths.sort();
    assert_eq!(paths, vec!["doc2/a", "doc2/c"]);
}

#[tokio::test]
async fn test_context_propagates_to_events() {
    let db = setup_db().await;
    let plain = db.reference("ctx").expect("valid path");
    let mut stream = plain.on(EventType::Value);

    let tagged = plain
        .clone()
        .with_context(serde_json::json!({ "proxy": { "id": "x1", "source": "test" } }), false);
    tagged
        .set(Value::object([("v", 1)]))
        .await
        .expect("Failed to set");
    settle().await;

    let event = stream.try_next().expect("value event expected");
    let context = event.context.as_ref().expect("context expected");
    assert_eq!(context["proxy"]["id"], "x1");

    let snapshot = plain.snapshot_of(event);
    assert_eq!(snapshot.context().unwrap()["proxy"]["source"], "test");
}

#[tokio::test]
async fn test_stopped_stream_receives_nothing() {
    let db = setup_db().await;
    let reference = db.reference("quiet").expect("valid path");
    let mut stream = reference.on(EventType::Value);
    stream.stop();

    reference.set(Value::object([("x", 1)])).await.expect("Failed to set");
    settle().await;
    assert!(stream.try_next().is_none());
}

#[tokio::test]
async fn test_once_returns_first_event() {
    let db = setup_db().await;
    let reference = db.reference("once_node").expect("valid path");

    let waiter = {
        let reference = reference.clone();
        tokio::spawn(async move { reference.once(EventType::Value).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    reference.set(Value::object([("hello", true)])).await.expect("Failed to set");

    let snapshot = waiter
        .await
        .expect("join")
        .expect("Failed to wait for event")
        .expect("event expected");
    assert!(snapshot.exists());
    assert_eq!(snapshot.key().unwrap(), "once_node");
}
