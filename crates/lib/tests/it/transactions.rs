//! Transaction integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arbordb::storage::TransactOptions;
use arbordb::value::Value;

use crate::helpers::*;

#[tokio::test]
async fn test_transaction_applies_callback_result() {
    let db = setup_db().await;
    let reference = db.reference("counter").expect("valid path");

    reference
        .transaction(|current| {
            assert!(current.is_none());
            Some(Value::Number(1.0))
        })
        .await
        .expect("Failed to run transaction");

    assert_eq!(get_value(&db, "counter").await, Value::Number(1.0));
}

#[tokio::test]
async fn test_concurrent_transactions_serialize() {
    let db = setup_db().await;
    let increment = |db: &arbordb::Database| {
        let reference = db.reference("counter").expect("valid path");
        async move {
            reference
                .transaction(|current| {
                    let n = current.and_then(|v| v.as_number()).unwrap_or(0.0);
                    Some(Value::Number(n + 1.0))
                })
                .await
        }
    };

    let (a, b) = tokio::join!(increment(&db), increment(&db));
    a.expect("Failed to run transaction");
    b.expect("Failed to run transaction");

    assert_eq!(get_value(&db, "counter").await, Value::Number(2.0));
}

#[tokio::test]
async fn test_transaction_cancel_leaves_node_unchanged() {
    let db = setup_db().await;
    let reference = db.reference("stable").expect("valid path");
    reference.set("before").await.expect("Failed to set");

    reference
        .transaction(|_| None)
        .await
        .expect("Failed to run transaction");

    assert_eq!(get_value(&db, "stable").await, Value::Text("before".into()));
}

#[tokio::test]
async fn test_transaction_null_deletes() {
    let db = setup_db().await;
    let reference = db.reference("doomed").expect("valid path");
    reference.set("soon gone").await.expect("Failed to set");

    reference
        .transaction(|_| Some(Value::Null))
        .await
        .expect("Failed to run transaction");

    assert!(!reference.exists().await.expect("Failed to check"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_lock_transaction_restarts_on_concurrent_write() {
    let db = setup_db().await;
    let reference = db.reference("watched").expect("valid path");
    reference.set(5).await.expect("Failed to set");

    let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
    let (resume_tx, resume_rx) = std::sync::mpsc::channel::<()>();
    let attempts = Arc::new(AtomicUsize::new(0));

    let engine = Arc::clone(db.engine());
    let counter = Arc::clone(&attempts);
    let worker = tokio::spawn(async move {
        let path = arbordb::path::PathBuf::parse("watched").expect("valid path");
        engine
            .transact_node(
                &path,
                move |current| {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        // Hold the first attempt open until the concurrent
                        // write has landed.
                        started_tx.send(()).expect("Failed to signal");
                        resume_rx.recv().expect("Failed to resume");
                    }
                    let n = current.and_then(|v| v.as_number()).unwrap_or(0.0);
                    Some(Value::Number(n + 1.0))
                },
                TransactOptions {
                    no_lock: true,
                    ..Default::default()
                },
            )
            .await
    });

    tokio::task::spawn_blocking(move || started_rx.recv())
        .await
        .expect("join")
        .expect("transaction should have started");
    // Without a lock held, this write proceeds while the callback runs and
    // fires the transaction's watch subscription.
    reference.set(10).await.expect("Failed to set");
    settle().await;
    resume_tx.send(()).expect("Failed to resume");

    worker.await.expect("join").expect("Failed to run transaction");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(get_value(&db, "watched").await, Value::Number(11.0));
}

#[tokio::test]
async fn test_no_lock_transaction_cancel() {
    let db = setup_db().await;
    let reference = db.reference("untouched").expect("valid path");
    reference.set("same").await.expect("Failed to set");

    reference
        .transaction_with(|_| None, TransactOptions {
            no_lock: true,
            ..Default::default()
        })
        .await
        .expect("Failed to run transaction");

    assert_eq!(get_value(&db, "untouched").await, Value::Text("same".into()));
}

#[tokio::test]
async fn test_many_concurrent_increments() {
    let db = setup_db().await;
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let reference = db.reference("hot").expect("valid path");
        tasks.push(tokio::spawn(async move {
            reference
                .transaction(|current| {
                    let n = current.and_then(|v| v.as_number()).unwrap_or(0.0);
                    Some(Value::Number(n + 1.0))
                })
                .await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("Failed to run transaction");
    }
    assert_eq!(get_value(&db, "hot").await, Value::Number(10.0));
}
