//! Shared helpers for the integration test suite.

use std::sync::Once;

use arbordb::value::Value;
use arbordb::{DataSnapshot, Database};

/// Installs a tracing subscriber once, honoring `RUST_LOG`.
fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Opens a fresh in-memory database.
pub async fn setup_db() -> Database {
    init_tracing();
    Database::in_memory().await.expect("Failed to open database")
}

/// Gives the event dispatcher a moment to drain.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

/// Reads the value at a path, panicking when the node does not exist.
pub async fn get_value(db: &Database, path: &str) -> Value {
    let snapshot = get_snapshot(db, path).await;
    snapshot.val().expect("node should exist").clone()
}

/// Reads the snapshot at a path.
pub async fn get_snapshot(db: &Database, path: &str) -> DataSnapshot {
    db.reference(path)
        .expect("valid path")
        .get(Default::default())
        .await
        .expect("Failed to get")
}

/// Seeds a small posts collection used by query tests.
pub async fn seed_posts(db: &Database) {
    for (key, likes, status, text) in [
        ("p1", 5, "live", "Hello world"),
        ("p2", 12, "draft", "Ducks are great"),
        ("p3", 30, "live", "Hello ducks"),
        ("p4", 18, "live", "Nothing here"),
    ] {
        db.reference(format!("posts/{key}"))
            .expect("valid path")
            .set(Value::object([
                ("likes", Value::Number(likes as f64)),
                ("status", Value::Text(status.into())),
                ("text", Value::Text(text.into())),
            ]))
            .await
            .expect("Failed to seed post");
    }
}
