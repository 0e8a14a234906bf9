//! Backend persistence round trips through the record wire shape.

use std::str::FromStr;
use std::sync::Arc;

use arbordb::backend::MemoryBackend;
use arbordb::path::PathBuf;
use arbordb::value::Value;
use arbordb::{Database, DatabaseConfig};

use crate::helpers::*;

#[tokio::test]
async fn test_save_and_load_preserves_values() {
    let backend = Arc::new(MemoryBackend::new());
    let db = Database::open(backend.clone(), DatabaseConfig::default())
        .await
        .expect("Failed to open database");

    let value = Value::object([
        ("title", Value::Text("t".repeat(120))),
        ("joined", Value::DateTime(1_600_000_000_000)),
        ("blob", Value::Binary((0..60).collect())),
        (
            "link",
            Value::Reference(PathBuf::from_str("other/node").unwrap()),
        ),
        ("nested", Value::object([("deep", Value::array([1, 2, 3]))])),
    ]);
    db.reference("docs/d1")
        .expect("valid path")
        .set(value.clone())
        .await
        .expect("Failed to set");

    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let file = dir.path().join("arbordb.json");
    backend.save_to_file(&file).expect("Failed to save");

    let restored_backend = Arc::new(MemoryBackend::load_from_file(&file).expect("Failed to load"));
    let restored = Database::open(restored_backend, DatabaseConfig::default())
        .await
        .expect("Failed to open database");

    assert_eq!(get_value(&restored, "docs/d1").await, value);
    // Metadata survives the round trip too.
    let info = restored
        .reference("docs/d1")
        .expect("valid path")
        .reflect_info()
        .await
        .expect("Failed to reflect");
    assert!(info.exists);
    assert_eq!(info.revision_nr, Some(1));
}

#[tokio::test]
async fn test_reopen_preserves_revision_counters() {
    let backend = Arc::new(MemoryBackend::new());
    let db = Database::open(backend.clone(), DatabaseConfig::default())
        .await
        .expect("Failed to open database");
    let reference = db.reference("versioned").expect("valid path");
    reference
        .set(Value::object([("v", Value::Text("a".repeat(80)))]))
        .await
        .expect("Failed to set");
    reference
        .update(Value::object([("v", Value::Text("b".repeat(80)))]))
        .await
        .expect("Failed to update");

    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let file = dir.path().join("db.json");
    backend.save_to_file(&file).expect("Failed to save");

    let restored = Database::open(
        Arc::new(MemoryBackend::load_from_file(&file).expect("Failed to load")),
        DatabaseConfig::default(),
    )
    .await
    .expect("Failed to open database");
    let info = restored
        .reference("versioned")
        .expect("valid path")
        .reflect_info()
        .await
        .expect("Failed to reflect");
    assert_eq!(info.revision_nr, Some(2));

    // Writes continue the counter after reopening.
    restored
        .reference("versioned")
        .expect("valid path")
        .update(Value::object([("v", Value::Text("c".repeat(80)))]))
        .await
        .expect("Failed to update");
    let info = restored
        .reference("versioned")
        .expect("valid path")
        .reflect_info()
        .await
        .expect("Failed to reflect");
    assert_eq!(info.revision_nr, Some(3));
}
