//! The public database surface.
//!
//! [`Database`] is a cheap-to-clone handle owning the storage engine and
//! everything attached to it. Data access happens through
//! [`DataReference`]s obtained from [`Database::reference`] (or
//! [`Database::root`]), which expose reads, writes, transactions, event
//! subscriptions and queries for one node of the tree.
//!
//! ## Example
//!
//! ```
//! # use arbordb::{Database, value::Value};
//! # #[tokio::main]
//! # async fn main() -> arbordb::Result<()> {
//! let db = Database::in_memory().await?;
//!
//! let alice = db.reference("users/alice")?;
//! alice
//!     .set(Value::object([("name", "Alice"), ("city", "Oslo")]))
//!     .await?;
//! alice.update(Value::object([("age", 30)])).await?;
//!
//! let snapshot = alice.get(Default::default()).await?;
//! assert!(snapshot.exists());
//! assert!(snapshot.has_child("age"));
//! # Ok(())
//! # }
//! ```

mod reference;
mod snapshot;

pub use reference::{DataReference, GetOptions, ReflectChildEntry, ReflectChildren, ReflectInfo};
pub use snapshot::{DataSnapshot, MutationsDataSnapshot};

use std::sync::Arc;

use crate::Result;
use crate::backend::{MemoryBackend, StorageBackend};
use crate::config::DatabaseConfig;
use crate::index::IndexSpec;
use crate::path::PathBuf;
use crate::storage::StorageEngine;

struct DatabaseInner {
    engine: Arc<StorageEngine>,
}

/// A database handle.
///
/// Cloning is cheap; all clones share one engine, subscription registry and
/// index list.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Opens a database over the given backend.
    pub async fn open(backend: Arc<dyn StorageBackend>, config: DatabaseConfig) -> Result<Database> {
        let engine = StorageEngine::new(backend, config).await?;
        Ok(Database {
            inner: Arc::new(DatabaseInner { engine }),
        })
    }

    /// Opens a database on a fresh in-memory backend with default
    /// configuration. Intended for tests and experiments.
    pub async fn in_memory() -> Result<Database> {
        Self::open(Arc::new(MemoryBackend::new()), DatabaseConfig::default()).await
    }

    /// A reference to the node at `path`.
    pub fn reference(&self, path: impl AsRef<str>) -> Result<DataReference> {
        let path = PathBuf::parse(path.as_ref())?;
        Ok(DataReference::new(Arc::clone(&self.inner.engine), path))
    }

    /// A reference to the root node.
    pub fn root(&self) -> DataReference {
        DataReference::new(Arc::clone(&self.inner.engine), PathBuf::root())
    }

    /// Creates a normal index on `key` for the children of `path`, builds
    /// it over existing data, and keeps it updated on every mutation.
    pub async fn create_index(&self, path: impl AsRef<str>, key: impl Into<String>) -> Result<()> {
        let spec = IndexSpec::new(PathBuf::parse(path.as_ref())?, key);
        self.inner.engine.create_index(spec).await
    }

    /// Creates an index of a specific kind, with included keys and other
    /// settings taken from the spec.
    pub async fn create_index_with(&self, spec: IndexSpec) -> Result<()> {
        self.inner.engine.create_index(spec).await
    }

    /// The declarations of all registered indexes.
    pub fn indexes(&self) -> Vec<IndexSpec> {
        self.inner
            .engine
            .indexes()
            .list()
            .iter()
            .map(|i| i.spec().clone())
            .collect()
    }

    /// The engine configuration.
    pub fn config(&self) -> &DatabaseConfig {
        self.inner.engine.config()
    }

    /// Direct access to the storage engine, for backends, tools and tests
    /// that need to bypass the reference surface.
    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.inner.engine
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("engine", &self.inner.engine)
            .finish()
    }
}
