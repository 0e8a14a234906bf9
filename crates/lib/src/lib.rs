//!
//! arbordb: an embedded hierarchical realtime database.
//! This library models all data as a single JSON-like tree whose nodes are
//! addressed by slash-separated paths; clients read, write, observe, and
//! query arbitrary sub-trees.
//!
//! ## Core Concepts
//!
//! * **Paths (`path::PathBuf`)**: canonical addresses of nodes, with `*` and
//!   `$name` wildcards for patterns and `[n]` array indices.
//! * **Values (`value::Value`)**: the nine node kinds, including datetimes,
//!   binary data and path references, with a tagged wire codec.
//! * **Backends (`backend::StorageBackend`)**: a pluggable storage layer
//!   persisting one record per node; the same engine semantics apply over
//!   any key/value store.
//! * **The engine (`storage::StorageEngine`)**: path reads and writes with
//!   inline-vs-dedicated record placement, tree-wide locking, and precise
//!   old/new images for events.
//! * **Events (`subscription`, `events`)**: typed subscriptions on path
//!   patterns, delivered through bounded streams from a dedicated dispatch
//!   task.
//! * **Indexes (`index`)**: normal, array, fulltext and geo indexes,
//!   maintained incrementally on every mutation.
//! * **Queries (`query`)**: filtered, sorted, paginated child queries that
//!   cooperate with indexes and optionally track live matches.
//! * **The public surface (`api`)**: `Database` and `DataReference`, the
//!   ergonomic face over all of the above.

pub mod api;
pub mod backend;
pub mod config;
pub mod events;
pub mod index;
pub mod lock;
pub mod path;
pub mod query;
pub mod storage;
pub mod subscription;
pub mod value;

pub use api::{DataReference, DataSnapshot, Database};
pub use config::DatabaseConfig;

/// Result type used throughout the arbordb library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the arbordb library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Structured path validation errors.
    #[error(transparent)]
    Path(#[from] path::PathError),

    /// Structured value and codec errors.
    #[error(transparent)]
    Value(#[from] value::ValueError),

    /// Structured lock errors.
    #[error(transparent)]
    Lock(#[from] lock::LockError),

    /// Structured backend errors.
    #[error(transparent)]
    Backend(#[from] backend::BackendError),

    /// Structured storage engine errors.
    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    /// Structured index errors.
    #[error(transparent)]
    Index(#[from] index::IndexError),

    /// Structured query errors.
    #[error(transparent)]
    Query(#[from] query::QueryError),

    /// A malformed argument that is not covered by a structured error.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Path(_) => "path",
            Error::Value(_) => "value",
            Error::Lock(_) => "lock",
            Error::Backend(_) => "backend",
            Error::Storage(_) => "storage",
            Error::Index(_) => "index",
            Error::Query(_) => "query",
            Error::InvalidArgument(_) => "api",
        }
    }

    /// Check if this error indicates that no node exists at a path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Storage(storage::StorageError::NotFound { .. }))
    }

    /// Check if this error indicates a disallowed operation (wildcard
    /// write, non-object root, root removal).
    pub fn is_not_allowed(&self) -> bool {
        matches!(self, Error::Storage(storage::StorageError::NotAllowed { .. }))
    }

    /// Check if this error indicates a malformed argument: an invalid path,
    /// operator, or option.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::Path(_)
                | Error::Query(
                    query::QueryError::UnknownOperator { .. }
                        | query::QueryError::InvalidCompareValue { .. }
                        | query::QueryError::InvalidFilterKey { .. }
                )
        )
    }

    /// Check if this error indicates an unstorable value.
    pub fn is_invalid_value(&self) -> bool {
        matches!(self, Error::Value(_))
    }

    /// Check if this error indicates a failed optimistic concurrency check.
    pub fn is_revision_mismatch(&self) -> bool {
        matches!(
            self,
            Error::Storage(storage::StorageError::RevisionMismatch { .. })
        )
    }

    /// Check if this error indicates a forcibly removed lock.
    pub fn is_lock_expired(&self) -> bool {
        matches!(self, Error::Lock(lock::LockError::Expired { .. }))
    }

    /// Check if this error was propagated from the storage backend.
    pub fn is_backend_error(&self) -> bool {
        matches!(self, Error::Backend(_))
    }

    /// Check if this error indicates a filter that requires a missing
    /// index.
    pub fn is_index_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Query(query::QueryError::IndexUnavailable { .. })
        )
    }

    /// Check if this error indicates an array mutation that would leave a
    /// gap.
    pub fn is_array_constraint(&self) -> bool {
        matches!(
            self,
            Error::Storage(storage::StorageError::ArrayConstraint { .. })
        )
    }
}
