//! Index error types.

use thiserror::Error;

/// Errors raised by secondary indexes and the index coordinator.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Existing variants will not be removed in minor versions
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum IndexError {
    /// An operator was passed to an index that does not support it.
    #[error("Index on '{index_path}' key '{key}' does not support operator '{op}'")]
    UnsupportedOperator {
        /// The index's collection path
        index_path: String,
        /// The indexed key
        key: String,
        /// The rejected operator
        op: String,
    },

    /// The compare value does not fit the operator.
    #[error("Invalid compare value for '{op}': {reason}")]
    InvalidCompareValue {
        /// The operator
        op: String,
        /// Why the compare value was rejected
        reason: String,
    },

    /// An index with the same path and key is already registered.
    #[error("An index on '{index_path}' key '{key}' already exists")]
    AlreadyExists {
        /// The index's collection path
        index_path: String,
        /// The indexed key
        key: String,
    },

    /// Building the index over existing data failed.
    #[error("Failed to build index on '{index_path}' key '{key}': {reason}")]
    BuildFailed {
        /// The index's collection path
        index_path: String,
        /// The indexed key
        key: String,
        /// What went wrong
        reason: String,
    },
}
