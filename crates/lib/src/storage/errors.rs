//! Storage engine error types.

use thiserror::Error;

use crate::path::PathBuf;

/// Errors raised by the storage engine's read and write pipelines.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Existing variants will not be removed in minor versions
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StorageError {
    /// No node exists at the path.
    #[error("No node found at '{path}'")]
    NotFound {
        /// The path that was read
        path: PathBuf,
    },

    /// The operation is not allowed on this path: writes through wildcard
    /// paths, non-object values at the root, root removal.
    #[error("Operation not allowed on '{path}': {reason}")]
    NotAllowed {
        /// The rejected path
        path: PathBuf,
        /// Why the operation was rejected
        reason: String,
    },

    /// An optimistic concurrency check failed: the node was changed by
    /// another writer since it was read.
    #[error("Revision mismatch at '{path}': expected {expected}, found {found}")]
    RevisionMismatch {
        /// The contested path
        path: PathBuf,
        /// The revision the caller had read
        expected: String,
        /// The revision actually stored
        found: String,
    },

    /// An array mutation would leave a gap: only trailing elements can be
    /// inserted or removed individually; anything else requires rewriting
    /// the array whole.
    #[error("Array constraint violated at '{path}': {reason}")]
    ArrayConstraint {
        /// The array path
        path: PathBuf,
        /// Which constraint was violated
        reason: String,
    },
}
