//! Backend error types.
//!
//! This module defines structured error types for storage backend
//! operations, providing error context and type safety for the engine and
//! for backend implementations.

use thiserror::Error;

/// Errors that can occur during backend operations.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Existing variants will not be removed in minor versions
/// - Helper methods like `is_*()` provide stable APIs
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BackendError {
    /// A record's wire form could not be produced.
    #[error("Serialization failed")]
    SerializationFailed {
        /// The underlying serialization error
        #[source]
        source: serde_json::Error,
    },

    /// A record's wire form could not be parsed.
    #[error("Deserialization failed")]
    DeserializationFailed {
        /// The underlying deserialization error
        #[source]
        source: serde_json::Error,
    },

    /// A record carried a value that failed to decode.
    #[error("Record value decoding failed")]
    ValueDecode {
        /// The underlying value error
        #[source]
        source: crate::value::ValueError,
    },

    /// File I/O error while persisting or loading backend state.
    #[error("File I/O error")]
    FileIo {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A write reached a transaction that was opened read-only.
    #[error("Cannot write through a read-only transaction on '{path}'")]
    ReadOnlyTransaction {
        /// The transaction's target path
        path: String,
    },

    /// Backend-specific failure.
    #[error("Backend '{backend}' failed: {reason}")]
    Failure {
        /// Name of the backend
        backend: String,
        /// Backend-specific description
        reason: String,
    },
}

impl BackendError {
    /// Check if this error is I/O related.
    pub fn is_io_error(&self) -> bool {
        matches!(self, BackendError::FileIo { .. })
    }

    /// Check if this error indicates corrupt or undecodable stored data.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            BackendError::DeserializationFailed { .. } | BackendError::ValueDecode { .. }
        )
    }
}
