//! Query error types.

use thiserror::Error;

/// Errors raised while planning or executing queries.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Existing variants will not be removed in minor versions
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum QueryError {
    /// A filter needs an index that does not exist: either the query path
    /// contains wildcards and the filter cannot be table-scanned, or the
    /// operator is index-specialized.
    #[error("No index available on '{path}' key '{key}' for operator '{op}'")]
    IndexUnavailable {
        /// The queried collection path
        path: String,
        /// The filter key
        key: String,
        /// The filter operator
        op: String,
    },

    /// The operator is not part of the supported set.
    #[error("Unknown query operator '{op}'")]
    UnknownOperator {
        /// The rejected operator
        op: String,
    },

    /// The compare value does not satisfy the operator's operand contract.
    #[error("Invalid compare value for '{op}': {reason}")]
    InvalidCompareValue {
        /// The operator
        op: String,
        /// Why the operand was rejected
        reason: String,
    },

    /// A filter key is not a valid relative path.
    #[error("Invalid filter key '{key}'")]
    InvalidFilterKey {
        /// The rejected key
        key: String,
        /// The underlying path error
        #[source]
        source: crate::path::PathError,
    },
}
