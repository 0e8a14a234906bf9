//! Lock error types.

use thiserror::Error;

use crate::path::PathBuf;

/// Errors raised by the node lock manager.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Existing variants will not be removed in minor versions
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock was held past its timeout and forcibly removed; the owning
    /// operation must abort.
    #[error("Lock on '{path}' expired ({comment})")]
    Expired {
        /// Path the lock was held on
        path: PathBuf,
        /// The comment the lock was requested with
        comment: String,
    },

    /// The pending request was dropped before it could be granted, normally
    /// because the lock manager shut down.
    #[error("Lock request on '{path}' was aborted")]
    Aborted {
        /// Path the lock was requested on
        path: PathBuf,
    },
}
