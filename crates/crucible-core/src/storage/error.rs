//! Error types for the storage layer.

use crucible_training::JobStatus;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(#[from] rusqlite::Error),

    /// Job not found in storage.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A status-guarded update found the job in a different state.
    ///
    /// Another actor (usually the sweeper) moved the job first.
    #[error("Conflict on job {job_id}: expected status {expected}, found {actual}")]
    Conflict { job_id: String, expected: String, actual: JobStatus },

    /// The requested transition is not permitted by the status order.
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    /// A stored value could not be decoded.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
