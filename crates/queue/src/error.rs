//! Task store error types.

use std::path::PathBuf;

use grab_core::{CoreError, InvalidTransition};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task store {path} is corrupt: {reason}")]
    Corruption { path: PathBuf, reason: String },

    #[error("task store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not lock {path} after {attempts} attempts")]
    LockTimeout { path: PathBuf, attempts: u32 },

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task id prefix '{0}' matches more than one task")]
    Ambiguous(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("invalid task: {0}")]
    Invalid(#[from] CoreError),

    #[error("task {0} changed a field that is fixed at submission")]
    ImmutableField(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl QueueError {
    /// Transient failures worth retrying the whole mutation for.
    /// Lock contention has its own backoff and is not retried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Io(_))
    }
}
