//! Daemon errors

use crate::registry::OperationId;
use arbor_core::{FsckError, RepoError};

/// Errors surfaced by the operation registry and the daemon loop
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Operation {0} not found")]
    NotFound(OperationId),

    #[error("Permission denied: operation {id} was not started by '{requestor}'")]
    PermissionDenied { id: OperationId, requestor: String },

    #[error("Registry invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Daemon is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single administrative operation
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Fsck(FsckError),

    #[error("{failed} of {total} objects failed verification")]
    Inconsistent { failed: usize, total: u64 },

    #[error("Helper {helper} exited with {status}")]
    Helper { helper: String, status: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<FsckError> for AdminError {
    fn from(err: FsckError) -> Self {
        match err {
            FsckError::Interrupted => AdminError::Cancelled,
            other => AdminError::Fsck(other),
        }
    }
}
