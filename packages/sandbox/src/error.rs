// ABOUTME: Error taxonomy for sandbox orchestration
// ABOUTME: Backend failures are normalized here before reaching callers

use crate::status::ContainerStatus;
use thiserror::Error;

/// Failures reported by a cluster backend, already classified.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    Conflict(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend error: {0}")]
    Other(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, BackendError::Conflict(_))
    }
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Command `{command}` exited with {exit_code}: {message}")]
    ExecFailure {
        command: String,
        exit_code: i64,
        message: String,
    },

    #[error("Sync failed for {} file(s): {}", failed.len(), failed.join(", "))]
    SyncFailure { failed: Vec<String> },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid project id: {0}")]
    InvalidProjectId(String),

    #[error("Sandbox for project {0} is not running")]
    NotRunning(String),

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: ContainerStatus,
        to: ContainerStatus,
    },

    #[error("File store error: {0}")]
    FileStore(#[from] crate::files::FileStoreError),

    #[error("{0}")]
    Unknown(String),
}

impl From<BackendError> for SandboxError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(msg) => SandboxError::NotFound(msg),
            BackendError::Conflict(msg) => SandboxError::Conflict(msg),
            BackendError::Unavailable(msg) => {
                SandboxError::Unknown(format!("backend unavailable: {}", msg))
            }
            BackendError::Other(msg) => SandboxError::Unknown(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
