//! Error types for deployd

use thiserror::Error;

/// Main error type for deployd
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Bad or incomplete deployment configuration. Never retried.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Git binary, repository or target server not reachable
    #[error("Connectivity error: {0}")]
    ConnectivityError(String),

    /// Remote marker missing, corrupt or ambiguous, or local revision unknown
    #[error("Revision resolution error: {0}")]
    RevisionError(String),

    /// A single file upload or delete failed
    #[error("Transfer error: {0}")]
    TransferError(String),

    /// The final REVISION update failed after files were transferred
    #[error("Marker write error: {0}")]
    MarkerWriteError(String),

    #[error("Git error: {0}")]
    GitError(String),

    #[error("Remote error: {0}")]
    RemoteError(String),

    #[error("Relay error: {0}")]
    RelayError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Deployment cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Whether a later run of the same deployment may succeed without
    /// configuration changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeployError::ConnectivityError(_)
                | DeployError::RevisionError(_)
                | DeployError::MarkerWriteError(_)
                | DeployError::GitError(_)
                | DeployError::RemoteError(_)
                | DeployError::IoError(_)
        )
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}
