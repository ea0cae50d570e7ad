//! Transport target capability
//!
//! The remote filesystem a deployment writes to. The implementation is picked
//! once from [`ServerKind`] in [`connect`]; the pipeline only sees the trait.

pub mod local;
pub mod ssh;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::DeployError;
use crate::storage::settings::{ServerConfig, ServerKind};

pub use local::LocalTarget;
pub use ssh::SshTarget;

/// Remote-filesystem side of a deployment. Paths are absolute remote paths.
#[async_trait]
pub trait TransportTarget: Send + Sync {
    async fn check_connectivity(&self) -> Result<(), DeployError>;

    async fn read_file(&self, path: &str) -> Result<String, DeployError>;

    /// Entry names of `path`. An unreadable path is an error, never an empty list.
    async fn list_dir(&self, path: &str) -> Result<Vec<String>, DeployError>;

    /// Copy a local file to `remote_path`, creating missing directories
    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), DeployError>;

    async fn delete(&self, remote_path: &str) -> Result<(), DeployError>;

    /// Write `content` to `remote_path`, replacing any previous content
    async fn put_content(&self, content: &str, remote_path: &str) -> Result<(), DeployError>;

    /// Run a shell command on the target with `cwd` as working directory
    async fn execute(&self, command: &str, cwd: &str) -> Result<String, DeployError>;

    /// Root all deployment paths on this server are relative to
    fn root_path(&self) -> &str;
}

/// Build the transport target for a configured server
pub fn connect(config: &ServerConfig) -> Result<Arc<dyn TransportTarget>, DeployError> {
    let target: Arc<dyn TransportTarget> = match config.kind {
        ServerKind::Ssh => Arc::new(SshTarget::new(config)?),
        ServerKind::Local => Arc::new(LocalTarget::new(&config.root_path)),
    };
    Ok(target)
}
