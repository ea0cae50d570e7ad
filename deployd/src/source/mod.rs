//! Revision source capability
//!
//! Everything the pipeline needs from version control: connectivity checks,
//! maintaining the local working copy, and resolving revisions and changes.

pub mod git;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::DeployError;
use crate::models::revision::Revision;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::RepositoryConfig;

pub use git::GitRepository;

/// Version-control side of a deployment
#[async_trait]
pub trait RevisionSource: Send + Sync {
    /// Verify the git executable is usable
    async fn check_git(&self) -> Result<(), DeployError>;

    /// Verify the remote repository is reachable with the configured credentials
    async fn check_connectivity(&self) -> Result<(), DeployError>;

    /// Whether a local working copy exists
    async fn exists(&self) -> bool;

    async fn clone_repository(&self) -> Result<(), DeployError>;

    async fn pull(&self) -> Result<(), DeployError>;

    /// Remove stale remote-tracking refs
    async fn prune(&self) -> Result<(), DeployError>;

    async fn switch_branch(&self, branch: &str) -> Result<(), DeployError>;

    /// Commit `branch` currently points to at the remote
    async fn remote_revision(&self, branch: &str) -> Result<Revision, DeployError>;

    /// Tracked files of the working copy, repository-relative
    async fn list_files(&self) -> Result<Vec<String>, DeployError>;

    /// Name-status lines between `remote` and `local`
    async fn get_diff(&self, local: &Revision, remote: &Revision) -> Result<Vec<String>, DeployError>;

    /// Unified diff of one file between `remote` and `local`
    async fn file_diff(&self, path: &str, local: &Revision, remote: &Revision) -> Result<String, DeployError>;

    fn local_path(&self) -> &Path;
}

/// Open the revision source for a configured repository.
///
/// Credentials travel with `config`; nothing is read from ambient state.
pub fn open(config: &RepositoryConfig, layout: &StorageLayout) -> Result<Arc<dyn RevisionSource>, DeployError> {
    let local_path = layout.working_copy(&config.id).path().to_path_buf();
    let repository = GitRepository::new(config, local_path)?;
    Ok(Arc::new(repository))
}
