//! Transport target on the local filesystem

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::target::TransportTarget;

/// Deploys into a directory on this machine (same host or mounted share)
#[derive(Debug, Clone)]
pub struct LocalTarget {
    root_path: String,
}

impl LocalTarget {
    pub fn new(root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
        }
    }
}

#[async_trait]
impl TransportTarget for LocalTarget {
    async fn check_connectivity(&self) -> Result<(), DeployError> {
        if Dir::new(&self.root_path).exists().await {
            Ok(())
        } else {
            Err(DeployError::ConnectivityError(format!(
                "Root path {} does not exist",
                self.root_path
            )))
        }
    }

    async fn read_file(&self, path: &str) -> Result<String, DeployError> {
        File::new(path).read_string().await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, DeployError> {
        Dir::new(path).entry_names().await
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), DeployError> {
        File::new(remote_path)
            .copy_from(local_path)
            .await
            .map(|_| ())
            .map_err(|e| DeployError::TransferError(format!("{}: {}", remote_path, e)))
    }

    async fn delete(&self, remote_path: &str) -> Result<(), DeployError> {
        File::new(remote_path)
            .delete()
            .await
            .map_err(|e| DeployError::TransferError(format!("{}: {}", remote_path, e)))
    }

    async fn put_content(&self, content: &str, remote_path: &str) -> Result<(), DeployError> {
        File::new(remote_path).write_atomic(content.as_bytes()).await
    }

    async fn execute(&self, command: &str, cwd: &str) -> Result<String, DeployError> {
        let output = Command::new("sh")
            .args(["-c", command])
            .current_dir(cwd)
            .output()
            .await?;
        if !output.status.success() {
            return Err(DeployError::RemoteError(format!(
                "Command exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn root_path(&self) -> &str {
        &self.root_path
    }
}
