//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of deployd state
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn base(&self) -> Dir {
        Dir::new(&self.base_dir)
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        self.base().file("settings.json")
    }

    /// Local working copies, one subdirectory per repository id
    pub fn repositories_dir(&self) -> Dir {
        self.base().subdir("repositories")
    }

    /// Working copy of a single repository
    pub fn working_copy(&self, repository_id: &str) -> Dir {
        self.repositories_dir().subdir(repository_id)
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        self.base().subdir("logs")
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), crate::errors::DeployError> {
        self.repositories_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/deployd");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".deployd");

        Self::new(base_dir)
    }
}
