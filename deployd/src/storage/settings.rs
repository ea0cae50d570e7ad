//! Settings file management
//!
//! Repositories, servers and deployments are defined in the settings file;
//! managing those records is left to whatever writes the file.

use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::DeployError;
use crate::logs::LogLevel;
use crate::models::deployment::{DeploymentSpec, Initiator, TaskDefinition};

/// deployd settings
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Directory for rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Base directory for local working copies and state
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// Websocket relay the web gateway exposes for workers
    #[serde(default)]
    pub relay: Option<RelaySettings>,

    /// Maximum number of deployments running at the same time
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub deployments: Vec<DeploymentConfig>,
}

fn default_max_concurrent_runs() -> usize {
    4
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            storage_dir: None,
            relay: None,
            max_concurrent_runs: default_max_concurrent_runs(),
            repositories: Vec::new(),
            servers: Vec::new(),
            deployments: Vec::new(),
        }
    }
}

impl Settings {
    pub fn repository(&self, id: &str) -> Result<&RepositoryConfig, DeployError> {
        self.repositories
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| DeployError::NotFound(format!("Repository {}", id)))
    }

    pub fn server(&self, id: &str) -> Result<&ServerConfig, DeployError> {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| DeployError::NotFound(format!("Server {}", id)))
    }

    pub fn deployment(&self, id: &str) -> Result<&DeploymentConfig, DeployError> {
        self.deployments
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| DeployError::NotFound(format!("Deployment {}", id)))
    }

    /// Build the immutable run configuration for a configured deployment
    pub fn deployment_spec(
        &self,
        deployment_id: &str,
        initiator: Initiator,
        list_only: bool,
        selected_tasks: Vec<String>,
    ) -> Result<DeploymentSpec, DeployError> {
        let deployment = self.deployment(deployment_id)?;
        // Referenced records must exist before a run is attempted
        self.repository(&deployment.repository_id)?;
        self.server(&deployment.server_id)?;

        Ok(DeploymentSpec {
            deployment_id: deployment.id.clone(),
            repository_id: deployment.repository_id.clone(),
            server_id: deployment.server_id.clone(),
            branch: deployment.branch.clone(),
            target_path: deployment.target_path.clone(),
            initiator,
            list_only,
            selected_tasks,
            tasks: deployment.tasks.clone(),
        })
    }
}

/// Websocket relay settings
#[derive(Debug, Deserialize)]
pub struct RelaySettings {
    /// Gateway base URL (http/https/ws/wss)
    pub url: String,

    /// Worker token sent on connect
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub token: Option<SecretString>,

    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_reconnect_secs() -> u64 {
    5
}

fn default_heartbeat_secs() -> u64 {
    30
}

/// A git repository deployments pull from
#[derive(Debug, Deserialize)]
pub struct RepositoryConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
}

/// Supported transport kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// OpenSSH client with key authentication
    Ssh,
    /// Directory on this host
    Local,
}

/// A deployment target server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<String>,
    pub root_path: String,
}

fn default_ssh_port() -> u16 {
    22
}

/// A deployment: which branch of which repository goes where
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub repository_id: String,
    pub server_id: String,
    pub branch: String,
    #[serde(default)]
    pub target_path: String,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()).map(SecretString::from))
}
