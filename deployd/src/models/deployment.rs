//! Deployment models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Who requested the deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Initiator {
    /// Webhook / API trigger
    Api,
    /// Interactive user in the web client
    Gui,
}

impl FromStr for Initiator {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(Initiator::Api),
            "gui" => Ok(Initiator::Gui),
            _ => Err(DeployError::ConfigError(format!("Invalid initiator: {}", s))),
        }
    }
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initiator::Api => f.write_str("api"),
            Initiator::Gui => f.write_str("gui"),
        }
    }
}

/// When a task runs relative to the file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskTiming {
    Before,
    After,
}

/// A shell command executed on the target server around a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub command: String,
    pub run_on: TaskTiming,

    /// Default selection; API-initiated runs execute every enabled task
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Immutable configuration of one deployment run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub deployment_id: String,
    pub repository_id: String,
    pub server_id: String,

    /// Branch to deploy, e.g. `master` or `refs/heads/master`
    pub branch: String,

    /// Path below the server root
    pub target_path: String,
    pub initiator: Initiator,

    #[serde(default)]
    pub list_only: bool,

    /// Task ids picked in the web client
    #[serde(default)]
    pub selected_tasks: Vec<String>,

    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

impl DeploymentSpec {
    /// Check that every reference the pipeline relies on is present
    pub fn validate(&self) -> Result<(), DeployError> {
        let required = [
            ("deployment id", &self.deployment_id),
            ("repository id", &self.repository_id),
            ("server id", &self.server_id),
            ("branch", &self.branch),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(DeployError::ConfigError(format!(
                    "Deployment {} is missing",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Check if the deployment branch matches `check_branch`, comparing the
    /// last path segment only (`refs/heads/master` matches `master`).
    pub fn is_branch(&self, check_branch: &str) -> bool {
        self.branch.rsplit('/').next() == Some(check_branch)
    }

    /// Tasks to execute for this run with the given timing
    pub fn effective_tasks(&self, timing: TaskTiming) -> Vec<&TaskDefinition> {
        self.tasks
            .iter()
            .filter(|task| task.run_on == timing)
            .filter(|task| match self.initiator {
                Initiator::Api => task.enabled,
                Initiator::Gui => self.selected_tasks.iter().any(|id| id == &task.id),
            })
            .collect()
    }
}
