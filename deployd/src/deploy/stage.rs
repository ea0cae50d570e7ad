//! Pipeline stages and run results

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::DeployError;
use crate::models::progress::Severity;
use crate::models::revision::ChangeSet;

/// Abortable steps of a deployment run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Validate,
    CheckPrerequisites,
    SwitchBranch,
    PrepareRepository,
    ResolveRemoteRevision,
    ResolveLocalRevision,
    CollectChangedFiles,
    UpdateRemoteRevisionMarker,
}

impl Stage {
    /// Progress line sent when the stage starts
    pub fn start_message(&self) -> &'static str {
        match self {
            Stage::Validate => "Validating deployment...",
            Stage::CheckPrerequisites => "Checking prerequisites...",
            Stage::SwitchBranch => "Switching branch...",
            Stage::PrepareRepository => "Preparing local repository...",
            Stage::ResolveRemoteRevision => "Estimating remote revision...",
            Stage::ResolveLocalRevision => "Estimating local revision...",
            Stage::CollectChangedFiles => "Collecting changed files...",
            Stage::UpdateRemoteRevisionMarker => "Updating revision file...",
        }
    }

    /// Progress line sent when the stage aborts the run
    pub fn abort_message(&self) -> &'static str {
        match self {
            Stage::Validate => "Invalid deployment configuration. Aborting job.",
            Stage::CheckPrerequisites => "Prerequisites check failed. Aborting job.",
            Stage::SwitchBranch => "Could not switch to selected branch. Aborting job.",
            Stage::PrepareRepository => "Preparation of local repository failed. Aborting job.",
            Stage::ResolveRemoteRevision => "Could not estimate remote revision. Aborting job.",
            Stage::ResolveLocalRevision => "Could not estimate local revision. Aborting job.",
            Stage::CollectChangedFiles => "Could not collect changed files. Aborting job.",
            Stage::UpdateRemoteRevisionMarker => {
                "Could not update remote revision file. Aborting job."
            }
        }
    }

    /// Severity of the abort line. Validation failures are contract violations.
    pub fn abort_severity(&self) -> Severity {
        match self {
            Stage::Validate => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::CheckPrerequisites => "check prerequisites",
            Stage::SwitchBranch => "switch branch",
            Stage::PrepareRepository => "prepare repository",
            Stage::ResolveRemoteRevision => "resolve remote revision",
            Stage::ResolveLocalRevision => "resolve local revision",
            Stage::CollectChangedFiles => "collect changed files",
            Stage::UpdateRemoteRevisionMarker => "update revision marker",
        };
        f.write_str(name)
    }
}

/// Successful end of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "changes", rename_all = "camelCase")]
pub enum RunOutcome {
    /// Remote already at the local revision; nothing was touched
    UpToDate,
    /// List mode: the changes a deployment would apply
    ChangesListed(ChangeSet),
    /// Files were transferred and the marker updated
    Deployed(ChangeSet),
}

/// The only error a run returns: which stage aborted and why
#[derive(Error, Debug)]
#[error("Deployment aborted at {stage}: {cause}")]
pub struct StageFailure {
    pub stage: Stage,
    pub cause: DeployError,
}

impl StageFailure {
    pub fn new(stage: Stage, cause: DeployError) -> Self {
        Self { stage, cause }
    }

    pub fn is_retryable(&self) -> bool {
        self.cause.is_retryable()
    }
}
