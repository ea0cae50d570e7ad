//! Deployment pipeline
//!
//! Moves a branch of a revision source onto a transport target. A run is a
//! fixed sequence of stages; a failing stage aborts the run with exactly one
//! abort line on the progress channel and a [`StageFailure`]. Individual file
//! transfers and tasks are best effort and never abort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::deploy::paths::{marker_path, remote_path};
use crate::deploy::stage::{RunOutcome, Stage, StageFailure};
use crate::deploy::tasks::run_tasks;
use crate::errors::DeployError;
use crate::events::{EventBus, LifecycleContext, LifecycleEvent};
use crate::models::deployment::{DeploymentSpec, TaskTiming};
use crate::models::revision::{ChangeEntry, ChangeKind, ChangeSet, Revision};
use crate::progress::ProgressReporter;
use crate::source::RevisionSource;
use crate::target::TransportTarget;

/// Counters of the best-effort transfer step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub uploaded: usize,
    pub upload_failures: usize,
    pub deleted: usize,
    pub delete_failures: usize,
}

impl TransferSummary {
    pub fn failures(&self) -> usize {
        self.upload_failures + self.delete_failures
    }
}

/// Requests cancellation of a run that has not reached its prerequisites check
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Builder for [`Pipeline`]
#[derive(Default)]
pub struct PipelineBuilder {
    source: Option<Arc<dyn RevisionSource>>,
    target: Option<Arc<dyn TransportTarget>>,
    events: Option<Arc<EventBus>>,
    progress: Option<ProgressReporter>,
}

impl PipelineBuilder {
    pub fn source(mut self, source: Arc<dyn RevisionSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn target(mut self, target: Arc<dyn TransportTarget>) -> Self {
        self.target = Some(target);
        self
    }

    /// Shared event bus; a private one is used when not set
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn build(self) -> Result<Pipeline, DeployError> {
        let source = self
            .source
            .ok_or_else(|| DeployError::ConfigError("Revision source not bound".to_string()))?;
        let target = self
            .target
            .ok_or_else(|| DeployError::ConfigError("Transport target not bound".to_string()))?;
        let progress = self
            .progress
            .ok_or_else(|| DeployError::ConfigError("Progress reporter not bound".to_string()))?;

        Ok(Pipeline {
            source,
            target,
            events: self.events.unwrap_or_default(),
            progress,
            cancel: CancelHandle::default(),
        })
    }
}

/// Deployment execution engine bound to one source and one target
pub struct Pipeline {
    source: Arc<dyn RevisionSource>,
    target: Arc<dyn TransportTarget>,
    events: Arc<EventBus>,
    progress: ProgressReporter,
    cancel: CancelHandle,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Execute a deployment. `list_mode` overrides `spec.list_only` when set.
    pub async fn run(
        &self,
        spec: &DeploymentSpec,
        list_mode: Option<bool>,
    ) -> Result<RunOutcome, StageFailure> {
        let run_id = Uuid::new_v4();
        let list_mode = list_mode.unwrap_or(spec.list_only);
        let span = info_span!(
            "deployment",
            run_id = %run_id,
            deployment = %spec.deployment_id,
            list_mode
        );
        self.execute(run_id, spec, list_mode).instrument(span).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        spec: &DeploymentSpec,
        list_mode: bool,
    ) -> Result<RunOutcome, StageFailure> {
        info!("Starting deployment {} of branch {}", spec.deployment_id, spec.branch);
        let base = LifecycleContext::new(run_id, spec, list_mode);

        self.stage(Stage::Validate, self.validate(spec))?;
        self.emit(LifecycleEvent::Started, &base);

        self.progress.log(Stage::CheckPrerequisites.start_message());
        let result = self.check_prerequisites().await;
        self.stage(Stage::CheckPrerequisites, result)?;

        self.progress.log(Stage::SwitchBranch.start_message());
        let result = self.source.switch_branch(&spec.branch).await;
        self.stage(Stage::SwitchBranch, result)?;

        self.progress.log(Stage::PrepareRepository.start_message());
        let result = self.prepare_repository().await;
        self.stage(Stage::PrepareRepository, result)?;

        self.progress.log(Stage::ResolveRemoteRevision.start_message());
        let result = self.resolve_remote_revision(spec).await;
        let remote = self.stage(Stage::ResolveRemoteRevision, result)?;

        self.progress.log(Stage::ResolveLocalRevision.start_message());
        let result = self.resolve_local_revision(spec).await;
        let local = self.stage(Stage::ResolveLocalRevision, result)?;

        let with_revisions = LifecycleContext {
            local_revision: Some(&local),
            remote_revision: Some(&remote),
            ..base
        };
        self.emit(LifecycleEvent::PreparationCompleted, &with_revisions);

        if local == remote {
            if !list_mode {
                self.progress.info("Remote server is already up to date.");
            }
            info!("Deployment {} is up to date at {}", spec.deployment_id, local);
            return Ok(RunOutcome::UpToDate);
        }

        self.progress.log(Stage::CollectChangedFiles.start_message());
        let result = self.collect_changed_files(&local, &remote).await;
        let changes = self.stage(Stage::CollectChangedFiles, result)?;
        self.emit(
            LifecycleEvent::ChangedFilesCollected,
            &LifecycleContext {
                changes: Some(&changes),
                ..with_revisions
            },
        );

        if list_mode {
            return Ok(RunOutcome::ChangesListed(ChangeSet::partition(&changes)));
        }

        self.progress.log("Sorting changed files...");
        let change_set = ChangeSet::partition(&changes);
        let with_changes = LifecycleContext {
            changes: Some(&changes),
            change_set: Some(&change_set),
            ..with_revisions
        };
        self.emit(LifecycleEvent::ChangedFilesSorted, &with_changes);

        let remote_dir = remote_path(self.target.root_path(), &spec.target_path);
        self.execute_tasks(spec, TaskTiming::Before, &remote_dir).await;

        self.progress.log("Processing changed files...");
        let summary = self.process_changed_files(&change_set, &remote_dir).await;
        if summary.failures() > 0 {
            warn!(
                "{} of {} file operations failed",
                summary.failures(),
                change_set.len()
            );
        }
        self.emit(LifecycleEvent::ChangedFilesProcessed, &with_changes);

        self.progress.log(Stage::UpdateRemoteRevisionMarker.start_message());
        let result = self.update_remote_revision_file(spec, &local).await;
        self.stage(Stage::UpdateRemoteRevisionMarker, result)?;

        self.execute_tasks(spec, TaskTiming::After, &remote_dir).await;
        self.emit(LifecycleEvent::Completed, &with_changes);

        self.progress.success("Deployment successfully completed.");
        info!("Deployment {} completed at {}", spec.deployment_id, local);
        Ok(RunOutcome::Deployed(change_set))
    }

    /// Map a stage result, reporting the abort when it failed
    fn stage<T>(&self, stage: Stage, result: Result<T, DeployError>) -> Result<T, StageFailure> {
        result.map_err(|cause| {
            error!("Stage {} failed: {}", stage, cause);
            self.progress.send(stage.abort_severity(), stage.abort_message());
            StageFailure::new(stage, cause)
        })
    }

    fn emit(&self, event: LifecycleEvent, ctx: &LifecycleContext<'_>) {
        debug!("Emitting {}", event);
        if let Err(e) = self.events.emit(event, ctx) {
            warn!("{}", e);
        }
    }

    fn validate(&self, spec: &DeploymentSpec) -> Result<(), DeployError> {
        spec.validate()?;
        if self.cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        Ok(())
    }

    /// All three checks always run; the first failure is reported
    async fn check_prerequisites(&self) -> Result<(), DeployError> {
        self.progress.log("Checking git binary...");
        let git = self.source.check_git().await;
        if let Err(e) = &git {
            warn!("Git check failed: {}", e);
            self.progress.danger("Git executable not found.");
        }

        self.progress.log("Checking connection to repository...");
        let repository = self.source.check_connectivity().await;
        if let Err(e) = &repository {
            warn!("Repository check failed: {}", e);
            self.progress.danger("Connection to repository failed.");
        }

        self.progress.log("Checking connection to target server...");
        let server = self.target.check_connectivity().await;
        if let Err(e) = &server {
            warn!("Server check failed: {}", e);
            self.progress.danger("Connection to remote server failed.");
        }

        git.and(repository).and(server)
    }

    /// Clone a missing working copy, otherwise pull and prune
    async fn prepare_repository(&self) -> Result<(), DeployError> {
        if !self.source.exists().await {
            return self.source.clone_repository().await.inspect_err(|_| {
                self.progress.danger("Error while cloning repository.");
            });
        }

        self.source.pull().await.inspect_err(|_| {
            self.progress.danger("Error while updating repository.");
        })?;

        // A stale remote-tracking ref does not affect the deployed tree
        if let Err(e) = self.source.prune().await {
            warn!("git remote prune failed: {}", e);
            self.progress.log("Possible error during git remote prune.");
        }
        Ok(())
    }

    /// Revision recorded on the target, or the never-deployed sentinel for an
    /// empty target directory
    pub async fn resolve_remote_revision(&self, spec: &DeploymentSpec) -> Result<Revision, DeployError> {
        let remote_dir = remote_path(self.target.root_path(), &spec.target_path);

        match self.target.read_file(&marker_path(&remote_dir)).await {
            Ok(content) => {
                if let Some(revision) = Revision::parse(&content) {
                    self.progress
                        .info(format!("Remote server is at revision: {}", revision));
                    return Ok(revision);
                }
                debug!("Ignoring malformed revision marker in {}", remote_dir);
            }
            Err(e) => debug!("No revision marker in {}: {}", remote_dir, e),
        }

        match self.target.list_dir(&remote_dir).await {
            Ok(entries) if entries.is_empty() => {
                self.progress.info("Target path is empty. No revision yet.");
                Ok(Revision::never_deployed())
            }
            Ok(entries) => Err(DeployError::RevisionError(format!(
                "{} contains {} entries but no valid revision marker",
                remote_dir,
                entries.len()
            ))),
            Err(e) => {
                self.progress
                    .danger("Target path on remote server not found or not accessible.");
                Err(DeployError::RevisionError(format!("{}: {}", remote_dir, e)))
            }
        }
    }

    /// Commit the deployment branch currently points to
    pub async fn resolve_local_revision(&self, spec: &DeploymentSpec) -> Result<Revision, DeployError> {
        let revision = self
            .source
            .remote_revision(&spec.branch)
            .await
            .inspect_err(|_| self.progress.danger("Local revision not found."))?;

        if !revision.is_commit() {
            self.progress.danger("Local revision not found.");
            return Err(DeployError::RevisionError(format!(
                "No commit found for branch {}",
                spec.branch
            )));
        }

        self.progress
            .info(format!("Local repository is at revision: {}", revision));
        Ok(revision)
    }

    async fn collect_changed_files(
        &self,
        local: &Revision,
        remote: &Revision,
    ) -> Result<Vec<ChangeEntry>, DeployError> {
        let changes: Vec<ChangeEntry> = if remote.is_never_deployed() {
            self.source
                .list_files()
                .await?
                .into_iter()
                .map(|path| ChangeEntry::new(ChangeKind::Added, path))
                .collect()
        } else {
            let lines = self.source.get_diff(local, remote).await?;
            ChangeEntry::parse_diff(&lines)
        };

        if changes.is_empty() {
            return Err(DeployError::RevisionError(format!(
                "No changed files between {} and {}",
                remote, local
            )));
        }
        debug!("Collected {} changed files", changes.len());
        Ok(changes)
    }

    /// Uploads first, then deletes. Failures are reported and counted only.
    async fn process_changed_files(&self, change_set: &ChangeSet, remote_dir: &str) -> TransferSummary {
        let mut summary = TransferSummary::default();
        let upload_count = change_set.to_upload.len();
        let delete_count = change_set.to_delete.len();

        if upload_count == 0 && delete_count == 0 {
            self.progress.info("Nothing to upload or delete.");
            return summary;
        }
        self.progress.info(format!(
            "Files to upload: {} - Files to delete: {} - processing...",
            upload_count, delete_count
        ));

        let local_dir = self.source.local_path();
        for file in &change_set.to_upload {
            let started = Instant::now();
            let result = self
                .target
                .upload(&local_dir.join(file), &format!("{}{}", remote_dir, file))
                .await;
            let duration = started.elapsed().as_secs_f64();
            match result {
                Ok(()) => {
                    self.progress
                        .info(format!("Uploading {}: success ({:.2}s)", file, duration));
                    summary.uploaded += 1;
                }
                Err(e) => {
                    warn!("Upload of {} failed: {}", file, e);
                    self.progress.danger(format!("Uploading {}: failed", file));
                    summary.upload_failures += 1;
                }
            }
        }

        if delete_count > 0 {
            self.progress.log("Removing files...");
            for file in &change_set.to_delete {
                match self.target.delete(&format!("{}{}", remote_dir, file)).await {
                    Ok(()) => {
                        self.progress.info(format!("Deleting {}: success", file));
                        summary.deleted += 1;
                    }
                    Err(e) => {
                        warn!("Delete of {} failed: {}", file, e);
                        self.progress.danger(format!("Deleting {}: failed", file));
                        summary.delete_failures += 1;
                    }
                }
            }
        }

        self.progress.info("Processing files completed.");
        summary
    }

    /// Write `revision` into the target's marker file
    pub async fn update_remote_revision_file(
        &self,
        spec: &DeploymentSpec,
        revision: &Revision,
    ) -> Result<(), DeployError> {
        let remote_dir = remote_path(self.target.root_path(), &spec.target_path);
        self.target
            .put_content(revision.as_str(), &marker_path(&remote_dir))
            .await
            .map_err(|e| DeployError::MarkerWriteError(e.to_string()))
    }

    /// Unified diff of one file between two deployed revisions
    pub async fn file_diff(
        &self,
        path: &str,
        local: &Revision,
        remote: &Revision,
    ) -> Result<String, DeployError> {
        if !local.is_commit() || !remote.is_commit() {
            return Err(DeployError::RevisionError(format!(
                "Cannot diff {} between {} and {}",
                path, remote, local
            )));
        }
        self.source.file_diff(path, local, remote).await
    }

    async fn execute_tasks(&self, spec: &DeploymentSpec, timing: TaskTiming, remote_dir: &str) {
        let tasks = spec.effective_tasks(timing);
        if tasks.is_empty() {
            return;
        }
        let report = run_tasks(self.target.as_ref(), &self.progress, &tasks, remote_dir).await;
        if report.failed > 0 {
            warn!("{} of {} {:?} tasks failed", report.failed, tasks.len(), timing);
        }
    }
}
