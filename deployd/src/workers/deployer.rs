//! Deployment worker
//!
//! Receives deployment jobs from the triggers (relay, CLI), resolves them
//! against the settings and runs each one as its own task. Runs that write to
//! the same target directory are serialized.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::app::state::AppState;
use crate::deploy::paths::remote_path;
use crate::deploy::{Pipeline, RunOutcome};
use crate::errors::DeployError;
use crate::models::deployment::Initiator;
use crate::models::progress::ClientId;
use crate::progress::ProgressReporter;
use crate::{source, target};

/// Deployer worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum number of runs executing at once
    pub max_concurrent_runs: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
        }
    }
}

/// A request to run a configured deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentJob {
    pub deployment_id: String,
    pub client_id: ClientId,
    pub initiator: Initiator,
    /// Overrides the list mode of the deployment when set
    pub list_mode: Option<bool>,
    pub selected_tasks: Vec<String>,
}

pub type JobSender = mpsc::UnboundedSender<DeploymentJob>;
pub type JobReceiver = mpsc::UnboundedReceiver<DeploymentJob>;

/// Per-target run locks keyed by server id and remote directory, plus the
/// limit on runs executing at once
pub struct RunLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    permits: Arc<Semaphore>,
}

/// Held for the duration of one run
pub struct RunGuard {
    _target: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

impl Default for RunLocks {
    fn default() -> Self {
        Self::new(Options::default().max_concurrent_runs)
    }
}

impl RunLocks {
    pub fn new(max_concurrent_runs: usize) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
        }
    }

    /// Take the target lock, then a run permit. `on_wait` is called when the
    /// target is busy. Runs queued behind a busy target hold no permit.
    pub async fn acquire(
        &self,
        server_id: &str,
        remote_dir: &str,
        on_wait: impl FnOnce(),
    ) -> Result<RunGuard, DeployError> {
        let lock = self.lock_for(server_id, remote_dir);
        let target = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                on_wait();
                lock.lock_owned().await
            }
        };
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DeployError::ShutdownError("Run limiter closed".to_string()))?;
        Ok(RunGuard {
            _target: target,
            _permit: permit,
        })
    }

    pub fn lock_for(&self, server_id: &str, remote_dir: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{}:{}", server_id, remote_dir);
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key).or_default().clone()
    }
}

/// Run the deployer worker
pub async fn run(
    options: &Options,
    state: Arc<AppState>,
    mut jobs: JobReceiver,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Deployer worker starting...");

    let locks = Arc::new(RunLocks::new(options.max_concurrent_runs));
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Deployer worker shutting down...");
                break;
            }
            job = jobs.recv() => {
                let Some(job) = job else {
                    debug!("Job queue closed");
                    break;
                };
                info!("Received deployment job: {} for {}", job.deployment_id, job.client_id);

                let state = state.clone();
                let locks = locks.clone();
                running.spawn(async move {
                    let reporter = state.progress.reporter(job.client_id.clone());
                    if let Err(e) = execute_job(&state, &locks, &job, &reporter).await {
                        error!("Deployment {} failed: {}", job.deployment_id, e);
                    }
                });
            }
            Some(finished) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = finished {
                    error!("Deployment task panicked: {}", e);
                }
            }
        }
    }

    // Let in-flight runs finish; a half-written target is worse than a slow shutdown
    if !running.is_empty() {
        info!("Waiting for {} running deployments...", running.len());
    }
    while let Some(finished) = running.join_next().await {
        if let Err(e) = finished {
            error!("Deployment task panicked: {}", e);
        }
    }
}

/// Resolve a job against the settings and run it
pub async fn execute_job(
    state: &AppState,
    locks: &RunLocks,
    job: &DeploymentJob,
    reporter: &ProgressReporter,
) -> Result<RunOutcome, DeployError> {
    let settings = &state.settings;
    let prepared = settings
        .deployment_spec(
            &job.deployment_id,
            job.initiator,
            job.list_mode.unwrap_or(false),
            job.selected_tasks.clone(),
        )
        .and_then(|spec| {
            let source = source::open(settings.repository(&spec.repository_id)?, &state.layout)?;
            let target = target::connect(settings.server(&spec.server_id)?)?;
            Ok((spec, source, target))
        });
    let (spec, source, target) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            reporter.error(format!("Deployment could not be started: {}", e));
            return Err(e);
        }
    };

    let remote_dir = remote_path(target.root_path(), &spec.target_path);
    let _guard = locks
        .acquire(&spec.server_id, &remote_dir, || {
            reporter.log("Another deployment to this target is running. Waiting...");
        })
        .await?;

    let pipeline = Pipeline::builder()
        .source(source)
        .target(target)
        .events(state.events.clone())
        .progress(reporter.clone())
        .build()?;

    let outcome = pipeline.run(&spec, job.list_mode).await.map_err(|failure| {
        warn!("Deployment {} aborted at {}", spec.deployment_id, failure.stage);
        failure.cause
    })?;

    if let RunOutcome::ChangesListed(changes) = &outcome {
        report_changes(reporter, changes);
    }
    Ok(outcome)
}

/// List-mode answer for the requesting client
fn report_changes(reporter: &ProgressReporter, changes: &crate::models::revision::ChangeSet) {
    reporter.info(format!(
        "Files to upload: {} - Files to delete: {}",
        changes.to_upload.len(),
        changes.to_delete.len()
    ));
    for path in &changes.to_upload {
        reporter.info(format!("upload: {}", path));
    }
    for path in &changes.to_delete {
        reporter.info(format!("delete: {}", path));
    }
}
