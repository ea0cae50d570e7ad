//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::deploy::RunOutcome;
use crate::errors::DeployError;
use crate::models::deployment::Initiator;
use crate::models::progress::ClientId;
use crate::progress::{dispatch, ConsoleSink, ProgressChannel, ProgressSink, RelaySink};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::deployer::{self, DeploymentJob, RunLocks};
use crate::workers::relay;

/// Run deployd as a daemon until `shutdown_signal` resolves
pub async fn run(
    version: String,
    options: AppOptions,
    settings: Arc<Settings>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DeployError> {
    info!("Initializing deployd {}...", version);
    options.storage.setup().await?;

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let (progress, progress_rx) = ProgressChannel::new();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

    let sink: Box<dyn ProgressSink> = if options.enable_relay_worker {
        Box::new(RelaySink::new(outbound_tx))
    } else {
        Box::new(ConsoleSink)
    };
    shutdown_manager.with_dispatcher_handle(tokio::spawn(dispatch(progress_rx, sink)))?;

    let state = Arc::new(AppState::new(
        version,
        settings.clone(),
        options.storage.clone(),
        progress,
    ));

    init_deployer_worker(
        options.deployer.clone(),
        state.clone(),
        jobs_rx,
        &mut shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if options.enable_relay_worker {
        init_relay_worker(
            options.relay_worker.clone(),
            settings,
            jobs_tx,
            outbound_rx,
            &mut shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    } else {
        info!("No relay configured, waiting for shutdown");
        drop(jobs_tx);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(state);
    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

/// Run a single deployment in the foreground, printing progress to the terminal
pub async fn deploy_once(
    settings: Arc<Settings>,
    layout: StorageLayout,
    deployment_id: &str,
    list_mode: bool,
) -> Result<RunOutcome, DeployError> {
    layout.setup().await?;

    let (progress, progress_rx) = ProgressChannel::new();
    let dispatcher = tokio::spawn(dispatch(progress_rx, ConsoleSink));

    let state = AppState::new(
        crate::utils::version_info().version,
        settings,
        layout,
        progress,
    );
    let job = DeploymentJob {
        deployment_id: deployment_id.to_string(),
        client_id: ClientId::new("cli"),
        initiator: Initiator::Api,
        list_mode: Some(list_mode),
        selected_tasks: vec![],
    };
    let reporter = state.progress.reporter(job.client_id.clone());
    let result = deployer::execute_job(&state, &RunLocks::default(), &job, &reporter).await;

    // Flush the remaining progress lines before returning
    drop(reporter);
    drop(state);
    if let Err(e) = dispatcher.await {
        error!("Progress dispatcher failed: {}", e);
    }
    result
}

// =============================== INITIALIZATION ================================== //

fn init_deployer_worker(
    options: deployer::Options,
    state: Arc<AppState>,
    jobs: deployer::JobReceiver,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing deployer worker...");

    let deployer_handle = tokio::spawn(async move {
        deployer::run(
            &options,
            state,
            jobs,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_deployer_worker_handle(deployer_handle)
}

fn init_relay_worker(
    options: relay::Options,
    settings: Arc<Settings>,
    jobs: deployer::JobSender,
    outbound: mpsc::UnboundedReceiver<tokio_tungstenite::tungstenite::protocol::Message>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing relay worker...");

    let relay_handle = tokio::spawn(async move {
        relay::run(
            &options,
            settings,
            jobs,
            outbound,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_relay_worker_handle(relay_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    deployer_worker_handle: Option<JoinHandle<()>>,
    relay_worker_handle: Option<JoinHandle<()>>,
    dispatcher_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            deployer_worker_handle: None,
            relay_worker_handle: None,
            dispatcher_handle: None,
        }
    }

    pub fn with_deployer_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeployError> {
        if self.deployer_worker_handle.is_some() {
            return Err(DeployError::ShutdownError("deployer_handle already set".to_string()));
        }
        self.deployer_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_relay_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeployError> {
        if self.relay_worker_handle.is_some() {
            return Err(DeployError::ShutdownError("relay_handle already set".to_string()));
        }
        self.relay_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_dispatcher_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeployError> {
        if self.dispatcher_handle.is_some() {
            return Err(DeployError::ShutdownError("dispatcher_handle already set".to_string()));
        }
        self.dispatcher_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), DeployError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), DeployError> {
        info!("Shutting down deployd...");

        // 1. Deployer worker (waits for running deployments)
        if let Some(handle) = self.deployer_worker_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))?;
        }

        // 2. Relay worker
        if let Some(handle) = self.relay_worker_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))?;
        }

        // 3. Progress dispatcher; its queue may still hold lines nobody can receive
        if let Some(handle) = self.dispatcher_handle.take() {
            handle.abort();
        }

        info!("Shutdown complete");
        Ok(())
    }
}
