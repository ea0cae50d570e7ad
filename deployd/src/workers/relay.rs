//! WebSocket relay worker
//!
//! Keeps a connection to the web gateway. Deploy requests arrive on it and
//! progress frames for the requesting clients leave through it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use http::HeaderValue;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::errors::DeployError;
use crate::models::deployment::Initiator;
use crate::models::progress::ClientId;
use crate::storage::settings::{RelaySettings, Settings};
use crate::utils::{calc_exp_backoff, CooldownOptions};
use crate::workers::deployer::{DeploymentJob, JobSender};

/// Relay worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Reconnect delay on failure
    pub reconnect_delay: Duration,

    /// Heartbeat interval
    pub heartbeat_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl From<&RelaySettings> for Options {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            reconnect_delay: Duration::from_secs(settings.reconnect_secs.max(1)),
            heartbeat_interval: Duration::from_secs(settings.heartbeat_secs.max(1)),
        }
    }
}

/// Messages the gateway sends to the worker
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundMessage {
    /// A client asks for a deployment (or its change list)
    #[serde(rename_all = "camelCase")]
    Deploy {
        deployment_id: String,
        client_id: String,
        #[serde(default)]
        list_mode: Option<bool>,
        #[serde(default = "default_initiator")]
        initiator: Initiator,
        #[serde(default)]
        tasks: Vec<String>,
    },
    /// A repository received a push
    #[serde(rename_all = "camelCase")]
    Push {
        repository_id: String,
        branch: String,
    },
    Pong,
}

fn default_initiator() -> Initiator {
    Initiator::Gui
}

/// Run the relay worker
pub async fn run(
    options: &Options,
    settings: Arc<Settings>,
    jobs: JobSender,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Relay worker starting...");

    let Some(relay) = settings.relay.as_ref() else {
        warn!("No relay configured, relay worker exiting");
        return;
    };
    let relay_url = match build_relay_url(&relay.url) {
        Ok(url) => url,
        Err(e) => {
            error!("Failed to build relay URL: {}", e);
            return;
        }
    };
    let cooldown = CooldownOptions {
        base_delay: options.reconnect_delay,
        ..Default::default()
    };
    let mut attempt: u32 = 0;

    loop {
        // Progress queued while disconnected belongs to clients that may be gone
        let mut stale = 0;
        while outbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Dropped {} stale outbound frames", stale);
        }

        info!("Connecting to relay: {}", relay_url);
        let request = match build_request(&relay_url, relay) {
            Ok(request) => request,
            Err(e) => {
                error!("Failed to build relay request: {}", e);
                return;
            }
        };

        match connect_async(request).await {
            Ok((mut ws_stream, _)) => {
                info!("Connected to relay");
                attempt = 0;

                let mut heartbeat_tick = tokio::time::interval(options.heartbeat_interval);

                loop {
                    tokio::select! {
                        _ = &mut shutdown_signal => {
                            info!("Relay worker shutting down connection...");
                            let _ = ws_stream.close(None).await;
                            return;
                        }
                        _ = heartbeat_tick.tick() => {
                            let ping = serde_json::json!({"type": "ping"}).to_string();
                            if let Err(e) = ws_stream.send(Message::Text(ping.into())).await {
                                warn!("Failed to send heartbeat: {}", e);
                                break;
                            }
                        }
                        frame = outbound.recv() => {
                            let Some(frame) = frame else {
                                info!("Progress dispatcher stopped, closing relay connection");
                                let _ = ws_stream.close(None).await;
                                return;
                            };
                            if let Err(e) = ws_stream.send(frame).await {
                                warn!("Failed to send progress frame: {}", e);
                                break;
                            }
                        }
                        msg = ws_stream.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    handle_message(text.as_str(), &settings, &jobs);
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    warn!("Relay closed connection");
                                    break;
                                }
                                Some(Err(e)) => {
                                    error!("Relay WebSocket error: {}", e);
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to connect to relay: {}", e);
            }
        }

        let delay = calc_exp_backoff(&cooldown, attempt);
        attempt = attempt.saturating_add(1);
        info!("Reconnecting to relay in {:?}...", delay);
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Relay worker shutting down...");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn build_request(
    relay_url: &Url,
    relay: &RelaySettings,
) -> Result<http::Request<()>, DeployError> {
    let mut request = relay_url
        .as_str()
        .into_client_request()
        .map_err(|e| DeployError::RelayError(e.to_string()))?;

    let headers = request.headers_mut();
    let user_agent = format!("deployd/{}", env!("CARGO_PKG_VERSION"));
    headers.insert(
        http::header::USER_AGENT,
        HeaderValue::from_str(&user_agent).map_err(|e| DeployError::RelayError(e.to_string()))?,
    );
    if let Some(token) = &relay.token {
        let bearer = format!("Bearer {}", token.expose_secret());
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|_| DeployError::ConfigError("Relay token is not a valid header".to_string()))?,
        );
    }
    Ok(request)
}

/// Gateway URL with a websocket scheme and the worker endpoint path
pub fn build_relay_url(base_url: &str) -> Result<Url, DeployError> {
    let mut url = Url::parse(base_url).map_err(|e| DeployError::ConfigError(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => {
            return Err(DeployError::ConfigError(
                "Invalid relay URL scheme".to_string(),
            ))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| DeployError::ConfigError("Failed to set scheme".to_string()))?;

    if !url.path().ends_with("/worker/ws") {
        url.set_path(&format!("{}/worker/ws", url.path().trim_end_matches('/')));
    }
    Ok(url)
}

/// Turn one inbound frame into deployment jobs
pub fn handle_message(text: &str, settings: &Settings, jobs: &JobSender) {
    debug!("Received relay message: {}", text);

    let msg: InboundMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Ignoring relay message: {}", e);
            return;
        }
    };

    match msg {
        InboundMessage::Deploy {
            deployment_id,
            client_id,
            list_mode,
            initiator,
            tasks,
        } => {
            info!("Deploy request for {} from {}", deployment_id, client_id);
            enqueue(
                jobs,
                DeploymentJob {
                    deployment_id,
                    client_id: ClientId::new(client_id),
                    initiator,
                    list_mode,
                    selected_tasks: tasks,
                },
            );
        }
        InboundMessage::Push {
            repository_id,
            branch,
        } => {
            let pushed = branch.rsplit('/').next().unwrap_or_default();
            for deployment in settings
                .deployments
                .iter()
                .filter(|d| d.repository_id == repository_id)
            {
                let Ok(spec) = settings.deployment_spec(&deployment.id, Initiator::Api, false, vec![]) else {
                    continue;
                };
                if !spec.is_branch(pushed) {
                    continue;
                }
                info!("Push to {} triggers deployment {}", branch, spec.deployment_id);
                enqueue(
                    jobs,
                    DeploymentJob {
                        deployment_id: spec.deployment_id,
                        client_id: ClientId::new(format!("push:{}", repository_id)),
                        initiator: Initiator::Api,
                        list_mode: Some(false),
                        selected_tasks: vec![],
                    },
                );
            }
        }
        InboundMessage::Pong => {
            debug!("Relay pong received");
        }
    }
}

fn enqueue(jobs: &JobSender, job: DeploymentJob) {
    if jobs.send(job).is_err() {
        warn!("Deployer worker stopped, dropping job");
    }
}
