//! Progress sinks

use async_trait::async_trait;
use colored::Colorize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

use crate::errors::DeployError;
use crate::models::progress::Severity;
use crate::progress::channel::{Envelope, ProgressReceiver};

/// Destination for progress envelopes
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeployError>;
}

#[async_trait]
impl ProgressSink for Box<dyn ProgressSink> {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeployError> {
        (**self).deliver(envelope).await
    }
}

/// Drain the progress queue into `sink` until every sender is dropped.
///
/// Delivery failures are dropped: progress must never gate a deployment.
pub async fn dispatch(mut rx: ProgressReceiver, sink: impl ProgressSink) {
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = sink.deliver(&envelope).await {
            debug!("Dropping progress event for {}: {}", envelope.recipient, e);
        }
    }
    debug!("Progress dispatcher stopped");
}

/// Prints progress lines to the terminal
#[derive(Debug, Default, Clone)]
pub struct ConsoleSink;

#[async_trait]
impl ProgressSink for ConsoleSink {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeployError> {
        let event = &envelope.event;
        let time = event.timestamp.format("%H:%M:%S").to_string();
        let message = match event.severity {
            Severity::Info => event.message.cyan(),
            Severity::Success => event.message.green(),
            Severity::Warning => event.message.normal(),
            Severity::Danger => event.message.yellow(),
            Severity::Error | Severity::Fatal => event.message.red().bold(),
        };
        println!("{} {}", time.dimmed(), message);
        Ok(())
    }
}

/// JSON frame pushed to the relay gateway, which routes it to the client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub client_id: &'a str,
    pub severity: Severity,
    pub class: &'static str,
    pub source: &'static str,
    pub message: &'a str,
    pub time: String,
}

impl<'a> LogFrame<'a> {
    pub fn from_envelope(envelope: &'a Envelope) -> Self {
        Self {
            frame_type: "log",
            client_id: envelope.recipient.as_str(),
            severity: envelope.event.severity,
            class: envelope.event.severity.ui_class(),
            source: "deployd",
            message: &envelope.event.message,
            time: envelope.event.timestamp.format("%H:%M:%S").to_string(),
        }
    }
}

/// Forwards progress frames to the relay worker's outbound websocket queue
#[derive(Debug, Clone)]
pub struct RelaySink {
    outbound: mpsc::UnboundedSender<Message>,
}

impl RelaySink {
    pub fn new(outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self { outbound }
    }
}

#[async_trait]
impl ProgressSink for RelaySink {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeployError> {
        let frame = serde_json::to_string(&LogFrame::from_envelope(envelope))?;
        self.outbound
            .send(Message::Text(frame.into()))
            .map_err(|_| DeployError::RelayError("Relay outbound queue closed".to_string()))
    }
}
