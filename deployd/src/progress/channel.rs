//! Fire-and-forget progress channel
//!
//! Runs push [`Envelope`]s onto an unbounded queue and never wait for
//! delivery. A single dispatcher drains the queue in FIFO order, so lines
//! from one run reach their recipient in the order they were produced.

use tokio::sync::mpsc;
use tracing::debug;

use crate::models::progress::{ClientId, ProgressEvent, Severity};

/// A progress event addressed to one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub recipient: ClientId,
    pub event: ProgressEvent,
}

/// Receiving half, consumed by [`crate::progress::dispatch`]
pub type ProgressReceiver = mpsc::UnboundedReceiver<Envelope>;

/// Shared sending half of the progress queue
#[derive(Debug, Clone)]
pub struct ProgressChannel {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ProgressChannel {
    pub fn new() -> (Self, ProgressReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event for `recipient`. Silently dropped once the dispatcher is gone.
    pub fn send(&self, recipient: &ClientId, event: ProgressEvent) {
        let envelope = Envelope {
            recipient: recipient.clone(),
            event,
        };
        if self.tx.send(envelope).is_err() {
            debug!("Progress dispatcher closed, dropping event for {}", recipient);
        }
    }

    /// Reporter bound to a single recipient
    pub fn reporter(&self, recipient: ClientId) -> ProgressReporter {
        ProgressReporter {
            channel: self.clone(),
            recipient,
        }
    }
}

/// Per-run handle the pipeline writes its progress lines to
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    channel: ProgressChannel,
    recipient: ClientId,
}

impl ProgressReporter {
    pub fn send(&self, severity: Severity, message: impl Into<String>) {
        self.channel
            .send(&self.recipient, ProgressEvent::new(severity, message));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.send(Severity::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.send(Severity::Success, message);
    }

    /// Plain step marker
    pub fn log(&self, message: impl Into<String>) {
        self.send(Severity::Warning, message);
    }

    pub fn danger(&self, message: impl Into<String>) {
        self.send(Severity::Danger, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(Severity::Error, message);
    }
}
