//! In-process lifecycle event bus
//!
//! Observers register per [`LifecycleEvent`] and are invoked synchronously,
//! in registration order, every time the pipeline reaches that point. The bus
//! is shared between concurrently executing runs.

use std::collections::HashMap;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::deployment::DeploymentSpec;
use crate::models::revision::{ChangeEntry, ChangeSet, Revision};

/// Points in a deployment run observers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleEvent {
    Started,
    PreparationCompleted,
    ChangedFilesCollected,
    ChangedFilesSorted,
    ChangedFilesProcessed,
    Completed,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 6] = [
        LifecycleEvent::Started,
        LifecycleEvent::PreparationCompleted,
        LifecycleEvent::ChangedFilesCollected,
        LifecycleEvent::ChangedFilesSorted,
        LifecycleEvent::ChangedFilesProcessed,
        LifecycleEvent::Completed,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Started => "deploymentStarted",
            LifecycleEvent::PreparationCompleted => "deploymentPreparationCompleted",
            LifecycleEvent::ChangedFilesCollected => "deploymentChangedFilesCollected",
            LifecycleEvent::ChangedFilesSorted => "deploymentChangedFilesSorted",
            LifecycleEvent::ChangedFilesProcessed => "deploymentChangedFilesProcessed",
            LifecycleEvent::Completed => "deploymentCompleted",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read-only view of the active run handed to listeners
#[derive(Debug, Clone, Copy)]
pub struct LifecycleContext<'a> {
    pub run_id: Uuid,
    pub spec: &'a DeploymentSpec,
    pub list_mode: bool,
    pub local_revision: Option<&'a Revision>,
    pub remote_revision: Option<&'a Revision>,
    pub changes: Option<&'a [ChangeEntry]>,
    pub change_set: Option<&'a ChangeSet>,
}

impl<'a> LifecycleContext<'a> {
    pub fn new(run_id: Uuid, spec: &'a DeploymentSpec, list_mode: bool) -> Self {
        Self {
            run_id,
            spec,
            list_mode,
            local_revision: None,
            remote_revision: None,
            changes: None,
            change_set: None,
        }
    }
}

/// Failure reported by a listener
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Listener for {event} failed: {message}")]
pub struct ListenerError {
    pub event: LifecycleEvent,
    pub message: String,
}

/// Listener callback. Identity is the `Arc` allocation, so register clones of
/// the same `Arc` to refer to the same listener.
pub type Listener = Arc<dyn Fn(&LifecycleContext<'_>) -> Result<(), String> + Send + Sync>;

/// Publish/subscribe register for lifecycle hooks
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<LifecycleEvent, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Registering the same listener twice is a no-op.
    pub fn on(&self, event: LifecycleEvent, listener: Listener) {
        let mut listeners = self.write();
        let registered = listeners.entry(event).or_default();
        if registered.iter().any(|l| same_listener(l, &listener)) {
            return;
        }
        registered.push(listener);
    }

    /// Remove a single listener
    pub fn remove_listener(&self, event: LifecycleEvent, listener: &Listener) {
        let mut listeners = self.write();
        if let Some(registered) = listeners.get_mut(&event) {
            registered.retain(|l| !same_listener(l, listener));
        }
    }

    /// Remove all listeners of `event`, or every listener when `None`
    pub fn remove_all_listeners(&self, event: Option<LifecycleEvent>) {
        let mut listeners = self.write();
        match event {
            Some(event) => {
                listeners.remove(&event);
            }
            None => listeners.clear(),
        }
    }

    /// Number of listeners registered for `event`
    pub fn listener_count(&self, event: LifecycleEvent) -> usize {
        self.read().get(&event).map_or(0, Vec::len)
    }

    /// Invoke every listener registered for `event`.
    ///
    /// All listeners run even if one fails or panics; the first failure is
    /// returned.
    pub fn emit(&self, event: LifecycleEvent, ctx: &LifecycleContext<'_>) -> Result<(), ListenerError> {
        // Snapshot so listeners may (un)register without deadlocking
        let snapshot: Vec<Listener> = match self.read().get(&event) {
            Some(registered) if !registered.is_empty() => registered.clone(),
            _ => return Ok(()),
        };

        let mut first_error = None;
        for listener in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| listener(ctx)))
                .unwrap_or_else(|payload| Err(panic_message(payload)));
            if let Err(message) = result {
                first_error.get_or_insert(ListenerError { event, message });
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<LifecycleEvent, Vec<Listener>>> {
        self.listeners.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<LifecycleEvent, Vec<Listener>>> {
        self.listeners.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("listener panicked: {}", detail)
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
