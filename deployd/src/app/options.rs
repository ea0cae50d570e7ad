//! Application configuration options

use std::time::Duration;

use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::{deployer, relay};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub storage: StorageLayout,

    /// Enable the websocket relay worker
    pub enable_relay_worker: bool,

    /// Deployer worker options
    pub deployer: deployer::Options,

    /// Relay worker options
    pub relay_worker: relay::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageLayout::default(),
            enable_relay_worker: true,
            deployer: deployer::Options::default(),
            relay_worker: relay::Options::default(),
        }
    }
}

impl AppOptions {
    /// Options derived from the settings file
    pub fn from_settings(settings: &Settings, storage: StorageLayout) -> Self {
        Self {
            storage,
            enable_relay_worker: settings.relay.is_some(),
            deployer: deployer::Options {
                max_concurrent_runs: settings.max_concurrent_runs,
            },
            relay_worker: settings
                .relay
                .as_ref()
                .map(relay::Options::from)
                .unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Lifecycle options for the daemon
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown, running deployments included
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(300),
        }
    }
}
