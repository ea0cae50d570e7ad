//! Application state shared by the workers

use std::sync::Arc;

use crate::events::EventBus;
use crate::progress::ProgressChannel;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Long-lived state every deployment run draws from
pub struct AppState {
    pub version: String,
    pub settings: Arc<Settings>,
    pub layout: StorageLayout,
    pub events: Arc<EventBus>,
    pub progress: ProgressChannel,
}

impl AppState {
    pub fn new(
        version: String,
        settings: Arc<Settings>,
        layout: StorageLayout,
        progress: ProgressChannel,
    ) -> Self {
        Self {
            version,
            settings,
            layout,
            events: Arc::new(EventBus::new()),
            progress,
        }
    }
}
