//! Shared state for the HTTP handlers.

use datapull_config::SafeConfig;

/// Handler state: the hot-swappable configuration.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The active configuration.
    pub config: SafeConfig,
}

impl AppState {
    /// Wrap a loaded configuration.
    #[must_use]
    pub fn new(config: SafeConfig) -> Self {
        Self { config }
    }
}
