use std::sync::Arc;

use crate::config::ServerConfig;
use crate::core::CoreState;
use crate::session::ProviderFactory;

/// Application state that can be shared across handlers
pub struct AppState {
    pub config: ServerConfig,
    /// Core layer state: sessions, MCP federation, memory and pools
    pub core_state: Arc<CoreState>,
}

impl AppState {
    pub async fn new(config: ServerConfig) -> Arc<Self> {
        let core_state = CoreState::new(&config).await;
        Arc::new(Self { config, core_state })
    }

    /// Build state whose sessions get their providers from `providers`.
    pub async fn with_providers(config: ServerConfig, providers: Arc<dyn ProviderFactory>) -> Arc<Self> {
        let core_state = CoreState::with_providers(&config, providers).await;
        Arc::new(Self { config, core_state })
    }
}
