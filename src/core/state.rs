use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::core::device_config::DeviceConfigProvider;
use crate::core::mcp::{DeviceMcpPool, ExitChatTool, GlobalMcpManager, ToolResolver};
use crate::core::memory::{DialogueMemory, InMemoryDialogueMemory};
use crate::core::vad::{VadFactory, VadPool};
use crate::session::{DefaultProviderFactory, ProviderFactory, SessionManager, SessionRegistry};
use crate::session::chat::SessionServices;
use crate::transport::CredentialPolicy;

/// Process-scoped services shared by every connection.
///
/// Owns the session registry, MCP federation, dialogue memory and the VAD
/// pool, and the session manager that ties them to new transports.
pub struct CoreState {
    pub registry: Arc<SessionRegistry>,
    pub sessions: Arc<SessionManager>,
    pub global_mcp: Arc<GlobalMcpManager>,
    pub device_mcp: Arc<DeviceMcpPool>,
    pub tools: ToolResolver,
    pub memory: Arc<dyn DialogueMemory>,
    /// `None` when the pool could not be built; sessions then rely on
    /// device-driven listen start/stop.
    pub vad_pool: Option<Arc<VadPool>>,
    pub credentials: CredentialPolicy,
    pub shutdown: CancellationToken,
}

impl CoreState {
    pub async fn new(config: &ServerConfig) -> Arc<Self> {
        Self::with_providers(config, DefaultProviderFactory::new()).await
    }

    /// Build core state with a caller-supplied provider factory.
    pub async fn with_providers(config: &ServerConfig, providers: Arc<dyn ProviderFactory>) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let registry = SessionRegistry::new();

        let global_mcp = GlobalMcpManager::new(config.mcp.clone());
        global_mcp.register_local_tool(Arc::new(ExitChatTool::new(registry.clone())));
        let device_mcp = DeviceMcpPool::new();
        let tools = ToolResolver::new(Arc::clone(&global_mcp), Arc::clone(&device_mcp));

        let memory: Arc<dyn DialogueMemory> = Arc::new(InMemoryDialogueMemory::default());
        let vad_pool = Self::initialize_vad_pool(config).await;

        let services = SessionServices {
            settings: Arc::new(config.session_settings()),
            memory: Arc::clone(&memory),
            tools: tools.clone(),
            device_mcp: Arc::clone(&device_mcp),
            providers,
            vad_pool: vad_pool.clone(),
        };
        let device_config: Arc<dyn DeviceConfigProvider> = Arc::new(config.device_config_provider());
        let sessions = SessionManager::new(Arc::clone(&registry), device_config, services, shutdown.clone());

        Arc::new(Self {
            registry,
            sessions,
            global_mcp,
            device_mcp,
            tools,
            memory,
            vad_pool,
            credentials: config.credential_policy(),
            shutdown,
        })
    }

    async fn initialize_vad_pool(config: &ServerConfig) -> Option<Arc<VadPool>> {
        match VadPool::new("vad", config.vad_pool.clone(), VadFactory::new(config.device.vad.clone())).await {
            Ok(pool) => {
                info!(max_size = config.vad_pool.max_size, "VAD pool ready");
                Some(pool)
            }
            Err(e) => {
                warn!("Failed to build VAD pool, continuing without VAD: {}", e);
                None
            }
        }
    }

    /// Connect global MCP servers and start the device MCP sweeper.
    pub async fn start(&self) {
        self.global_mcp.start().await;
        self.device_mcp.spawn_sweeper(self.shutdown.clone());
    }

    /// Close every session and stop background work.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for device_id in self.registry.device_ids() {
            self.registry.close(&device_id).await;
        }
        self.global_mcp.stop().await;
        if let Some(pool) = &self.vad_pool {
            pool.close();
        }
        info!("Core services stopped");
    }
}
