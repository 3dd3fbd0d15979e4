//! Turns accepted transports into running, registered sessions.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::asr::create_asr_provider;
use crate::core::device_config::{DeviceConfig, DeviceConfigProvider};
use crate::core::llm::create_llm_provider;
use crate::core::tts::{TtsProvider, TtsProviderConfig, create_tts_provider};
use crate::transport::Transport;
use crate::transport::mqtt_udp::NewTransportHandler;

use super::SessionError;
use super::chat::{ChatSession, SessionServices};
use super::client_state::{ClientState, Providers};
use super::registry::{ManagedSession, SessionRegistry};

/// Builds the provider handles of a session from its device config.
#[async_trait::async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn create(&self, config: &DeviceConfig) -> Result<Providers, SessionError>;
}

/// Creates providers from their typed configs. TTS backends are shared
/// between sessions with identical config so pooled connections are reused.
#[derive(Default)]
pub struct DefaultProviderFactory {
    tts: tokio::sync::Mutex<Vec<(TtsProviderConfig, Arc<dyn TtsProvider>)>>,
}

impl DefaultProviderFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn tts_provider(&self, config: &TtsProviderConfig) -> Result<Arc<dyn TtsProvider>, SessionError> {
        let mut cache = self.tts.lock().await;
        if let Some((_, provider)) = cache.iter().find(|(cached, _)| cached == config) {
            return Ok(Arc::clone(provider));
        }
        let provider = create_tts_provider(config).await?;
        debug!(provider = provider.provider_name(), "TTS provider created");
        cache.push((config.clone(), Arc::clone(&provider)));
        Ok(provider)
    }
}

#[async_trait::async_trait]
impl ProviderFactory for DefaultProviderFactory {
    async fn create(&self, config: &DeviceConfig) -> Result<Providers, SessionError> {
        Ok(Providers {
            asr: create_asr_provider(&config.asr)?,
            llm: create_llm_provider(&config.llm)?,
            tts: self.tts_provider(&config.tts).await?,
        })
    }
}

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    device_config: Arc<dyn DeviceConfigProvider>,
    services: SessionServices,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        device_config: Arc<dyn DeviceConfigProvider>,
        services: SessionServices,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            device_config,
            services,
            shutdown,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Create, register and start a session for `transport`.
    ///
    /// Close callbacks run in a fixed order: registry entry, then the device
    /// MCP session, then the session scope.
    pub async fn accept(&self, transport: Arc<dyn Transport>) -> Arc<ChatSession> {
        let device_id = transport.device_id().to_string();
        let device_config = self.device_config.device_config(&device_id).await;
        let state = Arc::new(ClientState::new(
            device_id.clone(),
            device_config,
            self.services.settings.chat.max_silence_ms,
            self.shutdown.child_token(),
        ));
        let session = ChatSession::new(Arc::clone(&transport), state, self.services.clone());
        let managed: Arc<dyn ManagedSession> = session.clone();
        self.registry.register(Arc::clone(&managed));

        let registry = Arc::downgrade(&self.registry);
        let this_session = Arc::downgrade(&managed);
        transport.on_close(Box::new(move |_| {
            if let (Some(registry), Some(session)) = (registry.upgrade(), this_session.upgrade()) {
                registry.unregister_session(&session);
            }
        }));

        let registry = Arc::downgrade(&self.registry);
        let device_mcp = Arc::clone(&self.services.device_mcp);
        transport.on_close(Box::new(move |device_id| {
            // A replacement session owns the device's MCP state now.
            if registry.upgrade().is_some_and(|r| r.get(device_id).is_some()) {
                return;
            }
            let device_id = device_id.to_string();
            tokio::spawn(async move { device_mcp.remove(&device_id).await });
        }));

        let root = session.state().root().clone();
        transport.on_close(Box::new(move |_| root.cancel()));

        session.start();
        info!(device_id = %device_id, sessions = self.registry.len(), "Device connected");
        session
    }

    /// Callback form of [`accept`](Self::accept) for transports created by the MQTT adapter.
    pub fn transport_handler(self: &Arc<Self>) -> NewTransportHandler {
        let manager = Arc::downgrade(self);
        Arc::new(move |transport| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                manager.accept(transport).await;
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device_config::StaticDeviceConfigProvider;
    use crate::core::mcp::ClientRole;
    use crate::core::mcp::client::tests::connected_client;
    use crate::session::chat::tests::services;
    use crate::session::tests::{FakeTransport, fake_providers};
    use std::time::Duration;

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(
            SessionRegistry::new(),
            Arc::new(StaticDeviceConfigProvider::new(DeviceConfig::default())),
            services(fake_providers(vec![], 1)),
            CancellationToken::new(),
        )
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_accept_registers_and_close_unregisters() {
        let manager = manager();
        let transport = FakeTransport::new("dev");
        let session = manager.accept(transport.clone()).await;
        assert_eq!(manager.registry().device_ids(), vec!["dev".to_string()]);

        transport.close().await;
        assert!(manager.registry().is_empty());
        assert!(session.state().root().is_cancelled());
    }

    #[tokio::test]
    async fn test_second_connection_evicts_first() {
        let manager = manager();
        let first_transport = FakeTransport::new("dev");
        let first = manager.accept(first_transport.clone()).await;
        let second = manager.accept(FakeTransport::new("dev")).await;

        assert!(first.state().root().is_cancelled());
        assert!(!second.state().root().is_cancelled());
        assert!(eventually(|| first_transport.is_closed()).await);
        assert_eq!(manager.registry().len(), 1);
        assert!(!manager.registry().get("dev").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_close_removes_device_mcp_session() {
        let manager = manager();
        let transport = FakeTransport::new("dev");
        manager.accept(transport.clone()).await;
        manager
            .services
            .device_mcp
            .get_or_create("dev")
            .attach(ClientRole::WsEndpoint, connected_client(vec!["self.light.on"]), Default::default())
            .await
            .unwrap();

        transport.close().await;
        let pool = Arc::clone(&manager.services.device_mcp);
        assert!(eventually(|| pool.get("dev").is_none()).await);
    }

    #[tokio::test]
    async fn test_default_factory_shares_tts_backends() {
        let factory = DefaultProviderFactory::new();
        let config = DeviceConfig::default();
        let a = factory.create(&config).await.unwrap();
        let b = factory.create(&config).await.unwrap();
        assert!(Arc::ptr_eq(&a.tts, &b.tts));
    }
}
