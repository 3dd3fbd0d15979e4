mod base;
pub mod http;
pub mod websocket;

use std::sync::Arc;

use serde::Deserialize;

pub use base::{FrameEncoder, TtsError, TtsProvider, TtsStream, pcm_i16_le_to_f32};
pub use http::{HttpTts, HttpTtsConfig};
pub use websocket::{WEBSOCKET_TTS_FORMAT, WebSocketTts, WebSocketTtsConfig};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "provider", content = "config", rename_all = "snake_case")]
pub enum TtsProviderConfig {
    Http(HttpTtsConfig),
    Websocket(WebSocketTtsConfig),
}

impl Default for TtsProviderConfig {
    fn default() -> Self {
        Self::Http(HttpTtsConfig::default())
    }
}

/// Build a synthesis backend. WebSocket backends own a connection pool, so
/// construction is async.
pub async fn create_tts_provider(config: &TtsProviderConfig) -> Result<Arc<dyn TtsProvider>, TtsError> {
    match config {
        TtsProviderConfig::Http(cfg) => Ok(Arc::new(HttpTts::new(cfg.clone())?)),
        TtsProviderConfig::Websocket(cfg) => Ok(Arc::new(WebSocketTts::new(cfg.clone()).await?)),
    }
}
