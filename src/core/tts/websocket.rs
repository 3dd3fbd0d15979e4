//! Streaming synthesis over long-lived WebSocket connections.
//!
//! Each request is one JSON text frame; the server answers with binary
//! 16-bit PCM chunks and finishes the sentence with a text frame
//! (`{"type":"end"}` or `{"type":"error","message":..}`). Connections are
//! pooled and reused across sentences.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::base::{FrameEncoder, TtsError, TtsProvider, TtsStream, pcm_i16_le_to_f32};
use crate::core::codec::AudioFormat;
use crate::core::pool::{PoolConfig, PoolError, ResourceFactory, ResourcePool};

const FRAME_CHANNEL_SIZE: usize = 100;

/// Output format this backend streams best at.
pub const WEBSOCKET_TTS_FORMAT: AudioFormat = AudioFormat::opus(24000, 1, 20);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebSocketTtsConfig {
    pub url: String,
    pub voice: String,
    pub max_connections: usize,
    pub max_idle: usize,
    pub connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl Default for WebSocketTtsConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/tts".to_string(),
            voice: "zh-CN-XiaoxiaoNeural".to_string(),
            max_connections: 10,
            max_idle: 5,
            connect_timeout_ms: 5000,
            acquire_timeout_ms: 10000,
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TtsConnection {
    stream: WsStream,
    healthy: bool,
}

struct ConnectionFactory {
    url: String,
    connect_timeout: Duration,
}

#[async_trait::async_trait]
impl ResourceFactory for ConnectionFactory {
    type Resource = TtsConnection;

    async fn create(&self) -> Result<TtsConnection, PoolError> {
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| PoolError::Create("TTS connect timeout".to_string()))?
            .map_err(|e| PoolError::Create(e.to_string()))?;
        debug!(url = %self.url, "Opened TTS connection");
        Ok(TtsConnection { stream, healthy: true })
    }

    fn validate(&self, conn: &TtsConnection) -> bool {
        conn.healthy
    }
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    voice: &'a str,
    sample_rate: u32,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
}

pub struct WebSocketTts {
    config: WebSocketTtsConfig,
    pool: std::sync::Arc<ResourcePool<ConnectionFactory>>,
}

impl WebSocketTts {
    pub async fn new(config: WebSocketTtsConfig) -> Result<Self, TtsError> {
        url::Url::parse(&config.url).map_err(|e| TtsError::Configuration(format!("invalid url: {e}")))?;
        let pool_config = PoolConfig {
            max_size: config.max_connections,
            min_size: 0,
            max_idle: config.max_idle.min(config.max_connections),
            acquire_timeout_ms: config.acquire_timeout_ms,
            validate_on_return: true,
            ..PoolConfig::default()
        };
        let factory = ConnectionFactory {
            url: config.url.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        };
        let pool = ResourcePool::new("tts-websocket", pool_config, factory).await?;
        Ok(Self { config, pool })
    }

    pub fn pool_stats(&self) -> crate::core::pool::PoolStats {
        self.pool.stats()
    }
}

#[async_trait::async_trait]
impl TtsProvider for WebSocketTts {
    async fn synthesize_stream(
        &self,
        cancel: CancellationToken,
        text: &str,
        format: AudioFormat,
    ) -> Result<TtsStream, TtsError> {
        let format = AudioFormat { channels: 1, ..format };
        let mut encoder = FrameEncoder::new(format)?;
        let mut conn = self
            .pool
            .acquire(Duration::from_millis(self.config.acquire_timeout_ms))
            .await?;

        let request = serde_json::to_string(&SynthesisRequest {
            text,
            voice: &self.config.voice,
            sample_rate: format.sample_rate,
            format: "pcm",
        })
        .map_err(|e| TtsError::ProviderError(e.to_string()))?;

        if let Err(e) = conn.stream.send(Message::Text(request.into())).await {
            conn.healthy = false;
            conn.discard();
            return Err(TtsError::ConnectionFailed(e.to_string()));
        }

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        tokio::spawn(async move {
            let mut finished = false;
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = conn.stream.next() => message,
                };
                match message {
                    Some(Ok(Message::Binary(pcm))) => {
                        let frames = match encoder.push(&pcm_i16_le_to_f32(&pcm)) {
                            Ok(frames) => frames,
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                break;
                            }
                        };
                        for frame in frames {
                            if tx.send(Ok(frame)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlFrame>(&text) {
                            Ok(frame) if frame.kind == "error" => {
                                let message = frame.message.unwrap_or_default();
                                let _ = tx.send(Err(TtsError::ProviderError(message))).await;
                            }
                            Ok(_) => {
                                if let Ok(Some(last)) = encoder.finish() {
                                    let _ = tx.send(Ok(last)).await;
                                }
                            }
                            Err(e) => warn!("Unexpected TTS control frame: {}", e),
                        }
                        finished = true;
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = tx.send(Err(TtsError::ConnectionFailed(e.to_string()))).await;
                        break;
                    }
                }
            }

            // A connection abandoned mid-sentence still has audio in flight.
            if !finished {
                conn.healthy = false;
                conn.discard();
            }
        });

        Ok(rx)
    }

    fn preferred_format(&self) -> Option<AudioFormat> {
        Some(WEBSOCKET_TTS_FORMAT)
    }

    fn provider_name(&self) -> &'static str {
        "websocket"
    }
}
