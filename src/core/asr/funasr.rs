//! FunASR websocket recognizer (`funasr_wss_server` protocol).
//!
//! Handshake is a JSON text frame describing the stream, followed by binary
//! 16-bit PCM chunks and a closing `{"is_speaking": false}` frame. The server
//! answers with `{"text", "is_final", "mode"}` frames.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::base::{AsrError, AsrProvider, AsrResult, AsrStream, pcm_f32_to_i16_le};

const RESULT_CHANNEL_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FunasrConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// `online`, `offline` or `2pass`
    pub mode: String,
    pub chunk_size: Vec<u32>,
    pub chunk_interval: u32,
    pub sample_rate: u32,
    pub itn: bool,
    pub hotwords: Option<String>,
    /// How long to wait for the final result after input ends.
    pub final_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for FunasrConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 10095,
            use_tls: false,
            mode: "online".to_string(),
            chunk_size: vec![5, 10, 5],
            chunk_interval: 10,
            sample_rate: 16000,
            itn: true,
            hotwords: None,
            final_timeout_ms: 5000,
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Serialize)]
struct FunasrRequest<'a> {
    mode: &'a str,
    chunk_size: &'a [u32],
    chunk_interval: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_fs: Option<u32>,
    wav_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    wav_format: Option<&'a str>,
    is_speaking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    hotwords: Option<&'a str>,
    itn: bool,
}

#[derive(Debug, Deserialize)]
struct FunasrResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    mode: String,
}

pub struct FunasrAsr {
    config: FunasrConfig,
    url: String,
}

impl FunasrAsr {
    pub fn new(config: FunasrConfig) -> Result<Self, AsrError> {
        let scheme = if config.use_tls { "wss" } else { "ws" };
        let url = Url::parse(&format!("{scheme}://{}:{}/", config.host, config.port))
            .map_err(|e| AsrError::ConfigurationError(format!("Invalid FunASR address: {e}")))?;
        Ok(Self {
            config,
            url: url.to_string(),
        })
    }

    fn start_message(&self) -> Result<String, AsrError> {
        serde_json::to_string(&FunasrRequest {
            mode: &self.config.mode,
            chunk_size: &self.config.chunk_size,
            chunk_interval: self.config.chunk_interval,
            audio_fs: Some(self.config.sample_rate),
            wav_name: "stream",
            wav_format: Some("pcm"),
            is_speaking: true,
            hotwords: self.config.hotwords.as_deref(),
            itn: self.config.itn,
        })
        .map_err(|e| AsrError::ProviderError(e.to_string()))
    }

    fn end_message(&self) -> String {
        serde_json::to_string(&FunasrRequest {
            mode: &self.config.mode,
            chunk_size: &self.config.chunk_size,
            chunk_interval: self.config.chunk_interval,
            audio_fs: None,
            wav_name: "stream",
            wav_format: None,
            is_speaking: false,
            hotwords: None,
            itn: self.config.itn,
        })
        .unwrap_or_else(|_| r#"{"is_speaking":false}"#.to_string())
    }
}

#[async_trait::async_trait]
impl AsrProvider for FunasrAsr {
    async fn streaming_recognize(
        &self,
        cancel: CancellationToken,
        mut audio: mpsc::Receiver<Vec<f32>>,
    ) -> Result<AsrStream, AsrError> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| AsrError::ConnectionFailed("Connection timeout".to_string()))?
            .map_err(|e| AsrError::ConnectionFailed(e.to_string()))?;
        debug!(url = %self.url, "Connected to FunASR");

        let (mut sink, mut stream) = ws_stream.split();
        sink.send(Message::Text(self.start_message()?.into()))
            .await
            .map_err(|e| AsrError::NetworkError(e.to_string()))?;

        let (result_tx, result_rx) = mpsc::channel(RESULT_CHANNEL_SIZE);
        let end_message = self.end_message();
        let final_timeout = Duration::from_millis(self.config.final_timeout_ms);

        tokio::spawn(async move {
            let mut input_done = false;
            let final_deadline = tokio::time::sleep(Duration::MAX);
            tokio::pin!(final_deadline);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("FunASR stream cancelled");
                        break;
                    }
                    _ = &mut final_deadline, if input_done => {
                        warn!("FunASR final result timed out");
                        break;
                    }
                    chunk = audio.recv(), if !input_done => {
                        match chunk {
                            Some(pcm) => {
                                let bytes = pcm_f32_to_i16_le(&pcm);
                                if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                                    let _ = result_tx.send(Err(AsrError::NetworkError(e.to_string()))).await;
                                    break;
                                }
                            }
                            None => {
                                input_done = true;
                                final_deadline
                                    .as_mut()
                                    .reset(tokio::time::Instant::now() + final_timeout);
                                if let Err(e) = sink.send(Message::Text(end_message.clone().into())).await {
                                    let _ = result_tx.send(Err(AsrError::NetworkError(e.to_string()))).await;
                                    break;
                                }
                            }
                        }
                    }
                    message = stream.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                let response: FunasrResponse = match serde_json::from_str(&text) {
                                    Ok(r) => r,
                                    Err(e) => {
                                        debug!("Ignoring malformed FunASR frame: {}", e);
                                        continue;
                                    }
                                };
                                let is_final = response.is_final || response.mode.ends_with("offline");
                                if result_tx.send(Ok(AsrResult::new(response.text, is_final))).await.is_err() {
                                    break;
                                }
                                if is_final {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("FunASR stream ended");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = result_tx.send(Err(AsrError::NetworkError(e.to_string()))).await;
                                break;
                            }
                        }
                    }
                }
            }

            let _ = sink.close().await;
            info!("FunASR recognition finished");
        });

        Ok(result_rx)
    }

    fn provider_name(&self) -> &'static str {
        "funasr"
    }
}
