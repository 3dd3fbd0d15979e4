//! HTTP synthesis backend: POST the sentence, receive a WAV or MP3 body and
//! transcode it to Opus frames at the session's output format.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::base::{TtsError, TtsProvider, TtsStream};
use crate::core::codec::{AudioContainer, AudioFormat, decode_container, encode_opus_frames};

const FRAME_CHANNEL_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpTtsConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub voice: String,
    pub speed: f32,
    /// Container the backend answers with.
    pub response_format: AudioContainer,
    pub timeout_secs: u64,
}

impl Default for HttpTtsConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5050/v1/audio/speech".to_string(),
            api_key: None,
            voice: "zh-CN-XiaoxiaoNeural".to_string(),
            speed: 1.0,
            response_format: AudioContainer::Wav,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    input: &'a str,
    voice: &'a str,
    speed: f32,
    response_format: AudioContainer,
    sample_rate: u32,
}

pub struct HttpTts {
    config: HttpTtsConfig,
    client: reqwest::Client,
}

impl HttpTts {
    pub fn new(config: HttpTtsConfig) -> Result<Self, TtsError> {
        if config.url.is_empty() {
            return Err(TtsError::Configuration("HTTP TTS url is required".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TtsError::Configuration(e.to_string()))?;
        Ok(Self { config, client })
    }

    async fn fetch(&self, text: &str, sample_rate: u32) -> Result<bytes::Bytes, TtsError> {
        let body = SpeechRequest {
            input: text,
            voice: &self.config.voice,
            speed: self.config.speed,
            response_format: self.config.response_format,
            sample_rate,
        };
        let mut request = self.client.post(&self.config.url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TtsError::ConnectionFailed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TtsError::ProviderError(format!("HTTP {status}: {message}")));
        }
        response
            .bytes()
            .await
            .map_err(|e| TtsError::ProviderError(e.to_string()))
    }
}

#[async_trait::async_trait]
impl TtsProvider for HttpTts {
    async fn synthesize_stream(
        &self,
        cancel: CancellationToken,
        text: &str,
        format: AudioFormat,
    ) -> Result<TtsStream, TtsError> {
        let format = AudioFormat { channels: 1, ..format };
        let body = tokio::select! {
            _ = cancel.cancelled() => {
                let (_, rx) = mpsc::channel(1);
                return Ok(rx);
            }
            body = self.fetch(text, format.sample_rate) => body?,
        };
        debug!(bytes = body.len(), "HTTP TTS response received");

        let container = self.config.response_format;
        let frames = tokio::task::spawn_blocking(move || {
            let pcm = decode_container(&body, container)?;
            encode_opus_frames(&pcm.to_mono(format.sample_rate), format)
        })
        .await
        .map_err(|e| TtsError::ProviderError(format!("transcode task failed: {e}")))??;

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        tokio::spawn(async move {
            for frame in frames {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(Ok(frame)) => {
                        if sent.is_err() {
                            warn!("TTS frame receiver dropped");
                            break;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    fn provider_name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn silent_wav(samples: usize, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..samples {
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn test_wav_response_becomes_opus_frames() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/speech"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({"input": "你好", "response_format": "wav"})))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(silent_wav(16000, 16000)))
            .mount(&server)
            .await;

        let tts = HttpTts::new(HttpTtsConfig {
            url: format!("{}/speech", server.uri()),
            api_key: Some("secret".to_string()),
            ..HttpTtsConfig::default()
        })
        .unwrap();

        let mut frames = tts
            .synthesize_stream(CancellationToken::new(), "你好", AudioFormat::default())
            .await
            .unwrap();
        let mut count = 0;
        while let Some(frame) = frames.recv().await {
            assert!(!frame.unwrap().is_empty());
            count += 1;
        }
        // one second at 60 ms per frame, last frame padded
        assert_eq!(count, 17);
    }

    #[tokio::test]
    async fn test_http_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let tts = HttpTts::new(HttpTtsConfig {
            url: server.uri(),
            ..HttpTtsConfig::default()
        })
        .unwrap();
        let result = tts
            .synthesize_stream(CancellationToken::new(), "hi", AudioFormat::default())
            .await;
        assert!(matches!(result, Err(TtsError::ProviderError(msg)) if msg.contains("boom")));
    }

    #[test]
    fn test_empty_url_rejected() {
        let config = HttpTtsConfig {
            url: String::new(),
            ..HttpTtsConfig::default()
        };
        assert!(matches!(HttpTts::new(config), Err(TtsError::Configuration(_))));
    }
}
