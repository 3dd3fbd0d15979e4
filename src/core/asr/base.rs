use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One recognizer update.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsrResult {
    pub text: String,
    pub is_final: bool,
}

impl AsrResult {
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AsrError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Audio processing error: {0}")]
    AudioProcessingError(String),
    #[error("Provider error: {0}")]
    ProviderError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Results of one streaming recognition. The channel closes after the final
/// result or when the stream fails.
pub type AsrStream = mpsc::Receiver<Result<AsrResult, AsrError>>;

/// Streaming speech recognizer.
///
/// Audio arrives as mono f32 PCM chunks. Dropping the sender ends the input;
/// the provider then flushes its final result and closes the output channel.
/// Cancelling `cancel` must tear down the backend connection promptly.
#[async_trait::async_trait]
pub trait AsrProvider: Send + Sync {
    async fn streaming_recognize(
        &self,
        cancel: CancellationToken,
        audio: mpsc::Receiver<Vec<f32>>,
    ) -> Result<AsrStream, AsrError>;

    fn provider_name(&self) -> &'static str;
}

/// f32 samples to little-endian signed 16-bit PCM.
pub fn pcm_f32_to_i16_le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}
