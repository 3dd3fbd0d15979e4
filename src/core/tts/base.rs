//! Text-to-speech provider seam.
//!
//! Providers turn one sentence into a stream of Opus frames already encoded at
//! the session's output format. The session's pacer decides when each frame
//! goes on the wire; providers only produce.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::codec::{AudioFormat, CodecError};
use crate::core::pool::PoolError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TtsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Provider error: {0}")]
    ProviderError(String),
    #[error("Audio encoding error: {0}")]
    Encoding(#[from] CodecError),
    #[error("Connection pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Opus frames for one sentence; closed when synthesis completes.
pub type TtsStream = mpsc::Receiver<Result<Bytes, TtsError>>;

#[async_trait::async_trait]
pub trait TtsProvider: Send + Sync {
    async fn synthesize_stream(
        &self,
        cancel: CancellationToken,
        text: &str,
        format: AudioFormat,
    ) -> Result<TtsStream, TtsError>;

    /// Output format this backend is tuned for, if it differs from the session default.
    fn preferred_format(&self) -> Option<AudioFormat> {
        None
    }

    fn provider_name(&self) -> &'static str;
}

/// Accumulates mono PCM and emits Opus frames as soon as each one fills.
pub struct FrameEncoder {
    encoder: crate::core::codec::OpusEncoder,
    pending: Vec<f32>,
    frame_samples: usize,
}

impl FrameEncoder {
    pub fn new(format: AudioFormat) -> Result<Self, TtsError> {
        Ok(Self {
            encoder: crate::core::codec::OpusEncoder::new(format)?,
            pending: Vec::new(),
            frame_samples: format.frame_samples(),
        })
    }

    pub fn push(&mut self, pcm: &[f32]) -> Result<Vec<Bytes>, TtsError> {
        self.pending.extend_from_slice(pcm);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let frame: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            frames.push(Bytes::from(self.encoder.encode(&frame)?));
        }
        Ok(frames)
    }

    /// Pad and encode the trailing partial frame.
    pub fn finish(&mut self) -> Result<Option<Bytes>, TtsError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let rest = std::mem::take(&mut self.pending);
        Ok(Some(Bytes::from(self.encoder.encode(&rest)?)))
    }
}

/// Little-endian signed 16-bit PCM to f32.
pub fn pcm_i16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}
