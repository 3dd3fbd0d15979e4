//! Voice activity detection.
//!
//! Detectors are pooled (see [`crate::core::pool`]) because backends may hold
//! native state; sessions borrow one per connection and fall back to manual
//! turn-taking when the pool is exhausted.

mod energy;
mod voice_status;

use serde::Deserialize;

use crate::core::pool::{PoolError, ResourceFactory};

pub use energy::{EnergyVad, EnergyVadConfig};
pub use voice_status::{VoiceEvent, VoiceStatus};

#[derive(Debug, Clone, thiserror::Error)]
pub enum VadError {
    #[error("Invalid VAD configuration: {0}")]
    Configuration(String),
    #[error("Unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),
}

/// Frame level speech classifier.
pub trait VoiceDetector: Send {
    fn is_speech(&mut self, pcm: &[f32], sample_rate: u32) -> Result<bool, VadError>;

    fn reset(&mut self);
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "provider", content = "config", rename_all = "snake_case")]
pub enum VadProviderConfig {
    Energy(EnergyVadConfig),
}

impl Default for VadProviderConfig {
    fn default() -> Self {
        Self::Energy(EnergyVadConfig::default())
    }
}

pub fn create_vad(config: &VadProviderConfig) -> Result<Box<dyn VoiceDetector>, VadError> {
    match config {
        VadProviderConfig::Energy(cfg) => Ok(Box::new(EnergyVad::new(cfg.clone())?)),
    }
}

/// Pool factory producing detectors from one provider config.
pub struct VadFactory {
    config: VadProviderConfig,
}

impl VadFactory {
    pub fn new(config: VadProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl ResourceFactory for VadFactory {
    type Resource = Box<dyn VoiceDetector>;

    async fn create(&self) -> Result<Self::Resource, PoolError> {
        create_vad(&self.config).map_err(|e| PoolError::Create(e.to_string()))
    }

    fn reset(&self, detector: &mut Self::Resource) -> Result<(), PoolError> {
        detector.reset();
        Ok(())
    }
}

pub type VadPool = crate::core::pool::ResourcePool<VadFactory>;
