mod base;
pub mod funasr;

use std::sync::Arc;

use serde::Deserialize;

pub use base::{AsrError, AsrProvider, AsrResult, AsrStream, pcm_f32_to_i16_le};
pub use funasr::{FunasrAsr, FunasrConfig};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "provider", content = "config", rename_all = "snake_case")]
pub enum AsrProviderConfig {
    Funasr(FunasrConfig),
}

impl Default for AsrProviderConfig {
    fn default() -> Self {
        Self::Funasr(FunasrConfig::default())
    }
}

pub fn create_asr_provider(config: &AsrProviderConfig) -> Result<Arc<dyn AsrProvider>, AsrError> {
    match config {
        AsrProviderConfig::Funasr(cfg) => Ok(Arc::new(FunasrAsr::new(cfg.clone())?)),
    }
}
