mod base;
pub mod openai;
pub mod segmenter;

use std::sync::Arc;

use serde::Deserialize;

pub use base::{
    ChatMessage, LlmChunk, LlmError, LlmProvider, LlmStream, Role, ToolCall, ToolSchema,
};
pub use openai::{OpenAiConfig, OpenAiLlm};
pub use segmenter::{SegmenterConfig, SentenceSegmenter};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "provider", content = "config", rename_all = "snake_case")]
pub enum LlmProviderConfig {
    Openai(OpenAiConfig),
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self::Openai(OpenAiConfig::default())
    }
}

pub fn create_llm_provider(config: &LlmProviderConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config {
        LlmProviderConfig::Openai(cfg) => Ok(Arc::new(OpenAiLlm::new(cfg.clone())?)),
    }
}
