//! Per-device provider selection and prompt.

use std::collections::HashMap;

use serde::Deserialize;

use crate::core::asr::AsrProviderConfig;
use crate::core::llm::LlmProviderConfig;
use crate::core::tts::TtsProviderConfig;
use crate::core::vad::VadProviderConfig;

pub const DEFAULT_SYSTEM_PROMPT: &str = "你是小智，一个友好的语音助手。回答要口语化、简短。";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub system_prompt: String,
    pub asr: AsrProviderConfig,
    pub llm: LlmProviderConfig,
    pub tts: TtsProviderConfig,
    pub vad: VadProviderConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            asr: AsrProviderConfig::default(),
            llm: LlmProviderConfig::default(),
            tts: TtsProviderConfig::default(),
            vad: VadProviderConfig::default(),
        }
    }
}

#[async_trait::async_trait]
pub trait DeviceConfigProvider: Send + Sync {
    async fn device_config(&self, device_id: &str) -> DeviceConfig;
}

/// Serves the configured defaults, with optional per-device overrides.
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceConfigProvider {
    default: DeviceConfig,
    overrides: HashMap<String, DeviceConfig>,
}

impl StaticDeviceConfigProvider {
    pub fn new(default: DeviceConfig) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, device_id: impl Into<String>, config: DeviceConfig) -> Self {
        self.overrides.insert(device_id.into(), config);
        self
    }
}

#[async_trait::async_trait]
impl DeviceConfigProvider for StaticDeviceConfigProvider {
    async fn device_config(&self, device_id: &str) -> DeviceConfig {
        self.overrides
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_override_wins() {
        let special = DeviceConfig {
            system_prompt: "be terse".to_string(),
            ..DeviceConfig::default()
        };
        let provider = StaticDeviceConfigProvider::default().with_override("aa:bb", special.clone());

        assert_eq!(provider.device_config("aa:bb").await, special);
        assert_eq!(provider.device_config("cc:dd").await.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
system_prompt: "hello"
llm:
  provider: openai
  config:
    model: qwen-plus
"#;
        let config: DeviceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.system_prompt, "hello");
        assert_eq!(config.asr, AsrProviderConfig::default());
        let LlmProviderConfig::Openai(llm) = config.llm;
        assert_eq!(llm.model, "qwen-plus");
    }
}
