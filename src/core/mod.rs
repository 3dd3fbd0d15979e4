pub mod asr;
pub mod codec;
pub mod device_config;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod pool;
pub mod state;
pub mod tts;
pub mod vad;

// Re-export commonly used types for convenience
pub use asr::{AsrError, AsrProvider, AsrProviderConfig, AsrResult, create_asr_provider};
pub use codec::{AudioCodec, AudioFormat};
pub use device_config::{DeviceConfig, DeviceConfigProvider, StaticDeviceConfigProvider};
pub use llm::{ChatMessage, LlmError, LlmProvider, LlmProviderConfig, create_llm_provider};
pub use tts::{TtsError, TtsProvider, TtsProviderConfig, create_tts_provider};

// Re-export CoreState for external use
pub use state::CoreState;
