//! Device chat sessions.
//!
//! A [`ChatSession`] owns one transport and runs the cooperating tasks of a
//! conversation: signaling, audio and VAD, chat-text dispatch, LLM responses
//! and TTS pacing. [`SessionManager`] turns a freshly accepted transport into
//! a running, registered session.

pub mod asr;
pub mod chat;
pub mod client_state;
pub mod llm;
pub mod manager;
pub mod messages;
pub mod queue;
pub mod registry;
pub mod tts;
pub mod writer;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::core::asr::AsrError;
use crate::core::codec::CodecError;
use crate::core::llm::{LlmError, SegmenterConfig};
use crate::core::mcp::{McpError, VisionCapability};
use crate::core::pool::PoolError;
use crate::core::tts::TtsError;
use crate::transport::TransportError;

pub use chat::ChatSession;
pub use client_state::{ClientState, Providers, SessionStatus};
pub use manager::{DefaultProviderFactory, ProviderFactory, SessionManager};
pub use messages::{ClientMessage, ListenMode, ListenState, ServerMessage, TtsState};
pub use queue::{BoundedQueue, QueueError};
pub use registry::{ManagedSession, SessionRegistry};
pub use writer::ServerTransport;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("ASR error: {0}")]
    Asr(#[from] AsrError),
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
    #[error("TTS error: {0}")]
    Tts(#[from] TtsError),
    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Turn cancelled")]
    Cancelled,
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("Session providers are not initialized")]
    NotReady,
}

pub const DEFAULT_GREETING: &str = "你好，有啥好玩的.";

/// Conversation behaviour shared by every session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Seconds an empty recognition may be retried before the session closes.
    pub max_idle_secs: u64,
    /// Silence after voice that ends the utterance.
    pub max_silence_ms: u64,
    pub enable_greeting: bool,
    pub greetings: Vec<String>,
    pub wakeup_words: Vec<String>,
    pub exit_phrases: Vec<String>,
    /// Dialogue messages replayed into each request.
    pub memory_turns: usize,
    pub segmenter: SegmenterConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: 60,
            max_silence_ms: 200,
            enable_greeting: true,
            greetings: vec![DEFAULT_GREETING.to_string()],
            wakeup_words: vec!["你好小智".to_string(), "小智小智".to_string(), "嗨小智".to_string()],
            exit_phrases: ["退下吧", "退出", "退出对话", "停止", "停止说话"]
                .into_iter()
                .map(String::from)
                .collect(),
            memory_turns: 10,
            segmenter: SegmenterConfig::default(),
        }
    }
}

impl ChatConfig {
    pub fn is_wakeup_word(&self, text: &str) -> bool {
        let text = normalize_utterance(text);
        !text.is_empty() && self.wakeup_words.iter().any(|w| normalize_utterance(w) == text)
    }

    pub fn is_exit_phrase(&self, text: &str) -> bool {
        let text = normalize_utterance(text);
        !text.is_empty() && self.exit_phrases.iter().any(|p| normalize_utterance(p) == text)
    }

    pub fn random_greeting(&self) -> String {
        use rand::seq::IndexedRandom;
        self.greetings
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| DEFAULT_GREETING.to_string())
    }
}

/// Drop whitespace and punctuation (ASCII and CJK) so spoken variants compare equal.
pub fn normalize_utterance(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace() && !c.is_ascii_punctuation() && !is_cjk_punctuation(*c))
        .collect()
}

fn is_cjk_punctuation(c: char) -> bool {
    matches!(
        c,
        '，' | '。' | '！' | '？' | '、' | '；' | '：' | '“' | '”' | '‘' | '’' | '（' | '）' | '《' | '》' | '…' | '—' | '～'
    )
}

/// Values every session needs besides its own state.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub chat: ChatConfig,
    /// Address advertised to MQTT devices in the `udp` block of `hello`.
    pub udp_external_host: String,
    pub udp_external_port: u16,
    pub vision: Option<VisionCapability>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn a session task. A panic is logged and cancels `scope`, which tears
/// the session down instead of leaving it half alive.
pub(crate) fn spawn_guarded<F>(task: &'static str, device_id: String, scope: CancellationToken, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            error!(
                device_id = %device_id,
                task,
                "Session task panicked: {}",
                panic_message(panic.as_ref())
            );
            scope.cancel();
        }
    })
}
