//! Shared fixtures for integration tests: scripted providers and a server
//! bound to an ephemeral port.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use xiaozhi_server::core::asr::{AsrError, AsrProvider, AsrResult, AsrStream};
use xiaozhi_server::core::codec::AudioFormat;
use xiaozhi_server::core::device_config::DeviceConfig;
use xiaozhi_server::core::llm::{ChatMessage, LlmChunk, LlmError, LlmProvider, LlmStream, ToolSchema};
use xiaozhi_server::core::tts::{TtsError, TtsProvider, TtsStream};
use xiaozhi_server::session::{ProviderFactory, Providers, SessionError};
use xiaozhi_server::{ServerConfig, routes, state::AppState};

/// Emits one queued transcript as a final result once its audio input closes.
pub struct ScriptedAsr {
    transcripts: Mutex<VecDeque<String>>,
    pub frames_received: Arc<AtomicUsize>,
}

impl ScriptedAsr {
    pub fn new(transcripts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            transcripts: Mutex::new(transcripts.iter().map(|t| t.to_string()).collect()),
            frames_received: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait::async_trait]
impl AsrProvider for ScriptedAsr {
    async fn streaming_recognize(
        &self,
        cancel: CancellationToken,
        mut audio: mpsc::Receiver<Vec<f32>>,
    ) -> Result<AsrStream, AsrError> {
        let text = self.transcripts.lock().pop_front().unwrap_or_default();
        let frames = Arc::clone(&self.frames_received);
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = audio.recv() => match frame {
                        Some(_) => { frames.fetch_add(1, Ordering::SeqCst); }
                        None => break,
                    },
                }
            }
            let _ = tx.send(Ok(AsrResult::new(text, true))).await;
        });
        Ok(rx)
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}

/// Replies with fixed text and records every request.
pub struct ScriptedLlm {
    reply: String,
    pub requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedLlm {
    async fn stream_chat(
        &self,
        _cancel: CancellationToken,
        messages: Vec<ChatMessage>,
        _tools: Vec<ToolSchema>,
    ) -> Result<LlmStream, LlmError> {
        self.requests.lock().push(messages);
        let (tx, rx) = mpsc::channel(4);
        let _ = tx.send(Ok(LlmChunk::text(self.reply.clone()))).await;
        Ok(rx)
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Produces `frames` small binary frames per sentence.
pub struct ToneTts {
    frames: usize,
    pub spoken: Mutex<Vec<String>>,
}

impl ToneTts {
    pub fn new(frames: usize) -> Arc<Self> {
        Arc::new(Self {
            frames,
            spoken: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl TtsProvider for ToneTts {
    async fn synthesize_stream(
        &self,
        _cancel: CancellationToken,
        text: &str,
        _format: AudioFormat,
    ) -> Result<TtsStream, TtsError> {
        self.spoken.lock().push(text.to_string());
        let (tx, rx) = mpsc::channel(self.frames.max(1));
        for i in 0..self.frames {
            let _ = tx.send(Ok(Bytes::from(vec![i as u8; 8]))).await;
        }
        Ok(rx)
    }

    fn provider_name(&self) -> &'static str {
        "tone"
    }
}

pub struct FixedProviders(pub Providers);

#[async_trait::async_trait]
impl ProviderFactory for FixedProviders {
    async fn create(&self, _config: &DeviceConfig) -> Result<Providers, SessionError> {
        Ok(self.0.clone())
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
}

impl TestServer {
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Serve the full router on 127.0.0.1 with an OS-assigned port.
pub async fn spawn_server(config: ServerConfig, providers: Providers) -> TestServer {
    let state = AppState::with_providers(config, Arc::new(FixedProviders(providers))).await;
    let app = routes::create_router(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, state }
}
