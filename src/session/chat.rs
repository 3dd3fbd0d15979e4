//! One device conversation: signaling dispatch, chat-text queue and teardown.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::codec::{AudioCodec, AudioFormat, OpusDecoder};
use crate::core::llm::ChatMessage;
use crate::core::mcp::{ClientRole, DeviceMcpPool, McpClient, SignalingTransport, ToolResolver};
use crate::core::memory::DialogueMemory;
use crate::core::vad::VadPool;
use crate::transport::mqtt_udp::{KEY_AES, KEY_FULL_NONCE};
use crate::transport::{Transport, TransportError, TransportKind};

use super::asr::AsrManager;
use super::client_state::{ClientState, SessionStatus};
use super::llm::LlmManager;
use super::manager::ProviderFactory;
use super::messages::{ClientMessage, ListenMode, ListenState, UdpParams};
use super::queue::BoundedQueue;
use super::registry::ManagedSession;
use super::tts::TtsManager;
use super::writer::ServerTransport;
use super::{SessionError, SessionSettings, normalize_utterance, spawn_guarded};

pub const SIGNAL_RECV_TIMEOUT: Duration = Duration::from_secs(120);
pub const CHAT_QUEUE_SIZE: usize = 10;
pub const DEFAULT_OUTPUT_FORMAT: AudioFormat = AudioFormat::opus(16000, 1, 60);

/// Process-wide services a session draws on.
#[derive(Clone)]
pub struct SessionServices {
    pub settings: Arc<SessionSettings>,
    pub memory: Arc<dyn DialogueMemory>,
    pub tools: ToolResolver,
    pub device_mcp: Arc<DeviceMcpPool>,
    pub providers: Arc<dyn ProviderFactory>,
    pub vad_pool: Option<Arc<VadPool>>,
}

/// A recognized utterance waiting for the model.
struct ChatItem {
    turn: CancellationToken,
    text: String,
}

pub struct ChatSession {
    pub(super) me: Weak<ChatSession>,
    pub(super) state: Arc<ClientState>,
    pub(super) writer: Arc<ServerTransport>,
    pub(super) asr: AsrManager,
    pub(super) llm: Arc<LlmManager>,
    pub(super) tts: Arc<TtsManager>,
    pub(super) services: SessionServices,
    pub(super) decoder: parking_lot::Mutex<Option<OpusDecoder>>,
    chat_queue: BoundedQueue<ChatItem>,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn Transport>, state: Arc<ClientState>, services: SessionServices) -> Arc<Self> {
        let writer = Arc::new(ServerTransport::new(transport, Arc::clone(&state)));
        let tts = Arc::new(TtsManager::new(Arc::clone(&state), Arc::clone(&writer)));
        let llm = Arc::new(LlmManager::new(
            Arc::clone(&state),
            Arc::clone(&writer),
            Arc::clone(&tts),
            Arc::clone(&services.memory),
            services.tools.clone(),
            services.settings.chat.segmenter,
        ));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            asr: AsrManager::new(Arc::clone(&state)),
            state,
            writer,
            llm,
            tts,
            services,
            decoder: parking_lot::Mutex::new(None),
            chat_queue: BoundedQueue::new(CHAT_QUEUE_SIZE),
        })
    }

    pub fn state(&self) -> &Arc<ClientState> {
        &self.state
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.writer.transport()
    }

    /// Start the session tasks. Every task ends when the session root is
    /// cancelled; the last one standing tears the connection down.
    pub fn start(self: &Arc<Self>) {
        let root = self.state.root().clone();
        let device_id = self.state.device_id.clone();

        spawn_guarded("signal", device_id.clone(), root.clone(), Arc::clone(self).signal_loop());
        spawn_guarded("audio", device_id.clone(), root.clone(), Arc::clone(self).audio_loop());
        spawn_guarded("chat", device_id.clone(), root.clone(), Arc::clone(self).chat_loop());
        spawn_guarded("llm", device_id.clone(), root.clone(), Arc::clone(&self.llm).run());
        spawn_guarded("tts", device_id.clone(), root.clone(), Arc::clone(&self.tts).run());

        let session = Arc::clone(self);
        tokio::spawn(async move {
            root.cancelled().await;
            session.teardown().await;
        });
        info!(device_id = %device_id, kind = %self.transport().kind(), "Chat session started");
    }

    async fn teardown(&self) {
        self.chat_queue.close();
        self.state.stop_asr();
        self.state.release_vad().await;
        self.writer.close().await;
        info!(device_id = %self.state.device_id, "Chat session closed");
    }

    async fn signal_loop(self: Arc<Self>) {
        let root = self.state.root().clone();
        loop {
            let received = tokio::select! {
                _ = root.cancelled() => break,
                received = self.transport().recv_signal(SIGNAL_RECV_TIMEOUT) => received,
            };
            match received {
                Ok(raw) => self.handle_text(&raw).await,
                Err(TransportError::Timeout) => {
                    debug!(device_id = %self.state.device_id, "No signaling within {:?}", SIGNAL_RECV_TIMEOUT);
                }
                Err(e) => {
                    info!(device_id = %self.state.device_id, "Signaling ended: {}", e);
                    root.cancel();
                    break;
                }
            }
        }
    }

    pub(super) async fn handle_text(&self, raw: &str) {
        let message = match ClientMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(device_id = %self.state.device_id, "Ignoring malformed signaling message: {}", e);
                return;
            }
        };
        let kind = message.kind();
        debug!(device_id = %self.state.device_id, kind, "Signaling message");
        if let Err(e) = self.dispatch(message).await {
            error!(device_id = %self.state.device_id, kind, "Failed to handle message: {}", e);
        }
    }

    async fn dispatch(&self, message: ClientMessage) -> Result<(), SessionError> {
        let wants_mcp = message.wants_mcp();
        match message {
            ClientMessage::Hello {
                transport,
                audio_params,
                ..
            } => self.handle_hello(transport.as_deref(), audio_params, wants_mcp).await,
            ClientMessage::Listen { state, mode, text } => self.handle_listen(state, mode, text).await,
            ClientMessage::Abort { reason } => {
                info!(device_id = %self.state.device_id, reason = ?reason, "Abort");
                self.stop_speaking(true).await;
                Ok(())
            }
            ClientMessage::Iot { text, .. } => {
                let text = text.unwrap_or_default();
                info!(device_id = %self.state.device_id, text = %text, "IoT command");
                self.writer.send_iot(&text).await.map_err(Into::into)
            }
            ClientMessage::Mcp { payload } => {
                if self.services.device_mcp.get(&self.state.device_id).is_some() {
                    self.writer.deliver_mcp(payload.to_string());
                } else {
                    debug!(device_id = %self.state.device_id, "MCP payload without a device MCP session");
                }
                Ok(())
            }
            ClientMessage::Goodbye {} => {
                info!(device_id = %self.state.device_id, "Goodbye, releasing audio channel");
                self.transport().close_audio_channel().await;
                Ok(())
            }
        }
    }

    async fn handle_hello(
        &self,
        requested: Option<&str>,
        audio_params: Option<AudioFormat>,
        wants_mcp: bool,
    ) -> Result<(), SessionError> {
        self.state.set_session_id(uuid::Uuid::new_v4().to_string());

        let input = audio_params.unwrap_or_default();
        self.state.set_input_format(input);
        *self.decoder.lock() = match input.format {
            AudioCodec::Opus => Some(OpusDecoder::new(input)?),
            AudioCodec::Pcm => None,
        };

        let providers = match self.state.providers() {
            Some(providers) => providers,
            None => {
                let providers = self.services.providers.create(&self.state.device_config).await?;
                self.state.set_providers(providers.clone());
                if let Some(pool) = &self.services.vad_pool {
                    self.state.acquire_vad(pool).await;
                }
                providers
            }
        };
        self.state
            .set_output_format(providers.tts.preferred_format().unwrap_or(DEFAULT_OUTPUT_FORMAT));

        if wants_mcp {
            self.attach_device_mcp();
        }

        let kind = match requested {
            Some("udp") => TransportKind::Udp,
            Some("websocket") => TransportKind::Websocket,
            _ => self.transport().kind(),
        };
        info!(
            device_id = %self.state.device_id,
            session_id = %self.state.session_id(),
            transport = %kind,
            input = ?input,
            "Hello"
        );

        let output = self.state.output_format();
        match kind {
            TransportKind::Websocket => self.writer.send_hello("websocket", output, None).await?,
            TransportKind::Udp => {
                let settings = &self.services.settings;
                let transport = self.transport();
                let (Some(key), Some(nonce)) = (transport.get(KEY_AES), transport.get(KEY_FULL_NONCE)) else {
                    return Err(TransportError::Send("transport has no UDP session".to_string()).into());
                };
                let udp = UdpParams {
                    server: settings.udp_external_host.clone(),
                    port: settings.udp_external_port,
                    key,
                    nonce,
                };
                self.writer.send_hello("udp", output, Some(udp)).await?
            }
        }
        Ok(())
    }

    /// Bring up IoT-over-MCP on the signaling channel. Runs in the background
    /// since the handshake needs the signal loop to deliver replies.
    fn attach_device_mcp(&self) {
        let Some(inbound) = self.writer.take_mcp_inbound() else {
            return;
        };
        let device_id = self.state.device_id.clone();
        let transport = Arc::new(SignalingTransport::new(
            Arc::clone(&self.writer) as _,
            self.services.settings.vision.clone(),
        ));
        let client = McpClient::new(ClientRole::IotOverMcp.server_name(&device_id), transport, inbound);
        let session = self.services.device_mcp.get_or_create(&device_id);
        tokio::spawn(async move {
            if let Err(e) = session
                .attach(ClientRole::IotOverMcp, client, serde_json::Map::new())
                .await
            {
                warn!(device_id = %device_id, "IoT-over-MCP handshake failed: {}", e);
            }
        });
    }

    async fn handle_listen(
        &self,
        state: ListenState,
        mode: Option<ListenMode>,
        text: Option<String>,
    ) -> Result<(), SessionError> {
        info!(device_id = %self.state.device_id, state = ?state, mode = ?mode, "Listen");
        match state {
            ListenState::Start => {
                if let Some(mode) = mode {
                    self.state.set_listen_mode(mode);
                }
                if self.state.listen_mode() == ListenMode::Manual {
                    self.stop_speaking(false).await;
                }
                self.state.set_status(SessionStatus::Listening);
                self.on_listen_start().await
            }
            ListenState::Stop => {
                self.state.on_voice_silence();
                Ok(())
            }
            ListenState::Detect => self.handle_detect(text.unwrap_or_default()).await,
        }
    }

    async fn handle_detect(&self, text: String) -> Result<(), SessionError> {
        self.stop_speaking(false).await;
        let text = normalize_utterance(&text);
        if text.is_empty() {
            return Ok(());
        }

        let chat = &self.services.settings.chat;
        if chat.is_wakeup_word(&text) {
            if chat.enable_greeting && self.state.begin_greeting() {
                let greeting = chat.random_greeting();
                self.llm.enqueue_text(&self.state.turn(), &greeting, true).await?;
            }
            return Ok(());
        }
        self.push_chat_text(&text).await
    }

    /// Queue a recognized utterance for the model.
    pub(super) async fn push_chat_text(&self, text: &str) -> Result<(), SessionError> {
        let pushed = self
            .chat_queue
            .push(ChatItem {
                turn: self.state.turn(),
                text: text.to_string(),
            })
            .await;
        if let Err(e) = &pushed {
            warn!(device_id = %self.state.device_id, "Chat queue rejected utterance: {}", e);
        }
        pushed.map_err(Into::into)
    }

    async fn chat_loop(self: Arc<Self>) {
        let root = self.state.root().clone();
        while let Some(item) = self.chat_queue.pop(&root).await {
            if item.turn.is_cancelled() {
                continue;
            }
            match self.do_chat(&item.turn, &item.text).await {
                Ok(()) | Err(SessionError::Cancelled) => {}
                Err(e) => error!(device_id = %self.state.device_id, "Chat turn failed: {}", e),
            }
        }
    }

    async fn do_chat(&self, turn: &CancellationToken, text: &str) -> Result<(), SessionError> {
        let device_id = self.state.device_id.as_str();
        if self.services.settings.chat.is_exit_phrase(text) {
            info!(device_id = %device_id, text = %text, "Exit phrase, closing session");
            self.close().await;
            return Ok(());
        }

        let chat = &self.services.settings.chat;
        let mut messages = Vec::with_capacity(chat.memory_turns + 2);
        let system_prompt = &self.state.device_config.system_prompt;
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::system(system_prompt.clone()));
        }
        messages.extend(self.services.memory.recent(device_id, chat.memory_turns).await);
        messages.push(ChatMessage::user(text));

        let tools = self.services.tools.schemas(device_id);
        info!(device_id = %device_id, text = %text, tools = tools.len(), "Chat turn");
        self.llm.do_request(turn, messages, tools, 1).await
    }

    /// Interrupt the current reply: cancel the turn, drop queued work and
    /// optionally close the `tts` framing. Safe to call repeatedly.
    pub async fn stop_speaking(&self, send_tts_stop: bool) {
        let cancelled = self.state.cancel_turn();
        let dropped = self.llm.clear() + self.chat_queue.clear() + self.tts.clear();
        if send_tts_stop && self.state.tts_started() {
            if let Err(e) = self.writer.send_tts_stop().await {
                warn!(device_id = %self.state.device_id, "Failed to send tts stop: {}", e);
            }
        }
        self.state.set_status(SessionStatus::Idle);
        if cancelled || dropped > 0 {
            debug!(device_id = %self.state.device_id, dropped, "Stopped speaking");
        }
    }
}

#[async_trait::async_trait]
impl ManagedSession for ChatSession {
    fn device_id(&self) -> &str {
        &self.state.device_id
    }

    fn cancel(&self) {
        self.state.root().cancel();
    }

    async fn close(&self) {
        self.state.root().cancel();
        self.writer.close().await;
    }

    fn is_closed(&self) -> bool {
        self.state.root().is_cancelled()
    }
}
