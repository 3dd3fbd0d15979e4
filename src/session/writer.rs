//! Typed signaling towards the device.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::codec::AudioFormat;
use crate::core::mcp::McpPayloadSink;
use crate::core::mcp::McpError;
use crate::transport::{Transport, TransportError};

use super::client_state::{ClientState, SessionStatus};
use super::messages::{PROTOCOL_VERSION, SERVER_HELLO_TEXT, ServerMessage, TtsState, UdpParams};

const MCP_INBOUND_QUEUE: usize = 100;

pub struct ServerTransport {
    transport: Arc<dyn Transport>,
    state: Arc<ClientState>,
    mcp_tx: mpsc::Sender<String>,
    mcp_rx: parking_lot::Mutex<Option<mpsc::Receiver<String>>>,
}

impl ServerTransport {
    pub fn new(transport: Arc<dyn Transport>, state: Arc<ClientState>) -> Self {
        let (mcp_tx, mcp_rx) = mpsc::channel(MCP_INBOUND_QUEUE);
        Self {
            transport,
            state,
            mcp_tx,
            mcp_rx: parking_lot::Mutex::new(Some(mcp_rx)),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    async fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
        let json = serde_json::to_string(&message).map_err(|e| TransportError::Send(e.to_string()))?;
        self.transport.send_signal(json).await
    }

    pub async fn send_hello(
        &self,
        transport: &str,
        audio_params: AudioFormat,
        udp: Option<UdpParams>,
    ) -> Result<(), TransportError> {
        self.send(ServerMessage::Hello {
            text: SERVER_HELLO_TEXT.to_string(),
            version: PROTOCOL_VERSION,
            transport: transport.to_string(),
            session_id: self.state.session_id(),
            audio_params,
            udp,
        })
        .await
    }

    pub async fn send_stt(&self, text: &str) -> Result<(), TransportError> {
        self.send(ServerMessage::Stt {
            text: text.to_string(),
            session_id: self.state.session_id(),
        })
        .await
    }

    async fn send_tts(&self, state: TtsState, text: Option<&str>) -> Result<(), TransportError> {
        self.send(ServerMessage::Tts {
            state,
            text: text.map(str::to_string),
            session_id: self.state.session_id(),
        })
        .await
    }

    pub async fn send_tts_start(&self) -> Result<(), TransportError> {
        self.send_tts(TtsState::Start, None).await?;
        self.state.set_tts_started(true);
        Ok(())
    }

    pub async fn send_tts_stop(&self) -> Result<(), TransportError> {
        self.state.set_tts_started(false);
        self.send_tts(TtsState::Stop, None).await
    }

    pub async fn send_sentence_start(&self, text: &str) -> Result<(), TransportError> {
        self.send_tts(TtsState::SentenceStart, Some(text)).await?;
        self.state.set_status(SessionStatus::TtsRunning);
        Ok(())
    }

    pub async fn send_sentence_end(&self, text: &str) -> Result<(), TransportError> {
        self.send_tts(TtsState::SentenceEnd, Some(text)).await
    }

    pub async fn send_iot(&self, text: &str) -> Result<(), TransportError> {
        self.send(ServerMessage::Iot {
            text: text.to_string(),
            state: "success".to_string(),
            session_id: self.state.session_id(),
        })
        .await
    }

    pub async fn send_mcp(&self, payload: Value) -> Result<(), TransportError> {
        let result = self
            .send(ServerMessage::Mcp {
                payload,
                session_id: self.state.session_id(),
            })
            .await;
        if let Err(TransportError::Closed) = &result {
            debug!(device_id = %self.state.device_id, "Skipping MCP message, connection closed");
        }
        result
    }

    pub async fn send_audio(&self, frame: Bytes) -> Result<(), TransportError> {
        self.transport.send_audio(frame).await
    }

    /// Queue a JSON-RPC payload received from the device for its MCP client.
    pub fn deliver_mcp(&self, payload: String) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.mcp_tx.try_send(payload) {
            warn!(device_id = %self.state.device_id, "MCP inbound queue full, dropping message");
        }
    }

    /// The inbound MCP stream can be claimed once, by the IoT-over-MCP client.
    pub fn take_mcp_inbound(&self) -> Option<mpsc::Receiver<String>> {
        self.mcp_rx.lock().take()
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

#[async_trait::async_trait]
impl McpPayloadSink for ServerTransport {
    async fn send_mcp_payload(&self, payload: Value) -> Result<(), McpError> {
        self.send_mcp(payload)
            .await
            .map_err(|e| match e {
                TransportError::Closed => McpError::SessionClosed,
                other => McpError::Transport(other.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device_config::DeviceConfig;
    use crate::session::tests::FakeTransport;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn writer() -> (ServerTransport, Arc<FakeTransport>, Arc<ClientState>) {
        let transport = FakeTransport::new("dev");
        let state = Arc::new(ClientState::new("dev", DeviceConfig::default(), 200, CancellationToken::new()));
        state.set_session_id("s-1");
        (ServerTransport::new(transport.clone(), Arc::clone(&state)), transport, state)
    }

    #[tokio::test]
    async fn test_tts_framing_tracks_state() {
        let (writer, transport, state) = writer();
        writer.send_tts_start().await.unwrap();
        assert!(state.tts_started());
        writer.send_sentence_start("你好").await.unwrap();
        assert_eq!(state.status(), SessionStatus::TtsRunning);
        writer.send_sentence_end("你好").await.unwrap();
        writer.send_tts_stop().await.unwrap();
        assert!(!state.tts_started());

        let states: Vec<String> = transport
            .sent_signals()
            .iter()
            .map(|m| m["state"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(states, vec!["start", "sentence_start", "sentence_end", "stop"]);
        assert!(transport.sent_signals().iter().all(|m| m["session_id"] == "s-1"));
    }

    #[tokio::test]
    async fn test_mcp_sink_wraps_payload() {
        let (writer, transport, _state) = writer();
        writer
            .send_mcp_payload(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .await
            .unwrap();
        let sent = transport.sent_signals();
        assert_eq!(sent[0]["type"], "mcp");
        assert_eq!(sent[0]["payload"]["method"], "tools/list");
    }

    #[tokio::test]
    async fn test_mcp_inbound_claimed_once() {
        let (writer, _transport, _state) = writer();
        writer.deliver_mcp("{}".into());
        let mut inbound = writer.take_mcp_inbound().unwrap();
        assert!(writer.take_mcp_inbound().is_none());
        assert_eq!(inbound.recv().await.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_closed_transport_maps_to_session_closed() {
        let (writer, transport, _state) = writer();
        transport.close().await;
        let err = writer.send_mcp_payload(json!({})).await.unwrap_err();
        assert!(err.is_session_closed());
    }
}
