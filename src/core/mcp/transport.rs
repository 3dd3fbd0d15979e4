//! Byte carriers for MCP JSON-RPC.
//!
//! A transport only moves serialized messages outward; inbound messages are
//! handed to the client as an `mpsc::Receiver<String>` when it is built.
//! Dropping the inbound sender means the peer is gone.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::McpError;
use super::protocol::{VisionCapability, methods};
use crate::utils::sse::SseLineParser;

pub const INBOUND_CHANNEL_SIZE: usize = 64;

#[async_trait::async_trait]
pub trait McpTransport: Send + Sync {
    async fn send(&self, message: String) -> Result<(), McpError>;

    async fn close(&self);
}

/// In-process channel transport. The owner of the receiving end pumps
/// messages to the real connection (e.g. the device's MCP WebSocket).
pub struct ChannelTransport {
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(capacity);
        (
            Self {
                outbound,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Cancelled once `close` is called.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[async_trait::async_trait]
impl McpTransport for ChannelTransport {
    async fn send(&self, message: String) -> Result<(), McpError> {
        if self.closed.is_cancelled() {
            return Err(McpError::SessionClosed);
        }
        self.outbound.send(message).await.map_err(|_| McpError::SessionClosed)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// Delivers `mcp` payloads over the device's own signaling channel.
#[async_trait::async_trait]
pub trait McpPayloadSink: Send + Sync {
    async fn send_mcp_payload(&self, payload: Value) -> Result<(), McpError>;
}

/// IoT-over-MCP: JSON-RPC wrapped in `{"type":"mcp","payload":..}` signaling
/// frames. `initialize` requests get `capabilities.vision` injected.
pub struct SignalingTransport {
    sink: Arc<dyn McpPayloadSink>,
    vision: Option<VisionCapability>,
}

impl SignalingTransport {
    pub fn new(sink: Arc<dyn McpPayloadSink>, vision: Option<VisionCapability>) -> Self {
        Self { sink, vision }
    }

    fn prepare(&self, message: &str) -> Result<Value, McpError> {
        let mut payload: Value =
            serde_json::from_str(message).map_err(|e| McpError::Serialization(e.to_string()))?;
        if let Some(vision) = &self.vision {
            inject_vision(&mut payload, vision);
        }
        Ok(payload)
    }
}

fn inject_vision(payload: &mut Value, vision: &VisionCapability) {
    if payload.get("method").and_then(Value::as_str) != Some(methods::INITIALIZE) {
        return;
    }
    let Some(params) = payload.get_mut("params").and_then(Value::as_object_mut) else {
        return;
    };
    let capabilities = params
        .entry("capabilities")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(capabilities) = capabilities.as_object_mut() {
        capabilities.insert(
            "vision".to_string(),
            serde_json::to_value(vision).unwrap_or(Value::Null),
        );
    }
}

#[async_trait::async_trait]
impl McpTransport for SignalingTransport {
    async fn send(&self, message: String) -> Result<(), McpError> {
        let payload = self.prepare(&message)?;
        self.sink.send_mcp_payload(payload).await
    }

    async fn close(&self) {}
}

/// Legacy MCP HTTP+SSE transport: a long-lived `GET` event stream announces
/// the POST endpoint (`event: endpoint`) and carries responses as `message`
/// events.
pub struct SseTransport {
    http: reqwest::Client,
    endpoint: Url,
    shutdown: CancellationToken,
}

impl SseTransport {
    pub async fn connect(
        http: reqwest::Client,
        sse_url: &str,
        connect_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<String>), McpError> {
        let base = Url::parse(sse_url).map_err(|e| McpError::Transport(format!("invalid SSE url: {e}")))?;
        let response = http
            .get(base.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(McpError::Transport(format!("SSE connect returned {}", response.status())));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let shutdown = CancellationToken::new();
        let reader_shutdown = shutdown.clone();

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut parser = SseLineParser::new();
            let mut endpoint_tx = Some(endpoint_tx);

            loop {
                let events = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    chunk = bytes.next() => match chunk {
                        Some(Ok(chunk)) => parser.push(&chunk),
                        Some(Err(e)) => {
                            warn!("MCP SSE stream error: {}", e);
                            break;
                        }
                        None => break,
                    },
                };

                for event in events {
                    match event.kind() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(event.data);
                            }
                        }
                        "message" => {
                            if inbound_tx.send(event.data).await.is_err() {
                                return;
                            }
                        }
                        other => debug!(event = other, "Ignoring MCP SSE event"),
                    }
                }
            }
            info!("MCP SSE stream closed");
        });

        let endpoint = tokio::time::timeout(connect_timeout, endpoint_rx)
            .await
            .map_err(|_| McpError::Timeout("SSE endpoint".to_string()))?
            .map_err(|_| McpError::SessionClosed)?;
        let endpoint = base
            .join(endpoint.trim())
            .map_err(|e| McpError::Transport(format!("invalid endpoint: {e}")))?;
        debug!(%endpoint, "MCP SSE endpoint announced");

        Ok((
            Self {
                http,
                endpoint,
                shutdown,
            },
            inbound_rx,
        ))
    }
}

#[async_trait::async_trait]
impl McpTransport for SseTransport {
    async fn send(&self, message: String) -> Result<(), McpError> {
        if self.shutdown.is_cancelled() {
            return Err(McpError::SessionClosed);
        }
        let response = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(message)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!("POST returned {status}: {body}")));
        }
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
