//! WebSocket transport: text frames carry signaling, binary frames carry Opus.

use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    CloseCallback, CloseHooks, RECV_QUEUE_SIZE, Transport, TransportError, TransportKind, offer,
    recv_with_timeout,
};

/// The reader gives up on a socket that stays silent this long.
pub const READ_DEADLINE: Duration = Duration::from_secs(120);

const BRIDGE_HEADER_LEN: usize = 16;

pub struct WebSocketTransport {
    device_id: String,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    signal_rx: Mutex<mpsc::Receiver<String>>,
    audio_rx: Mutex<mpsc::Receiver<Bytes>>,
    closed: CancellationToken,
    hooks: CloseHooks,
}

impl WebSocketTransport {
    /// Take ownership of an upgraded socket and start its read loop.
    ///
    /// With `bridge` set, binary frames relayed by an MQTT-UDP bridge have
    /// their 16-byte header stripped before they reach the audio queue.
    pub fn spawn(socket: WebSocket, device_id: impl Into<String>, bridge: bool) -> Arc<Self> {
        let device_id = device_id.into();
        let (sink, stream) = socket.split();
        let (signal_tx, signal_rx) = mpsc::channel(RECV_QUEUE_SIZE);
        let (audio_tx, audio_rx) = mpsc::channel(RECV_QUEUE_SIZE);

        let transport = Arc::new(Self {
            device_id,
            sink: Mutex::new(sink),
            signal_rx: Mutex::new(signal_rx),
            audio_rx: Mutex::new(audio_rx),
            closed: CancellationToken::new(),
            hooks: CloseHooks::default(),
        });

        tokio::spawn(read_loop(
            Arc::downgrade(&transport),
            transport.device_id.clone(),
            transport.closed.clone(),
            stream,
            signal_tx,
            audio_tx,
            bridge,
        ));

        info!(device_id = %transport.device_id, bridge, "WebSocket transport started");
        transport
    }

    fn shutdown(&self) {
        self.closed.cancel();
        if self.hooks.fire(&self.device_id) {
            info!(device_id = %self.device_id, "WebSocket transport closed");
        }
    }
}

async fn read_loop(
    transport: Weak<WebSocketTransport>,
    device_id: String,
    closed: CancellationToken,
    mut stream: SplitStream<WebSocket>,
    signal_tx: mpsc::Sender<String>,
    audio_tx: mpsc::Sender<Bytes>,
    bridge: bool,
) {
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = tokio::time::timeout(READ_DEADLINE, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                warn!(device_id = %device_id, "No frame within read deadline, closing");
                break;
            }
            Ok(None) => {
                debug!(device_id = %device_id, "Peer closed the socket");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(device_id = %device_id, "WebSocket read error: {}", e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => offer(&signal_tx, text.to_string(), "signal", &device_id),
            Message::Binary(data) => {
                let frame = if bridge { unwrap_bridge_frame(data) } else { data };
                offer(&audio_tx, frame, "audio", &device_id);
            }
            Message::Close(_) => {
                debug!(device_id = %device_id, "Received close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    if let Some(transport) = transport.upgrade() {
        transport.shutdown();
    }
}

/// Strip the MQTT-UDP bridge header: eight zero bytes, then a big-endian
/// payload length at `[12..16]` that must match the remaining bytes.
/// Frames that do not carry the header pass through untouched.
pub fn unwrap_bridge_frame(data: Bytes) -> Bytes {
    if data.len() < BRIDGE_HEADER_LEN || data[..8].iter().any(|b| *b != 0) {
        return data;
    }
    let declared = u32::from_be_bytes([data[12], data[13], data[14], data[15]]) as usize;
    if declared != data.len() - BRIDGE_HEADER_LEN {
        return data;
    }
    data.slice(BRIDGE_HEADER_LEN..)
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn send_signal(&self, message: String) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(message.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv_signal(&self, timeout: Duration) -> Result<String, TransportError> {
        recv_with_timeout(&self.signal_rx, timeout).await
    }

    async fn send_audio(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv_audio(&self, timeout: Duration) -> Result<Bytes, TransportError> {
        recv_with_timeout(&self.audio_rx, timeout).await
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn on_close(&self, callback: CloseCallback) {
        self.hooks.register(&self.device_id, callback);
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!(device_id = %self.device_id, "Close frame not delivered: {}", e);
            }
        }
        self.shutdown();
    }

    async fn close_audio_channel(&self) {}

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridged(payload: &[u8]) -> Bytes {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        Bytes::from(frame)
    }

    #[test]
    fn test_bridge_header_is_stripped() {
        let frame = bridged(&[7, 8, 9]);
        assert_eq!(unwrap_bridge_frame(frame).as_ref(), &[7, 8, 9]);
    }

    #[test]
    fn test_plain_frames_pass_through() {
        let opus = Bytes::from_static(&[0x58, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        assert_eq!(unwrap_bridge_frame(opus.clone()), opus);

        let short = Bytes::from_static(&[0, 0, 0]);
        assert_eq!(unwrap_bridge_frame(short.clone()), short);
    }

    #[test]
    fn test_bridge_length_mismatch_passes_through() {
        let mut frame = bridged(&[1, 2, 3, 4]).to_vec();
        frame[15] = 9;
        let frame = Bytes::from(frame);
        assert_eq!(unwrap_bridge_frame(frame.clone()), frame);
    }
}
