//! Device transports.
//!
//! Every device connection exposes the same four logical streams (signal
//! in/out, audio in/out) regardless of whether it arrived over a WebSocket or
//! over MQTT signaling with a UDP audio flow.

pub mod credentials;
pub mod mqtt_udp;
pub mod websocket;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

pub use credentials::{
    CredentialError, CredentialPolicy, MqttCredentialInfo, MqttCredentials, MqttIdentity, generate_credentials,
    validate_credentials,
};
pub use websocket::WebSocketTransport;

/// Per-direction queue depth for inbound signal and audio.
pub const RECV_QUEUE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Websocket,
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Websocket => write!(f, "websocket"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("receive timed out")]
    Timeout,
    #[error("audio channel closed")]
    AudioChannelClosed,
    #[error("{0} queue is full")]
    QueueFull(&'static str),
    #[error("send failed: {0}")]
    Send(String),
}

pub type CloseCallback = Box<dyn FnOnce(&str) + Send + Sync>;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send_signal(&self, message: String) -> Result<(), TransportError>;

    async fn recv_signal(&self, timeout: Duration) -> Result<String, TransportError>;

    async fn send_audio(&self, frame: Bytes) -> Result<(), TransportError>;

    async fn recv_audio(&self, timeout: Duration) -> Result<Bytes, TransportError>;

    fn device_id(&self) -> &str;

    fn kind(&self) -> TransportKind;

    /// Transport specific values handed to the signaling layer
    /// (`aes_key` and `full_nonce` for MQTT+UDP).
    fn get(&self, key: &str) -> Option<String>;

    /// Register a callback fired once when the connection ends. Callbacks run
    /// in registration order; registering after close runs it immediately.
    fn on_close(&self, callback: CloseCallback);

    async fn close(&self);

    async fn close_audio_channel(&self);

    fn is_closed(&self) -> bool;
}

/// Ordered, fire-once close callbacks.
#[derive(Default)]
pub struct CloseHooks {
    inner: Mutex<HooksState>,
}

#[derive(Default)]
struct HooksState {
    fired: bool,
    callbacks: Vec<CloseCallback>,
}

impl CloseHooks {
    pub fn register(&self, device_id: &str, callback: CloseCallback) {
        let mut inner = self.inner.lock();
        if inner.fired {
            drop(inner);
            callback(device_id);
            return;
        }
        inner.callbacks.push(callback);
    }

    /// Returns false when the hooks had already fired.
    pub fn fire(&self, device_id: &str) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.fired {
                return false;
            }
            inner.fired = true;
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback(device_id);
        }
        true
    }

    pub fn has_fired(&self) -> bool {
        self.inner.lock().fired
    }
}

/// Non-blocking enqueue used by transport read loops: inbound data is dropped
/// with a warning rather than stalling the socket.
pub(crate) fn offer<T>(tx: &mpsc::Sender<T>, item: T, queue: &'static str, device_id: &str) {
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(item) {
        warn!(device_id = %device_id, queue, "Receive queue full, dropping message");
    }
}

/// Receive with a deadline from a queue owned behind an async mutex.
pub(crate) async fn recv_with_timeout<T>(
    rx: &tokio::sync::Mutex<mpsc::Receiver<T>>,
    timeout: Duration,
) -> Result<T, TransportError> {
    let mut rx = rx.lock().await;
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(item)) => Ok(item),
        Ok(None) => Err(TransportError::Closed),
        Err(_) => Err(TransportError::Timeout),
    }
}
