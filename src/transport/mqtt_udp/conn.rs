use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::udp::{UdpServer, UdpSession};
use crate::transport::{
    CloseCallback, CloseHooks, RECV_QUEUE_SIZE, Transport, TransportError, TransportKind, offer,
    recv_with_timeout,
};

pub const KEY_AES: &str = "aes_key";
pub const KEY_FULL_NONCE: &str = "full_nonce";

/// Outbound half of the MQTT signaling channel.
#[async_trait::async_trait]
pub trait SignalPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError>;
}

#[async_trait::async_trait]
impl SignalPublisher for AsyncClient {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        AsyncClient::publish(self, topic, QoS::AtMostOnce, false, payload.into_bytes())
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

/// One device reached over MQTT signaling plus an encrypted UDP audio flow.
pub struct MqttUdpTransport {
    device_id: String,
    publish_topic: String,
    publisher: Arc<dyn SignalPublisher>,
    signal_tx: mpsc::Sender<String>,
    signal_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    udp_server: Arc<UdpServer>,
    udp: RwLock<Option<Arc<UdpSession>>>,
    last_active: Mutex<Instant>,
    closed: CancellationToken,
    hooks: CloseHooks,
}

impl MqttUdpTransport {
    pub fn new(
        device_id: impl Into<String>,
        publish_topic: impl Into<String>,
        publisher: Arc<dyn SignalPublisher>,
        udp_server: Arc<UdpServer>,
    ) -> Arc<Self> {
        let device_id = device_id.into();
        let (signal_tx, signal_rx) = mpsc::channel(RECV_QUEUE_SIZE);
        let udp = udp_server.create_session(&device_id);
        Arc::new(Self {
            device_id,
            publish_topic: publish_topic.into(),
            publisher,
            signal_tx,
            signal_rx: tokio::sync::Mutex::new(signal_rx),
            udp_server,
            udp: RwLock::new(Some(udp)),
            last_active: Mutex::new(Instant::now()),
            closed: CancellationToken::new(),
            hooks: CloseHooks::default(),
        })
    }

    /// Hand an inbound MQTT payload to the signaling reader.
    pub fn deliver_signal(&self, payload: String) {
        if self.closed.is_cancelled() {
            return;
        }
        self.touch();
        offer(&self.signal_tx, payload, "signal", &self.device_id);
    }

    pub fn idle_for(&self) -> Duration {
        let signaling = self.last_active.lock().elapsed();
        match self.udp.read().as_ref() {
            Some(udp) => signaling.min(udp.idle_for()),
            None => signaling,
        }
    }

    pub fn udp_session(&self) -> Option<Arc<UdpSession>> {
        self.udp.read().clone()
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn destroy(&self) {
        self.closed.cancel();
        if let Some(udp) = self.udp.write().take() {
            self.udp_server.close_session(udp.conn_id());
        }
        if self.hooks.fire(&self.device_id) {
            info!(device_id = %self.device_id, "MQTT+UDP transport closed");
        }
    }
}

#[async_trait::async_trait]
impl Transport for MqttUdpTransport {
    async fn send_signal(&self, message: String) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.touch();
        self.publisher.publish(&self.publish_topic, message).await
    }

    async fn recv_signal(&self, timeout: Duration) -> Result<String, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = recv_with_timeout(&self.signal_rx, timeout) => result,
        }
    }

    async fn send_audio(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        match self.udp_session() {
            Some(udp) => udp.send(frame),
            None => Err(TransportError::AudioChannelClosed),
        }
    }

    async fn recv_audio(&self, timeout: Duration) -> Result<Bytes, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        match self.udp_session() {
            Some(udp) => udp.recv(timeout).await,
            None => Err(TransportError::AudioChannelClosed),
        }
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn get(&self, key: &str) -> Option<String> {
        let udp = self.udp_session()?;
        match key {
            KEY_AES => Some(udp.key_hex()),
            KEY_FULL_NONCE => Some(udp.full_nonce_hex()),
            _ => None,
        }
    }

    fn on_close(&self, callback: CloseCallback) {
        self.hooks.register(&self.device_id, callback);
    }

    async fn close(&self) {
        self.destroy();
    }

    /// The UDP flow cannot outlive its signaling context, so releasing the
    /// audio channel ends the whole transport. A later `hello` on the same
    /// topic builds a fresh one.
    async fn close_audio_channel(&self) {
        debug!(device_id = %self.device_id, "Audio channel released");
        self.destroy();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub published: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl SignalPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
            self.published.lock().push((topic.to_string(), payload));
            Ok(())
        }
    }

    async fn transport() -> (Arc<MqttUdpTransport>, Arc<RecordingPublisher>, Arc<UdpServer>) {
        let udp = UdpServer::bind("127.0.0.1:0".parse().unwrap(), CancellationToken::new())
            .await
            .unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let transport = MqttUdpTransport::new(
            "AA:BB:CC:DD:EE:FF",
            "/p2p/device_sub/AA_BB_CC_DD_EE_FF",
            publisher.clone(),
            Arc::clone(&udp),
        );
        (transport, publisher, udp)
    }

    #[tokio::test]
    async fn test_signaling_round_trip() {
        let (transport, publisher, _udp) = transport().await;

        transport.deliver_signal(r#"{"type":"hello"}"#.into());
        let inbound = transport.recv_signal(Duration::from_secs(1)).await.unwrap();
        assert_eq!(inbound, r#"{"type":"hello"}"#);

        transport.send_signal(r#"{"type":"hello","session_id":"s"}"#.into()).await.unwrap();
        let published = publisher.published.lock();
        assert_eq!(published[0].0, "/p2p/device_sub/AA_BB_CC_DD_EE_FF");
    }

    #[tokio::test]
    async fn test_exposes_udp_keys() {
        let (transport, _publisher, _udp) = transport().await;
        let udp = transport.udp_session().unwrap();
        assert_eq!(transport.get(KEY_AES), Some(udp.key_hex()));
        assert_eq!(transport.get(KEY_FULL_NONCE), Some(udp.full_nonce_hex()));
        assert_eq!(transport.get("unknown"), None);
        assert_eq!(transport.kind(), TransportKind::Udp);
    }

    #[tokio::test]
    async fn test_close_audio_channel_tears_down_udp_and_fires_hooks() {
        let (transport, _publisher, udp) = transport().await;
        let fired = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&fired);
        transport.on_close(Box::new(move |id| seen.lock().push(id.to_string())));

        transport.close_audio_channel().await;

        assert!(transport.is_closed());
        assert!(udp.is_empty());
        assert_eq!(*fired.lock(), vec!["AA:BB:CC:DD:EE:FF"]);
        assert_eq!(
            transport.send_audio(Bytes::from_static(b"x")).await,
            Err(TransportError::Closed)
        );
        assert_eq!(
            transport.recv_signal(Duration::from_millis(10)).await,
            Err(TransportError::Closed)
        );
    }
}
