//! MQTT side of the MQTT+UDP transport: fans inbound device topics out to
//! per-device transports and creates them on first contact.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::conn::{MqttUdpTransport, SignalPublisher};
use super::udp::UdpServer;
use crate::transport::{Transport, offer};

pub const INBOUND_TOPIC_FILTER: &str = "/p2p/device_public/#";
pub const OUTBOUND_TOPIC_PREFIX: &str = "/p2p/device_sub/";
pub const INBOUND_QUEUE_SIZE: usize = 10_000;
pub const MAX_IDLE_DURATION: Duration = Duration::from_secs(60);
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttScheme {
    Tcp,
    Ssl,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    pub scheme: MqttScheme,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: String::new(),
            port: 1883,
            scheme: MqttScheme::Tcp,
            client_id: "xiaozhi-server".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MqttAdapterError {
    #[error("MQTT broker is not configured")]
    MissingBroker,
}

/// Called once for every device transport the adapter creates.
pub type NewTransportHandler = Arc<dyn Fn(Arc<dyn Transport>) + Send + Sync>;

pub struct MqttUdpAdapter {
    publisher: Arc<dyn SignalPublisher>,
    udp: Arc<UdpServer>,
    transports: RwLock<HashMap<String, Arc<MqttUdpTransport>>>,
    on_new: NewTransportHandler,
    shutdown: CancellationToken,
}

impl MqttUdpAdapter {
    pub fn new(
        publisher: Arc<dyn SignalPublisher>,
        udp: Arc<UdpServer>,
        on_new: NewTransportHandler,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            publisher,
            udp,
            transports: RwLock::new(HashMap::new()),
            on_new,
            shutdown,
        })
    }

    /// Connect to the broker and start the poll, dispatch and idle-check loops.
    pub fn start(
        config: &MqttConfig,
        udp: Arc<UdpServer>,
        on_new: NewTransportHandler,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, MqttAdapterError> {
        if config.broker.is_empty() {
            return Err(MqttAdapterError::MissingBroker);
        }

        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }
        if config.scheme == MqttScheme::Ssl {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, event_loop) = AsyncClient::new(options, 100);
        let adapter = Self::new(Arc::new(client.clone()), udp, on_new, shutdown);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        tokio::spawn(poll_loop(client, event_loop, inbound_tx, adapter.shutdown.clone()));
        tokio::spawn(Arc::clone(&adapter).dispatch_loop(inbound_rx));
        tokio::spawn(Arc::clone(&adapter).idle_loop());

        info!(broker = %config.broker, port = config.port, "MQTT adapter started");
        Ok(adapter)
    }

    pub fn transport(&self, device_id: &str) -> Option<Arc<MqttUdpTransport>> {
        self.transports.read().get(device_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.transports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route one inbound publish. Unknown devices get a fresh UDP session and
    /// transport, which is announced through the new-transport handler after
    /// the message is queued on it.
    pub fn handle_message(self: &Arc<Self>, topic: &str, payload: &[u8]) {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() != 4 || parts[3].is_empty() {
            warn!(topic = %topic, "Ignoring message on unexpected topic");
            return;
        }
        let Ok(payload) = String::from_utf8(payload.to_vec()) else {
            warn!(topic = %topic, "Ignoring non UTF-8 signaling payload");
            return;
        };

        let mac = parts[3];
        let device_id = mac.replace('_', ":");

        if let Some(existing) = self.transport(&device_id).filter(|t| !t.is_closed()) {
            existing.deliver_signal(payload);
            return;
        }

        let transport = MqttUdpTransport::new(
            device_id.clone(),
            format!("{OUTBOUND_TOPIC_PREFIX}{mac}"),
            Arc::clone(&self.publisher),
            Arc::clone(&self.udp),
        );
        let adapter: Weak<Self> = Arc::downgrade(self);
        let registered: Weak<MqttUdpTransport> = Arc::downgrade(&transport);
        transport.on_close(Box::new(move |device_id| {
            if let Some(adapter) = adapter.upgrade() {
                adapter.forget(device_id, &registered);
            }
        }));

        if let Some(previous) = self.transports.write().insert(device_id.clone(), Arc::clone(&transport)) {
            debug!(device_id = %device_id, closed = previous.is_closed(), "Replaced device transport");
        }
        transport.deliver_signal(payload);
        info!(device_id = %device_id, "New MQTT+UDP device transport");
        let transport: Arc<dyn Transport> = transport;
        (self.on_new)(transport);
    }

    fn forget(&self, device_id: &str, transport: &Weak<MqttUdpTransport>) {
        let mut transports = self.transports.write();
        let matches = transports
            .get(device_id)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), transport.as_ptr()));
        if matches {
            transports.remove(device_id);
        }
    }

    /// Close transports with no signaling or audio for longer than `max_idle`.
    pub async fn check_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<Arc<MqttUdpTransport>> = self
            .transports
            .read()
            .values()
            .filter(|t| t.idle_for() > max_idle)
            .cloned()
            .collect();
        for transport in &idle {
            info!(device_id = %transport.device_id(), "Closing idle MQTT+UDP transport");
            transport.close().await;
        }
        idle.len()
    }

    async fn dispatch_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<(String, Bytes)>) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = inbound.recv() => message,
            };
            let Some((topic, payload)) = message else { break };
            self.handle_message(&topic, &payload);
        }
    }

    async fn idle_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_idle(MAX_IDLE_DURATION).await;
                }
            }
        }
    }
}

async fn poll_loop(
    client: AsyncClient,
    mut event_loop: EventLoop,
    inbound: mpsc::Sender<(String, Bytes)>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = event_loop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                if let Err(e) = client.try_subscribe(INBOUND_TOPIC_FILTER, QoS::AtMostOnce) {
                    error!("Failed to subscribe to {}: {}", INBOUND_TOPIC_FILTER, e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                offer(&inbound, (publish.topic, publish.payload), "mqtt inbound", "broker");
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}, retrying in {:?}", e, RECONNECT_DELAY);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    if let Err(e) = client.try_disconnect() {
        debug!("MQTT disconnect: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mqtt_udp::conn::tests::RecordingPublisher;
    use parking_lot::Mutex;
    use std::time::Duration;

    async fn adapter() -> (Arc<MqttUdpAdapter>, Arc<Mutex<Vec<Arc<dyn Transport>>>>) {
        let udp = UdpServer::bind("127.0.0.1:0".parse().unwrap(), CancellationToken::new())
            .await
            .unwrap();
        let created = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&created);
        let adapter = MqttUdpAdapter::new(
            Arc::new(RecordingPublisher::default()),
            udp,
            Arc::new(move |t: Arc<dyn Transport>| sink.lock().push(t)),
            CancellationToken::new(),
        );
        (adapter, created)
    }

    #[tokio::test]
    async fn test_first_message_creates_transport() {
        let (adapter, created) = adapter().await;
        adapter.handle_message("/p2p/device_public/AA_BB_CC_DD_EE_FF", br#"{"type":"hello"}"#);
        adapter.handle_message("/p2p/device_public/AA_BB_CC_DD_EE_FF", br#"{"type":"listen"}"#);

        assert_eq!(created.lock().len(), 1);
        let transport = adapter.transport("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(
            transport.recv_signal(Duration::from_secs(1)).await.unwrap(),
            r#"{"type":"hello"}"#
        );
        assert_eq!(
            transport.recv_signal(Duration::from_secs(1)).await.unwrap(),
            r#"{"type":"listen"}"#
        );
    }

    #[tokio::test]
    async fn test_bad_topics_are_ignored() {
        let (adapter, created) = adapter().await;
        adapter.handle_message("device-server", b"{}");
        adapter.handle_message("/p2p/device_public/", b"{}");
        adapter.handle_message("/p2p/device_public/a/b", b"{}");
        assert!(created.lock().is_empty());
        assert!(adapter.is_empty());
    }

    #[tokio::test]
    async fn test_closed_transport_is_forgotten_and_recreated() {
        let (adapter, created) = adapter().await;
        adapter.handle_message("/p2p/device_public/AA_BB", b"{}");
        let first = adapter.transport("AA:BB").unwrap();

        first.close().await;
        assert!(adapter.is_empty());

        adapter.handle_message("/p2p/device_public/AA_BB", b"{}");
        assert_eq!(created.lock().len(), 2);
        assert!(!adapter.transport("AA:BB").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_idle_check_closes_stale_transports() {
        let (adapter, _created) = adapter().await;
        adapter.handle_message("/p2p/device_public/AA_BB", b"{}");

        assert_eq!(adapter.check_idle(Duration::from_secs(60)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(adapter.check_idle(Duration::from_millis(5)).await, 1);
        assert!(adapter.is_empty());
    }
}
