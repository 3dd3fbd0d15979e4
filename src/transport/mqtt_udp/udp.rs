//! Encrypted UDP audio flows negotiated over MQTT.
//!
//! Each flow is identified by the conn-id embedded in its nonce until the
//! device's first valid datagram binds a remote address; after that lookups
//! go through the address map.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::codec::packet::conn_id_of;
use crate::core::codec::{NONCE_LEN, UdpCipher};
use crate::transport::{RECV_QUEUE_SIZE, TransportError, offer, recv_with_timeout};

pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MAX_DATAGRAM: usize = 4096;

pub struct UdpSession {
    conn_id: String,
    device_id: String,
    cipher: UdpCipher,
    remote: RwLock<Option<SocketAddr>>,
    recv_tx: mpsc::Sender<Bytes>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    send_tx: mpsc::Sender<Bytes>,
    last_active: Mutex<Instant>,
    closed: CancellationToken,
}

impl UdpSession {
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn key_hex(&self) -> String {
        self.cipher.key_hex()
    }

    pub fn full_nonce_hex(&self) -> String {
        self.cipher.full_nonce_hex()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.read()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Queue one Opus frame for encryption and delivery.
    pub fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::AudioChannelClosed);
        }
        self.send_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull("udp send"),
            mpsc::error::TrySendError::Closed(_) => TransportError::AudioChannelClosed,
        })
    }

    pub async fn recv(&self, timeout: Duration) -> Result<Bytes, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::AudioChannelClosed);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::AudioChannelClosed),
            result = recv_with_timeout(&self.recv_rx, timeout) => result,
        }
    }
}

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    by_conn: RwLock<HashMap<String, Arc<UdpSession>>>,
    by_addr: RwLock<HashMap<SocketAddr, Arc<UdpSession>>>,
    shutdown: CancellationToken,
}

impl UdpServer {
    pub async fn bind(addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let server = Arc::new(Self {
            socket,
            by_conn: RwLock::new(HashMap::new()),
            by_addr: RwLock::new(HashMap::new()),
            shutdown,
        });

        tokio::spawn(Arc::clone(&server).recv_loop());
        tokio::spawn(Arc::clone(&server).sweep_loop());
        info!(addr = %server.local_addr()?, "UDP audio server listening");
        Ok(server)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Allocate a fresh key, conn-id and base nonce for a device.
    pub fn create_session(&self, device_id: &str) -> Arc<UdpSession> {
        let cipher = UdpCipher::generate();
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_SIZE);
        let (send_tx, send_rx) = mpsc::channel(RECV_QUEUE_SIZE);
        let session = Arc::new(UdpSession {
            conn_id: cipher.conn_id_hex(),
            device_id: device_id.to_string(),
            cipher,
            remote: RwLock::new(None),
            recv_tx,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            send_tx,
            last_active: Mutex::new(Instant::now()),
            closed: self.shutdown.child_token(),
        });

        if let Some(previous) = self
            .by_conn
            .write()
            .insert(session.conn_id.clone(), Arc::clone(&session))
        {
            warn!(conn_id = %previous.conn_id, "Replaced UDP session with colliding conn-id");
            previous.closed.cancel();
        }
        tokio::spawn(send_loop(Arc::clone(&self.socket), Arc::clone(&session), send_rx));

        debug!(device_id = %device_id, conn_id = %session.conn_id, "UDP session created");
        session
    }

    pub fn session(&self, conn_id: &str) -> Option<Arc<UdpSession>> {
        self.by_conn.read().get(conn_id).cloned()
    }

    pub fn close_session(&self, conn_id: &str) {
        let Some(session) = self.by_conn.write().remove(conn_id) else {
            return;
        };
        if let Some(addr) = session.remote_addr() {
            let mut by_addr = self.by_addr.write();
            if by_addr.get(&addr).is_some_and(|s| Arc::ptr_eq(s, &session)) {
                by_addr.remove(&addr);
            }
        }
        session.closed.cancel();
        debug!(device_id = %session.device_id, conn_id = %conn_id, "UDP session closed");
    }

    pub fn len(&self) -> usize {
        self.by_conn.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop sessions that saw no traffic for longer than `max_idle`.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let stale: Vec<String> = self
            .by_conn
            .read()
            .values()
            .filter(|s| s.idle_for() > max_idle)
            .map(|s| s.conn_id.clone())
            .collect();
        for conn_id in &stale {
            self.close_session(conn_id);
        }
        stale.len()
    }

    fn lookup(&self, datagram: &[u8], addr: SocketAddr) -> Option<Arc<UdpSession>> {
        if let Some(session) = self.by_addr.read().get(&addr) {
            return Some(Arc::clone(session));
        }
        let conn_id = conn_id_of(datagram)?;
        self.session(&conn_id)
    }

    fn handle_datagram(&self, datagram: &[u8], addr: SocketAddr) {
        if datagram.len() < NONCE_LEN {
            debug!(%addr, len = datagram.len(), "Dropping short UDP packet");
            return;
        }
        let Some(session) = self.lookup(datagram, addr) else {
            debug!(%addr, "UDP packet for unknown session");
            return;
        };

        let payload = match session.cipher.decrypt(datagram) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(%addr, conn_id = %session.conn_id, "Rejected UDP packet: {}", e);
                return;
            }
        };

        if session.remote_addr() != Some(addr) {
            if let Some(old) = session.remote.write().replace(addr) {
                self.by_addr.write().remove(&old);
            }
            self.by_addr.write().insert(addr, Arc::clone(&session));
            info!(device_id = %session.device_id, %addr, "UDP remote address bound");
        }

        session.touch();
        offer(&session.recv_tx, Bytes::from(payload), "udp recv", &session.device_id);
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, addr)) => self.handle_datagram(&buf[..len], addr),
                Err(e) => warn!("UDP receive error: {}", e),
            }
        }
        debug!("UDP receive loop stopped");
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.sweep(SESSION_IDLE_TIMEOUT);
                    if removed > 0 {
                        info!(removed, "Swept idle UDP sessions");
                    }
                }
            }
        }
    }
}

async fn send_loop(socket: Arc<UdpSocket>, session: Arc<UdpSession>, mut frames: mpsc::Receiver<Bytes>) {
    loop {
        let frame = tokio::select! {
            _ = session.closed.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let Some(addr) = session.remote_addr() else {
            debug!(device_id = %session.device_id, "No UDP remote address yet, skipping frame");
            continue;
        };
        let datagram = match session.cipher.encrypt(&frame) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(device_id = %session.device_id, "Failed to seal UDP frame: {}", e);
                continue;
            }
        };
        if let Err(e) = socket.send_to(&datagram, addr).await {
            warn!(device_id = %session.device_id, %addr, "UDP send failed: {}", e);
        }
        session.touch();
    }
}
