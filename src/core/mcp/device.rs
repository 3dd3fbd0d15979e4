//! Device scoped MCP sessions.
//!
//! A device can expose tools through two clients at once: the IoT-over-MCP
//! client tunnelled through its signaling channel, and the WS-endpoint client
//! on `/xiaozhi/mcp/{device}`. Each session refreshes tools and pings its
//! clients in the background; the pool sweeper drops sessions whose clients
//! have all gone quiet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::McpError;
use super::client::McpClient;
use super::protocol::InitializeParams;
use super::tool::{RemoteTool, Tool};

pub const TOOL_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(120);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientRole {
    IotOverMcp,
    WsEndpoint,
}

impl ClientRole {
    pub fn server_name(&self, device_id: &str) -> String {
        match self {
            ClientRole::IotOverMcp => format!("iot_over_mcp_{device_id}"),
            ClientRole::WsEndpoint => format!("ws_endpoint_mcp_{device_id}"),
        }
    }
}

type ToolMap = HashMap<String, Arc<dyn Tool>>;

struct ClientSlot {
    client: Arc<McpClient>,
    tools: ToolMap,
    last_ping: Instant,
    connected: bool,
}

pub struct DeviceMcpSession {
    device_id: String,
    cancel: CancellationToken,
    slots: RwLock<HashMap<ClientRole, ClientSlot>>,
}

impl DeviceMcpSession {
    /// Create the session and start its refresh/ping loop.
    pub fn new(device_id: impl Into<String>) -> Arc<Self> {
        let session = Arc::new(Self {
            device_id: device_id.into(),
            cancel: CancellationToken::new(),
            slots: RwLock::new(HashMap::new()),
        });
        tokio::spawn(maintain(Arc::downgrade(&session), session.cancel.clone()));
        session
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handshake `client` and install it in `role`, replacing any previous
    /// client in that role.
    pub async fn attach(
        &self,
        role: ClientRole,
        client: Arc<McpClient>,
        capabilities: serde_json::Map<String, Value>,
    ) -> Result<(), McpError> {
        client.initialize(InitializeParams::new(capabilities)).await?;
        let tools = fetch_tools(&client).await?;
        info!(
            device_id = %self.device_id,
            role = ?role,
            tools = tools.len(),
            "Device MCP client attached"
        );

        let previous = self.slots.write().insert(
            role,
            ClientSlot {
                client,
                tools,
                last_ping: Instant::now(),
                connected: true,
            },
        );
        if let Some(previous) = previous {
            previous.client.close().await;
        }
        Ok(())
    }

    pub async fn detach(&self, role: ClientRole) {
        let slot = self.slots.write().remove(&role);
        if let Some(slot) = slot {
            slot.client.close().await;
        }
    }

    /// Merged tool map. IoT tools win on name collision.
    pub fn tools(&self) -> ToolMap {
        let slots = self.slots.read();
        let mut merged = ToolMap::new();
        for role in [ClientRole::WsEndpoint, ClientRole::IotOverMcp] {
            if let Some(slot) = slots.get(&role) {
                merged.extend(slot.tools.iter().map(|(k, v)| (k.clone(), Arc::clone(v))));
            }
        }
        merged
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let slots = self.slots.read();
        [ClientRole::IotOverMcp, ClientRole::WsEndpoint]
            .iter()
            .find_map(|role| slots.get(role).and_then(|slot| slot.tools.get(name).cloned()))
    }

    pub fn has_client(&self, role: ClientRole) -> bool {
        self.slots.read().contains_key(&role)
    }

    async fn refresh_tools(&self) {
        for (role, client) in self.live_clients() {
            match fetch_tools(&client).await {
                Ok(tools) => {
                    if let Some(slot) = self.slots.write().get_mut(&role) {
                        if Arc::ptr_eq(&slot.client, &client) {
                            slot.tools = tools;
                        }
                    }
                }
                Err(e) => warn!(device_id = %self.device_id, role = ?role, "MCP tool refresh failed: {}", e),
            }
        }
    }

    async fn ping_clients(&self) {
        for (role, client) in self.live_clients() {
            match client.ping().await {
                Ok(()) => {
                    if let Some(slot) = self.slots.write().get_mut(&role) {
                        slot.last_ping = Instant::now();
                    }
                }
                Err(e) => debug!(device_id = %self.device_id, role = ?role, "MCP ping failed: {}", e),
            }
        }
    }

    fn live_clients(&self) -> Vec<(ClientRole, Arc<McpClient>)> {
        self.slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.connected)
            .map(|(role, slot)| (*role, Arc::clone(&slot.client)))
            .collect()
    }

    /// Mark clients without a recent ping (or whose peer left) as
    /// disconnected. Returns true when no connected client remains.
    fn check_liveness(&self, liveness: Duration) -> bool {
        let mut stale = Vec::new();
        let all_down = {
            let mut slots = self.slots.write();
            for (role, slot) in slots.iter_mut() {
                if slot.connected && (slot.client.is_closed() || slot.last_ping.elapsed() > liveness) {
                    slot.connected = false;
                    stale.push((*role, Arc::clone(&slot.client)));
                }
            }
            slots.values().all(|slot| !slot.connected)
        };
        for (role, client) in stale {
            info!(device_id = %self.device_id, role = ?role, "Device MCP client went stale");
            tokio::spawn(async move { client.close().await });
        }
        all_down
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let slots: Vec<_> = self.slots.write().drain().map(|(_, slot)| slot.client).collect();
        for client in slots {
            client.close().await;
        }
    }
}

async fn fetch_tools(client: &Arc<McpClient>) -> Result<ToolMap, McpError> {
    let tools = client.list_tools().await?;
    Ok(tools
        .into_iter()
        .map(|info| {
            let name = info.name.clone();
            let tool: Arc<dyn Tool> = Arc::new(RemoteTool::new(info, client.name().to_string(), client.clone()));
            (name, tool)
        })
        .collect())
}

async fn maintain(session: std::sync::Weak<DeviceMcpSession>, cancel: CancellationToken) {
    let mut refresh = tokio::time::interval(TOOL_REFRESH_INTERVAL);
    let mut ping = tokio::time::interval(PING_INTERVAL);
    refresh.tick().await;
    ping.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = refresh.tick() => {
                let Some(session) = session.upgrade() else { break };
                session.refresh_tools().await;
            }
            _ = ping.tick() => {
                let Some(session) = session.upgrade() else { break };
                session.ping_clients().await;
            }
        }
    }
}

/// All device MCP sessions, keyed by device id.
#[derive(Default)]
pub struct DeviceMcpPool {
    sessions: RwLock<HashMap<String, Arc<DeviceMcpSession>>>,
    // Serializes get-or-create so two attach paths never race a second session in.
    create_lock: Mutex<()>,
}

impl DeviceMcpPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceMcpSession>> {
        self.sessions.read().get(device_id).cloned()
    }

    pub fn get_or_create(&self, device_id: &str) -> Arc<DeviceMcpSession> {
        let _guard = self.create_lock.lock();
        if let Some(existing) = self.get(device_id) {
            if !existing.is_cancelled() {
                return existing;
            }
        }
        let session = DeviceMcpSession::new(device_id);
        self.sessions.write().insert(device_id.to_string(), Arc::clone(&session));
        session
    }

    pub async fn remove(&self, device_id: &str) {
        let removed = self.sessions.write().remove(device_id);
        if let Some(session) = removed {
            session.close().await;
            info!(device_id = %device_id, "Device MCP session removed");
        }
    }

    pub fn tool(&self, device_id: &str, name: &str) -> Option<Arc<dyn Tool>> {
        self.get(device_id)?.tool(name)
    }

    pub fn tools(&self, device_id: &str) -> ToolMap {
        self.get(device_id).map(|s| s.tools()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove sessions with no connected client left.
    pub async fn sweep(&self, liveness: Duration) {
        let dead: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, session)| session.check_liveness(liveness))
            .map(|(id, _)| id.clone())
            .collect();
        for device_id in dead {
            info!(device_id = %device_id, "All device MCP clients disconnected");
            self.remove(&device_id).await;
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.sweep(LIVENESS_TIMEOUT).await;
                    }
                }
            }
        });
    }
}
