//! Process-wide MCP federation: built-in local tools plus remote MCP servers
//! reached over SSE, supervised with a fixed-interval reconnect policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::McpError;
use super::client::McpClient;
use super::protocol::{CallToolResult, InitializeParams, McpToolInfo};
use super::tool::{RemoteTool, Tool, ToolBackend};
use super::transport::SseTransport;

pub const LOCAL_TOOL_PREFIX: &str = "local_";
const PING_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    pub name: String,
    pub sse_url: String,
    pub enabled: bool,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            sse_url: String::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub global_enabled: bool,
    pub reconnect_interval_secs: u64,
    pub max_reconnect_attempts: u32,
    pub servers: Vec<McpServerConfig>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            global_enabled: false,
            reconnect_interval_secs: 5,
            max_reconnect_attempts: 10,
            servers: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    connected: bool,
    retry_count: u32,
    last_error: Option<String>,
    last_ping: Option<Instant>,
}

/// One remote MCP server.
pub struct ServerConnection {
    config: McpServerConfig,
    http: reqwest::Client,
    client: RwLock<Option<Arc<McpClient>>>,
    tools: RwLock<HashMap<String, McpToolInfo>>,
    state: Mutex<ConnectionState>,
    // Serializes connect/reconnect so concurrent retries do not stack.
    connect_lock: tokio::sync::Mutex<()>,
}

impl ServerConnection {
    pub fn new(config: McpServerConfig, http: reqwest::Client) -> Arc<Self> {
        Arc::new(Self {
            config,
            http,
            client: RwLock::new(None),
            tools: RwLock::new(HashMap::new()),
            state: Mutex::new(ConnectionState::default()),
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn retry_count(&self) -> u32 {
        self.state.lock().retry_count
    }

    pub fn tool_infos(&self) -> Vec<McpToolInfo> {
        self.tools.read().values().cloned().collect()
    }

    pub async fn connect(&self) -> Result<(), McpError> {
        let _guard = self.connect_lock.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<(), McpError> {
        info!(server = %self.config.name, url = %self.config.sse_url, "Connecting MCP server");
        let (transport, inbound) = SseTransport::connect(self.http.clone(), &self.config.sse_url, CONNECT_TIMEOUT).await?;
        let client = McpClient::new(self.config.name.clone(), Arc::new(transport), inbound);

        let mut experimental = serde_json::Map::new();
        experimental.insert("experimental".to_string(), Value::Object(Default::default()));
        client.initialize(InitializeParams::new(experimental)).await?;

        *self.client.write() = Some(Arc::clone(&client));
        if let Err(e) = self.refresh_tools().await {
            warn!(server = %self.config.name, "Initial tools/list failed: {}", e);
        }

        let mut state = self.state.lock();
        state.connected = true;
        state.retry_count = 0;
        state.last_error = None;
        info!(server = %self.config.name, "MCP server connected");
        Ok(())
    }

    pub async fn disconnect(&self) {
        let client = self.client.write().take();
        if let Some(client) = client {
            client.close().await;
        }
        self.tools.write().clear();
        self.state.lock().connected = false;
    }

    /// Disconnect, pause, connect again.
    pub async fn reconnect(&self) -> Result<(), McpError> {
        let _guard = self.connect_lock.lock().await;
        self.disconnect().await;
        tokio::time::sleep(RECONNECT_PAUSE).await;
        self.connect_locked().await
    }

    fn current_client(&self) -> Result<Arc<McpClient>, McpError> {
        self.client.read().clone().ok_or(McpError::NotConnected(self.config.name.clone()))
    }

    pub async fn refresh_tools(&self) -> Result<usize, McpError> {
        let client = self.current_client()?;
        let listed = client.list_tools().await?;
        let count = listed.len();
        *self.tools.write() = listed.into_iter().map(|t| (t.name.clone(), t)).collect();
        debug!(server = %self.config.name, tools = count, "MCP server tools refreshed");
        Ok(count)
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        self.current_client()?.ping().await?;
        self.state.lock().last_ping = Some(Instant::now());
        Ok(())
    }

    fn mark_failed(&self, err: &McpError) {
        let mut state = self.state.lock();
        state.connected = false;
        state.last_error = Some(err.to_string());
    }
}

#[async_trait::async_trait]
impl ToolBackend for ServerConnection {
    /// One retry after a reconnect when the server reports a closed session.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let first = match self.current_client() {
            Ok(client) => client.call_tool(name, arguments.clone()).await,
            Err(e) => Err(e),
        };
        match first {
            Err(e) if e.is_session_closed() => {
                warn!(server = %self.config.name, tool = %name, "Session closed, reconnecting before retry");
                self.reconnect().await?;
                self.current_client()?.call_tool(name, arguments).await
            }
            other => other,
        }
    }
}

pub struct GlobalMcpManager {
    config: McpConfig,
    http: reqwest::Client,
    local_tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    servers: RwLock<HashMap<String, Arc<ServerConnection>>>,
    shutdown: CancellationToken,
}

impl GlobalMcpManager {
    pub fn new(config: McpConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            local_tools: RwLock::new(HashMap::new()),
            servers: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Register a built-in tool as `local_<name>`.
    pub fn register_local_tool(&self, tool: Arc<dyn Tool>) {
        let key = format!("{LOCAL_TOOL_PREFIX}{}", tool.name());
        info!(tool = %key, "Registered local tool");
        self.local_tools.write().insert(key, tool);
    }

    /// Connect enabled servers and start the supervisor. Connection failures
    /// are left to the supervisor to retry.
    pub async fn start(self: &Arc<Self>) {
        if !self.config.global_enabled {
            info!("Global MCP disabled; only local tools are available");
            return;
        }

        let mut connected = 0;
        for server in &self.config.servers {
            if !server.enabled {
                info!(server = %server.name, "MCP server disabled, skipping");
                continue;
            }
            if server.name.is_empty() || server.sse_url.is_empty() {
                warn!(server = %server.name, "MCP server missing name or sse_url, skipping");
                continue;
            }
            let conn = ServerConnection::new(server.clone(), self.http.clone());
            match conn.connect().await {
                Ok(()) => connected += 1,
                Err(e) => {
                    error!(server = %server.name, "Failed to connect MCP server: {}", e);
                    conn.mark_failed(&e);
                }
            }
            self.servers.write().insert(server.name.clone(), conn);
        }
        info!(connected, configured = self.config.servers.len(), "Global MCP manager started");

        let interval = Duration::from_secs(self.config.reconnect_interval_secs.max(1));
        tokio::spawn(supervise(Arc::downgrade(self), self.shutdown.clone(), interval));
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let servers: Vec<_> = self.servers.write().drain().map(|(_, s)| s).collect();
        for server in servers {
            server.disconnect().await;
        }
        info!("Global MCP manager stopped");
    }

    pub fn server(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.servers.read().get(name).cloned()
    }

    fn remote_tool(&self, server: &Arc<ServerConnection>, info: McpToolInfo) -> Arc<dyn Tool> {
        Arc::new(RemoteTool::new(info, server.name().to_string(), server.clone()))
    }

    /// Every global tool keyed by its qualified name
    /// (`local_<name>` or `<server>_<name>`).
    pub fn tools(&self) -> HashMap<String, Arc<dyn Tool>> {
        let mut all: HashMap<String, Arc<dyn Tool>> = self
            .local_tools
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let servers: Vec<_> = self.servers.read().values().cloned().collect();
        for server in servers {
            for info in server.tool_infos() {
                all.insert(format!("{}_{}", server.name(), info.name), self.remote_tool(&server, info));
            }
        }
        all
    }

    /// Lookup by qualified name, or by bare name under any server prefix.
    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if let Some(tool) = self.local_tools.read().get(name) {
            return Some(Arc::clone(tool));
        }
        let servers: Vec<_> = self.servers.read().values().cloned().collect();
        for server in &servers {
            if let Some(bare) = name.strip_prefix(&format!("{}_", server.name())) {
                if let Some(info) = server.tools.read().get(bare).cloned() {
                    return Some(self.remote_tool(server, info));
                }
            }
        }
        for server in &servers {
            if let Some(info) = server.tools.read().get(name).cloned() {
                return Some(self.remote_tool(server, info));
            }
        }
        None
    }

    async fn check_and_reconnect(&self) {
        let servers: Vec<_> = self.servers.read().values().cloned().collect();
        for server in servers {
            let should_retry = {
                let mut state = server.state.lock();
                if !state.connected && state.retry_count < self.config.max_reconnect_attempts {
                    state.retry_count += 1;
                    Some(state.retry_count)
                } else {
                    None
                }
            };
            let Some(attempt) = should_retry else { continue };
            info!(server = %server.name(), attempt, "Reconnecting MCP server");
            if let Err(e) = server.reconnect().await {
                error!(server = %server.name(), "MCP reconnect failed: {}", e);
                let mut state = server.state.lock();
                state.last_error = Some(e.to_string());
            }
        }
    }

    fn health_check(&self) {
        for server in self.servers.read().values().filter(|s| s.is_connected()).cloned() {
            tokio::spawn(async move {
                match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, server.refresh_tools()).await {
                    Ok(Err(e)) if e.is_session_closed() => {
                        warn!(server = %server.name(), "MCP health check failed: {}", e);
                        server.mark_failed(&e);
                    }
                    Ok(Err(e)) => debug!(server = %server.name(), "MCP health check error: {}", e),
                    Err(_) => debug!(server = %server.name(), "MCP health check timed out"),
                    Ok(Ok(_)) => {}
                }
            });
        }
    }

    fn ping_all(&self) {
        for server in self.servers.read().values().filter(|s| s.is_connected()).cloned() {
            tokio::spawn(async move {
                match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, server.ping()).await {
                    Ok(Ok(())) => debug!(server = %server.name(), "MCP ping ok"),
                    Ok(Err(e)) => {
                        warn!(server = %server.name(), "MCP ping failed: {}", e);
                        if e.is_session_closed() {
                            server.mark_failed(&e);
                        }
                    }
                    Err(_) => warn!(server = %server.name(), "MCP ping timed out"),
                }
            });
        }
    }
}

async fn supervise(manager: std::sync::Weak<GlobalMcpManager>, shutdown: CancellationToken, interval: Duration) {
    let mut reconnect = tokio::time::interval(interval);
    let mut ping = tokio::time::interval(PING_INTERVAL);
    reconnect.tick().await;
    ping.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = reconnect.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.check_and_reconnect().await;
                manager.health_check();
            }
            _ = ping.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.ping_all();
            }
        }
    }
}
