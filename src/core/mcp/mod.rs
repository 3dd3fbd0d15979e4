//! Model Context Protocol federation.
//!
//! Tools reach a turn from three places: built-in local tools, remote MCP
//! servers managed by [`GlobalMcpManager`], and per-device clients in the
//! [`DeviceMcpPool`]. [`ToolResolver`] merges them into one namespace.

pub mod client;
pub mod device;
pub mod global;
pub mod local_tools;
pub mod protocol;
pub mod tool;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

pub use client::McpClient;
pub use device::{ClientRole, DeviceMcpPool, DeviceMcpSession};
pub use global::{GlobalMcpManager, LOCAL_TOOL_PREFIX, McpConfig, McpServerConfig};
pub use local_tools::{ExitChatTool, SessionCloser};
pub use protocol::VisionCapability;
pub use tool::{Tool, ToolContext};
pub use transport::{ChannelTransport, McpPayloadSink, McpTransport, SignalingTransport, SseTransport};

use crate::core::llm::ToolSchema;

#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    #[error("session closed")]
    SessionClosed,
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("MCP server {0} is not connected")]
    NotConnected(String),
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),
    #[error("tool returned no content")]
    EmptyResult,
    #[error("tool failed: {0}")]
    Tool(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl McpError {
    /// Peers report a dead session in several shapes; any error whose text
    /// mentions it triggers a reconnect.
    pub fn is_session_closed(&self) -> bool {
        self.to_string().contains("session closed")
    }
}

/// Merged tool namespace for one device.
#[derive(Clone)]
pub struct ToolResolver {
    global: Arc<GlobalMcpManager>,
    devices: Arc<DeviceMcpPool>,
}

impl ToolResolver {
    pub fn new(global: Arc<GlobalMcpManager>, devices: Arc<DeviceMcpPool>) -> Self {
        Self { global, devices }
    }

    /// Exact global name, then `local_<name>`, then the device's own tools.
    pub fn resolve(&self, device_id: &str, name: &str) -> Option<Arc<dyn Tool>> {
        if let Some(tool) = self.global.tool(name) {
            return Some(tool);
        }
        if let Some(tool) = self.global.tool(&format!("{LOCAL_TOOL_PREFIX}{name}")) {
            return Some(tool);
        }
        let found = self.devices.tool(device_id, name);
        if found.is_none() {
            debug!(device_id = %device_id, tool = %name, "Tool not found in any scope");
        }
        found
    }

    /// All tools visible to `device_id`, keyed by qualified name.
    pub fn tools(&self, device_id: &str) -> HashMap<String, Arc<dyn Tool>> {
        let mut all = self.global.tools();
        all.extend(self.devices.tools(device_id));
        all
    }

    /// Schemas offered to the model. Tools are advertised under their bare
    /// name; names that would resolve to another tool are dropped.
    pub fn schemas(&self, device_id: &str) -> Vec<ToolSchema> {
        let mut seen = std::collections::HashSet::new();
        let mut schemas: Vec<ToolSchema> = self
            .tools(device_id)
            .into_values()
            .filter_map(|tool| {
                let resolved = self.resolve(device_id, tool.name())?;
                if !same_tool(&resolved, &tool) {
                    return None;
                }
                seen.insert(tool.name().to_string()).then(|| tool.schema())
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

fn same_tool(a: &Arc<dyn Tool>, b: &Arc<dyn Tool>) -> bool {
    Arc::ptr_eq(a, b) || a.name() == b.name() && a.description() == b.description() && a.parameters() == b.parameters()
}
