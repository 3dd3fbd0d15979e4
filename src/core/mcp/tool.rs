use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{info, warn};

use super::McpError;
use super::client::McpClient;
use super::protocol::{CallToolResult, McpToolInfo};
use crate::core::llm::ToolSchema;

/// Per-invocation context.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub device_id: String,
}

impl ToolContext {
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }
}

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;

    /// Whether the result is fed back to the model in a follow-up request.
    fn returns_to_llm(&self) -> bool {
        true
    }

    /// `arguments` is the raw JSON text produced by the model.
    async fn invoke(&self, ctx: &ToolContext, arguments: &str) -> Result<String, McpError>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Parse model-produced arguments. Empty text means no arguments.
pub fn parse_arguments(arguments: &str) -> Result<Value, McpError> {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(trimmed).map_err(|e| McpError::InvalidArguments(e.to_string()))
}

/// Where a remote tool's `tools/call` goes.
#[async_trait::async_trait]
pub trait ToolBackend: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError>;
}

#[async_trait::async_trait]
impl ToolBackend for McpClient {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        McpClient::call_tool(self, name, arguments).await
    }
}

/// A tool discovered through `tools/list` on some MCP peer.
pub struct RemoteTool {
    info: McpToolInfo,
    source: String,
    backend: Arc<dyn ToolBackend>,
}

impl RemoteTool {
    pub fn new(info: McpToolInfo, source: impl Into<String>, backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            info,
            source: source.into(),
            backend,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[async_trait::async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn description(&self) -> &str {
        &self.info.description
    }

    fn parameters(&self) -> Value {
        self.info.input_schema.clone()
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: &str) -> Result<String, McpError> {
        let arguments = parse_arguments(arguments)?;
        let started = Instant::now();
        let result = self.backend.call_tool(&self.info.name, arguments).await?;
        info!(
            tool = %self.info.name,
            source = %self.source,
            device_id = %ctx.device_id,
            latency_ms = started.elapsed().as_millis() as u64,
            "MCP tool returned"
        );
        if result.is_error {
            warn!(tool = %self.info.name, "MCP tool reported an error result");
        }
        result.first_text().ok_or(McpError::EmptyResult)
    }
}
