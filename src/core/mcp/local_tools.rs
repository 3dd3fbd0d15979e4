//! Built-in tools served without any MCP peer.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::McpError;
use super::tool::{Tool, ToolContext};

/// Ends a device's chat session. Implemented by the session registry.
pub trait SessionCloser: Send + Sync {
    /// Returns false when no live session exists for the device.
    fn close_session(&self, device_id: &str) -> bool;
}

const DEFAULT_EXIT_REASON: &str = "用户请求退出对话";

#[derive(Debug, Default, Deserialize)]
struct ExitChatArgs {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

pub struct ExitChatTool {
    closer: Arc<dyn SessionCloser>,
}

impl ExitChatTool {
    pub const NAME: &'static str = "exit_chat";

    pub fn new(closer: Arc<dyn SessionCloser>) -> Self {
        Self { closer }
    }
}

#[async_trait::async_trait]
impl Tool for ExitChatTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "结束当前对话会话，优雅地断开与用户的连接。当用户明确表示要退出、结束对话或不再需要服务时使用此工具。"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": {"type": "string", "description": "退出原因"}
            }
        })
    }

    fn returns_to_llm(&self) -> bool {
        false
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: &str) -> Result<String, McpError> {
        let trimmed = arguments.trim();
        let args: ExitChatArgs = if trimmed.is_empty() || trimmed == "{}" {
            ExitChatArgs::default()
        } else {
            serde_json::from_str(trimmed).map_err(|e| McpError::InvalidArguments(e.to_string()))?
        };

        let device_id = args
            .device_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| ctx.device_id.clone());
        if device_id.is_empty() {
            return Err(McpError::InvalidArguments("device_id is required".to_string()));
        }

        if !self.closer.close_session(&device_id) {
            return Err(McpError::Tool(format!("no active session for device {device_id}")));
        }

        let reason = args
            .reason
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_EXIT_REASON.to_string());
        info!(device_id = %device_id, reason = %reason, "Chat exited by tool");

        Ok(json!({
            "success": true,
            "device_id": device_id,
            "reason": reason,
            "message": "对话已成功退出",
        })
        .to_string())
    }
}
