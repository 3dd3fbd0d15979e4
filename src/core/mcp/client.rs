//! MCP client over any [`McpTransport`].
//!
//! Requests are matched to responses by id through a pending map; a reader
//! task drains the inbound channel. When the inbound side ends every
//! outstanding and future request fails with `SessionClosed`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::McpError;
use super::protocol::{
    CallToolResult, IncomingMessage, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, McpToolInfo, methods,
};
use super::transport::McpTransport;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct McpClient {
    name: String,
    transport: Arc<dyn McpTransport>,
    pending: Pending,
    next_id: AtomicU64,
    closed: CancellationToken,
    request_timeout: Duration,
}

impl McpClient {
    /// Wrap a transport and start reading `inbound`.
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn McpTransport>,
        inbound: mpsc::Receiver<String>,
    ) -> Arc<Self> {
        Self::with_timeout(name, transport, inbound, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        name: impl Into<String>,
        transport: Arc<dyn McpTransport>,
        inbound: mpsc::Receiver<String>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            name: name.into(),
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
            request_timeout,
        });
        tokio::spawn(read_loop(
            client.name.clone(),
            inbound,
            Arc::clone(&client.pending),
            Arc::clone(&client.transport),
            client.closed.clone(),
        ));
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the peer goes away or `close` is called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub async fn close(&self) {
        self.closed.cancel();
        self.pending.lock().clear();
        self.transport.close().await;
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<T, McpError> {
        let result = self.request_raw(method, params).await?;
        serde_json::from_value(result).map_err(|e| McpError::Serialization(e.to_string()))
    }

    async fn request_raw(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if self.is_closed() {
            return Err(McpError::SessionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| McpError::Serialization(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.transport.send(message).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let response = tokio::select! {
            _ = self.closed.cancelled() => {
                self.pending.lock().remove(&id);
                return Err(McpError::SessionClosed);
            }
            response = tokio::time::timeout(self.request_timeout, rx) => response,
        };
        let response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(McpError::SessionClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(McpError::Timeout(method.to_string()));
            }
        };

        if let Some(error) = response.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let message = serde_json::to_string(&JsonRpcNotification::new(method, params))
            .map_err(|e| McpError::Serialization(e.to_string()))?;
        self.transport.send(message).await
    }

    /// `initialize` followed by `notifications/initialized`.
    pub async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult, McpError> {
        let params = serde_json::to_value(params).map_err(|e| McpError::Serialization(e.to_string()))?;
        let result: InitializeResult = self.request(methods::INITIALIZE, Some(params)).await?;
        self.notify(methods::INITIALIZED, None).await?;
        info!(
            client = %self.name,
            server = ?result.server_info.as_ref().map(|s| s.name.as_str()),
            "MCP session initialized"
        );
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|c| serde_json::json!({ "cursor": c }));
            let page: ListToolsResult = self.request(methods::TOOLS_LIST, params).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        self.request(methods::TOOLS_CALL, Some(params)).await
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        self.request_raw(methods::PING, None).await.map(|_| ())
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn read_loop(
    name: String,
    mut inbound: mpsc::Receiver<String>,
    pending: Pending,
    transport: Arc<dyn McpTransport>,
    closed: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            _ = closed.cancelled() => break,
            raw = inbound.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        match IncomingMessage::parse(&raw) {
            Ok(IncomingMessage::Response(response)) => {
                let Some(id) = response.id.as_u64() else {
                    debug!(client = %name, "Dropping response with non-numeric id");
                    continue;
                };
                match pending.lock().remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(client = %name, id, "Response for unknown request"),
                }
            }
            Ok(IncomingMessage::Request { id, method }) if method == methods::PING => {
                if let Ok(reply) = serde_json::to_string(&JsonRpcResponse::success(id, serde_json::json!({}))) {
                    let _ = transport.send(reply).await;
                }
            }
            Ok(IncomingMessage::Request { method, .. }) => {
                debug!(client = %name, %method, "Ignoring request from MCP peer");
            }
            Ok(IncomingMessage::Notification { method }) => {
                info!(client = %name, %method, "MCP notification");
            }
            Err(e) => warn!(client = %name, "Malformed MCP message: {}", e),
        }
    }

    closed.cancel();
    // Dropping the senders fails every waiter with SessionClosed.
    pending.lock().clear();
    debug!(client = %name, "MCP reader stopped");
}
