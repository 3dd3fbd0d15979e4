//! Device MCP endpoints: the WS-endpoint MCP server connection and the merged
//! tool listing.

use std::sync::Arc;

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::device::authorize;
use crate::core::mcp::{ChannelTransport, ClientRole, McpClient};
use crate::errors::app_error::{AppError, AppResult};
use crate::state::AppState;

const MCP_CHANNEL_CAPACITY: usize = 64;

/// `GET /xiaozhi/mcp/{device_id}`
pub async fn mcp_endpoint_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Path(device_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Response> {
    let device_id = device_id.trim().to_string();
    if device_id.is_empty() {
        return Err(AppError::BadRequest("device id must not be empty".to_string()));
    }
    authorize(&state, &headers)?;
    info!(device_id = %device_id, "MCP endpoint upgrade requested");
    Ok(ws.on_upgrade(move |socket| handle_mcp_socket(socket, device_id, state)))
}

/// Bridge one MCP server socket into a JSON-RPC client installed in the
/// device's WS-endpoint slot. The slot is released when the socket ends.
async fn handle_mcp_socket(socket: WebSocket, device_id: String, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (transport, mut outbound) = ChannelTransport::new(MCP_CHANNEL_CAPACITY);
    let closed = transport.closed();
    let (inbound_tx, inbound_rx) = mpsc::channel(MCP_CHANNEL_CAPACITY);

    let role = ClientRole::WsEndpoint;
    let client = McpClient::new(role.server_name(&device_id), Arc::new(transport), inbound_rx);

    let writer = tokio::spawn({
        let closed = closed.clone();
        async move {
            loop {
                let message = tokio::select! {
                    _ = closed.cancelled() => break,
                    message = outbound.recv() => message,
                };
                let Some(message) = message else { break };
                if sink.send(Message::Text(message.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        }
    });

    let reader = tokio::spawn({
        let device_id = device_id.clone();
        async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(device_id = %device_id, "MCP endpoint read error: {}", e);
                        break;
                    }
                }
            }
        }
    });

    let session = state.core_state.device_mcp.get_or_create(&device_id);
    if let Err(e) = session.attach(role, Arc::clone(&client), Default::default()).await {
        warn!(device_id = %device_id, "MCP endpoint handshake failed: {}", e);
        client.close().await;
        reader.abort();
        let _ = writer.await;
        return;
    }

    let _ = reader.await;
    info!(device_id = %device_id, "MCP endpoint disconnected");
    if let Some(session) = state.core_state.device_mcp.get(&device_id) {
        session.detach(role).await;
    }
    client.close().await;
    let _ = writer.await;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// `GET /xiaozhi/api/mcp/tools/{device_id}`: every tool the device's LLM can
/// call, global and device-scoped, sorted by name.
pub async fn list_tools_handler(
    Path(device_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<ToolDescription>>> {
    let device_id = device_id.trim();
    if device_id.is_empty() {
        return Err(AppError::BadRequest("device id must not be empty".to_string()));
    }
    let mut tools: Vec<ToolDescription> = state
        .core_state
        .tools
        .tools(device_id)
        .into_iter()
        .map(|(name, tool)| ToolDescription {
            name,
            description: tool.description().to_string(),
            input_schema: tool.parameters(),
        })
        .collect();
    tools.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(tools))
}
