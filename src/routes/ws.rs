use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::{device, mcp};
use crate::state::AppState;
use std::sync::Arc;

/// Create the WebSocket router
///
/// Device and MCP upgrades check the bearer token themselves when
/// `auth.enabled` is set, since the device id header has to be validated
/// before the upgrade anyway.
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/xiaozhi/v1/", get(device::chat_handler))
        .route("/xiaozhi/mqtt_udp/v1/", get(device::bridge_chat_handler))
        .route("/xiaozhi/mcp/{device_id}", get(mcp::mcp_endpoint_handler))
        .layer(TraceLayer::new_for_http())
}
