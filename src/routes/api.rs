use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{api, mcp};
use crate::state::AppState;
use std::sync::Arc;

pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(api::health_check))
        .route("/xiaozhi/api/mcp/tools/{device_id}", get(mcp::list_tools_handler))
        .route("/xiaozhi/api/mqtt/auth", post(api::mqtt_auth_handler))
        .layer(TraceLayer::new_for_http())
}
