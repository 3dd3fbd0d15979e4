//! Router assembly. Every router is typed over `Arc<AppState>`; the caller
//! applies the state with `with_state`.

pub mod api;
pub mod ws;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Full application router: HTTP API plus WebSocket upgrades.
pub fn create_router(state: Arc<AppState>) -> Router {
    api::create_api_router()
        .merge(ws::create_ws_router())
        .with_state(state)
}
