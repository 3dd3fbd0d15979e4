//! Device chat WebSocket upgrades.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use tracing::info;

use crate::errors::app_error::{AppError, AppResult};
use crate::state::AppState;
use crate::transport::WebSocketTransport;

pub const DEVICE_ID_HEADER: &str = "Device-Id";

/// Reject the upgrade unless `headers` carry an accepted bearer token.
/// Always passes when auth is disabled.
pub fn authorize(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    if !state.config.auth_enabled {
        return Ok(());
    }
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
        .ok_or_else(|| AppError::Unauthorized("missing Authorization header".to_string()))?;
    if state.config.is_token_allowed(token) {
        Ok(())
    } else {
        Err(AppError::Unauthorized("invalid token".to_string()))
    }
}

fn device_id(headers: &HeaderMap) -> AppResult<String> {
    headers
        .get(DEVICE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest("missing Device-Id header".to_string()))
}

/// `GET /xiaozhi/v1/`
pub async fn chat_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> AppResult<Response> {
    upgrade(ws, &headers, state, false)
}

/// `GET /xiaozhi/mqtt_udp/v1/`: same as [`chat_handler`], but binary frames
/// relayed by an MQTT-UDP bridge are unwrapped.
pub async fn bridge_chat_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> AppResult<Response> {
    upgrade(ws, &headers, state, true)
}

fn upgrade(ws: WebSocketUpgrade, headers: &HeaderMap, state: Arc<AppState>, bridge: bool) -> AppResult<Response> {
    let device_id = device_id(headers)?;
    authorize(&state, headers)?;
    info!(device_id = %device_id, bridge, "Device chat upgrade requested");
    Ok(ws.on_upgrade(move |socket| handle_device_socket(socket, device_id, state, bridge)))
}

async fn handle_device_socket(socket: WebSocket, device_id: String, state: Arc<AppState>, bridge: bool) {
    let transport = WebSocketTransport::spawn(socket, device_id, bridge);
    state.core_state.sessions.accept(transport).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::core::CoreState;

    async fn state(auth: bool) -> AppState {
        let config = ServerConfig {
            auth_enabled: auth,
            auth_tokens: vec!["secret".to_string()],
            ..ServerConfig::default()
        };
        AppState {
            core_state: CoreState::new(&config).await,
            config,
        }
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_device_id_required() {
        assert!(matches!(device_id(&HeaderMap::new()), Err(AppError::BadRequest(_))));
        assert!(matches!(device_id(&headers(&[("device-id", "  ")])), Err(AppError::BadRequest(_))));
        assert_eq!(device_id(&headers(&[("device-id", "AA:BB")])).unwrap(), "AA:BB");
    }

    #[tokio::test]
    async fn test_authorize() {
        let open = state(false).await;
        assert!(authorize(&open, &HeaderMap::new()).is_ok());

        let closed = state(true).await;
        assert!(matches!(authorize(&closed, &HeaderMap::new()), Err(AppError::Unauthorized(_))));
        assert!(authorize(&closed, &headers(&[("authorization", "Bearer wrong")])).is_err());
        assert!(authorize(&closed, &headers(&[("authorization", "Bearer secret")])).is_ok());
        assert!(authorize(&closed, &headers(&[("authorization", "secret")])).is_ok());
    }
}
