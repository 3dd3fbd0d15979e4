use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::state::AppState;
use crate::transport::MqttIdentity;

/// Health check handler
/// Returns a simple JSON response indicating the server is running
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "OK"
    }))
}

/// Connect credentials forwarded by an MQTT broker's HTTP auth hook.
#[derive(Debug, Deserialize)]
pub struct MqttAuthRequest {
    #[serde(alias = "client_id")]
    pub clientid: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct MqttAuthResponse {
    pub result: &'static str,
    pub is_superuser: bool,
}

/// `POST /xiaozhi/api/mqtt/auth`
///
/// Lets the broker delegate device authentication: admin credentials are
/// accepted as superuser, anything else must carry a valid device signature.
pub async fn mqtt_auth_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MqttAuthRequest>,
) -> Json<MqttAuthResponse> {
    let outcome = state
        .core_state
        .credentials
        .authenticate(&request.clientid, &request.username, &request.password);
    let response = match outcome {
        Ok(MqttIdentity::Admin) => {
            info!(client_id = %request.clientid, "MQTT admin authenticated");
            MqttAuthResponse {
                result: "allow",
                is_superuser: true,
            }
        }
        Ok(MqttIdentity::Device(info)) => {
            info!(mac = %info.mac, uuid = %info.uuid, "MQTT device authenticated");
            MqttAuthResponse {
                result: "allow",
                is_superuser: false,
            }
        }
        Err(e) => {
            warn!(client_id = %request.clientid, "MQTT authentication rejected: {}", e);
            MqttAuthResponse {
                result: "deny",
                is_superuser: false,
            }
        }
    };
    Json(response)
}
