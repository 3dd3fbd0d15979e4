//! MQTT client credentials for devices.
//!
//! A device connects with client id `<group>@@@<MAC_with_underscores>@@@<uuid>`,
//! a username that is base64 JSON (`{"ip": ...}`), and a password that is the
//! base64 HMAC-SHA256 of `<client_id>|<username>`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_GROUP_ID: &str = "GID_test";
pub const ADMIN_USERNAME: &str = "admin";
const CLIENT_ID_SEPARATOR: &str = "@@@";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("signature key is not configured")]
    MissingKey,
    #[error("client id must look like <group>@@@<mac>@@@<uuid>")]
    MalformedClientId,
    #[error("username is not base64 encoded JSON")]
    MalformedUsername,
    #[error("password signature mismatch")]
    BadSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MqttCredentials {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MqttCredentialInfo {
    pub group_id: String,
    pub mac: String,
    pub uuid: String,
    pub user_data: Map<String, Value>,
}

/// Who a successful authentication resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum MqttIdentity {
    Admin,
    Device(MqttCredentialInfo),
}

fn sign(data: &str, key: &str) -> Result<HmacSha256, CredentialError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| CredentialError::MissingKey)?;
    mac.update(data.as_bytes());
    Ok(mac)
}

/// Mint credentials for a device. Without a signature key the password falls
/// back to the hex SHA-256 of the client id.
pub fn generate_credentials(device_id: &str, client_id: &str, ip: &str, signature_key: &str) -> MqttCredentials {
    let device_id = device_id.replace(':', "_");
    let username = STANDARD.encode(serde_json::json!({ "ip": ip }).to_string());
    let mqtt_client_id = format!("{DEFAULT_GROUP_ID}{CLIENT_ID_SEPARATOR}{device_id}{CLIENT_ID_SEPARATOR}{client_id}");

    let password = match sign(&format!("{mqtt_client_id}|{username}"), signature_key) {
        Ok(mac) if !signature_key.is_empty() => STANDARD.encode(mac.finalize().into_bytes()),
        _ => hex::encode(Sha256::digest(mqtt_client_id.as_bytes())),
    };

    MqttCredentials {
        client_id: mqtt_client_id,
        username,
        password,
    }
}

pub fn validate_credentials(
    client_id: &str,
    username: &str,
    password: &str,
    signature_key: &str,
) -> Result<MqttCredentialInfo, CredentialError> {
    if signature_key.is_empty() {
        return Err(CredentialError::MissingKey);
    }

    let parts: Vec<&str> = client_id.split(CLIENT_ID_SEPARATOR).collect();
    let [group_id, mac, uuid] = parts.as_slice() else {
        return Err(CredentialError::MalformedClientId);
    };

    let decoded = STANDARD.decode(username).map_err(|_| CredentialError::MalformedUsername)?;
    let user_data: Map<String, Value> =
        serde_json::from_slice(&decoded).map_err(|_| CredentialError::MalformedUsername)?;

    let signature = STANDARD.decode(password).map_err(|_| CredentialError::BadSignature)?;
    sign(&format!("{client_id}|{username}"), signature_key)?
        .verify_slice(&signature)
        .map_err(|_| CredentialError::BadSignature)?;

    Ok(MqttCredentialInfo {
        group_id: group_id.to_string(),
        mac: mac.replace('_', ":"),
        uuid: uuid.to_string(),
        user_data,
    })
}

/// Broker-side check combining the admin bypass with device signatures.
#[derive(Debug, Clone, Default)]
pub struct CredentialPolicy {
    pub signature_key: String,
    pub admin_password: Option<String>,
}

impl CredentialPolicy {
    pub fn authenticate(&self, client_id: &str, username: &str, password: &str) -> Result<MqttIdentity, CredentialError> {
        if username == ADMIN_USERNAME {
            return match &self.admin_password {
                Some(expected) if !expected.is_empty() && constant_time_eq(expected.as_bytes(), password.as_bytes()) => {
                    Ok(MqttIdentity::Admin)
                }
                _ => Err(CredentialError::BadSignature),
            };
        }
        validate_credentials(client_id, username, password, &self.signature_key).map(MqttIdentity::Device)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
