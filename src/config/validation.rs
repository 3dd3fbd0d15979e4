use std::collections::HashSet;

use super::ServerConfig;
use crate::core::mcp::McpConfig;
use crate::core::pool::PoolConfig;
use crate::transport::mqtt_udp::MqttConfig;

/// Run every check against a merged configuration.
pub fn validate(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    validate_ports(config)?;
    validate_auth(config.auth_enabled, &config.auth_tokens)?;
    validate_mqtt(&config.mqtt)?;
    validate_pool("vad_pool", &config.vad_pool)?;
    validate_mcp(&config.mcp)?;
    Ok(())
}

fn validate_ports(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.port == 0 {
        return Err("server.port must not be 0".into());
    }
    if config.mqtt.enabled && config.udp_listen_port == 0 {
        return Err("udp.listen_port must not be 0 when MQTT is enabled".into());
    }
    Ok(())
}

/// Validate that enabled auth has at least one token to accept.
pub fn validate_auth(enabled: bool, tokens: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if enabled && tokens.iter().all(|t| t.is_empty()) {
        return Err("auth.tokens must contain at least one token when auth.enabled is true".into());
    }
    Ok(())
}

pub fn validate_mqtt(mqtt: &MqttConfig) -> Result<(), Box<dyn std::error::Error>> {
    if !mqtt.enabled {
        return Ok(());
    }
    if mqtt.broker.trim().is_empty() {
        return Err("mqtt.broker is required when mqtt.enabled is true".into());
    }
    if mqtt.port == 0 {
        return Err("mqtt.port must not be 0".into());
    }
    if mqtt.client_id.is_empty() {
        return Err("mqtt.client_id must not be empty".into());
    }
    Ok(())
}

/// Validate pool sizing so the pool can actually hand out resources.
pub fn validate_pool(section: &str, pool: &PoolConfig) -> Result<(), Box<dyn std::error::Error>> {
    if pool.max_size == 0 {
        return Err(format!("{section}.max_size must be at least 1").into());
    }
    if pool.min_size > pool.max_size {
        return Err(format!(
            "{section}.min_size ({}) exceeds max_size ({})",
            pool.min_size, pool.max_size
        )
        .into());
    }
    if pool.max_idle > pool.max_size {
        return Err(format!(
            "{section}.max_idle ({}) exceeds max_size ({})",
            pool.max_idle, pool.max_size
        )
        .into());
    }
    Ok(())
}

/// Validate MCP server entries: names must be non-empty and unique and each
/// enabled server needs an SSE URL.
pub fn validate_mcp(mcp: &McpConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut seen = HashSet::new();
    for server in &mcp.servers {
        if server.name.trim().is_empty() {
            return Err("mcp.servers entries must have a name".into());
        }
        if !seen.insert(server.name.as_str()) {
            return Err(format!("Duplicate MCP server name: {}", server.name).into());
        }
        if server.enabled && !server.sse_url.starts_with("http") {
            return Err(format!(
                "MCP server '{}' sse_url must be an http(s) URL",
                server.name
            )
            .into());
        }
    }
    Ok(())
}
