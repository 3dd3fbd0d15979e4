use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::core::asr::AsrProviderConfig;
use crate::core::device_config::DeviceConfig;
use crate::core::llm::LlmProviderConfig;
use crate::core::mcp::McpConfig;
use crate::core::pool::PoolConfig;
use crate::core::tts::TtsProviderConfig;
use crate::core::vad::VadProviderConfig;
use crate::session::ChatConfig;
use crate::transport::mqtt_udp::MqttScheme;

/// Complete YAML configuration structure
///
/// All sections are optional so a file may configure only what differs from
/// the environment or the defaults. Structured sections (chat, MCP servers,
/// providers) can only be expressed here.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 8989
///
/// auth:
///   enabled: true
///   tokens: ["device-token"]
///
/// mqtt:
///   enabled: true
///   broker: "127.0.0.1"
///   port: 1883
///   scheme: tcp
///   client_id: "xiaozhi-server"
///
/// udp:
///   listen_host: "0.0.0.0"
///   listen_port: 8990
///   external_host: "203.0.113.7"
///   external_port: 8990
///
/// mqtt_credentials:
///   signature_key: "secret"
///
/// chat:
///   max_idle_secs: 60
///   greetings: ["你好呀"]
///
/// mcp:
///   global_enabled: true
///   servers:
///     - name: "weather"
///       sse_url: "http://127.0.0.1:3001/sse"
///
/// providers:
///   system_prompt: "你是小智"
///   llm:
///     provider: openai
///     config:
///       base_url: "https://api.openai.com/v1"
///       model: "gpt-4o-mini"
///   tts:
///     provider: websocket
///     config:
///       url: "ws://127.0.0.1:8080/tts"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub auth: Option<AuthYaml>,
    pub mqtt: Option<MqttYaml>,
    pub udp: Option<UdpYaml>,
    pub mqtt_credentials: Option<MqttCredentialsYaml>,
    pub chat: Option<ChatConfig>,
    pub vad_pool: Option<PoolConfig>,
    pub mcp: Option<McpConfig>,
    pub vision: Option<VisionYaml>,
    pub providers: Option<ProvidersYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Device authentication from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthYaml {
    pub enabled: Option<bool>,
    pub tokens: Option<Vec<String>>,
}

/// MQTT broker connection from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MqttYaml {
    pub enabled: Option<bool>,
    pub broker: Option<String>,
    pub port: Option<u16>,
    pub scheme: Option<MqttScheme>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// UDP audio listener and the address advertised to devices
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct UdpYaml {
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,
    pub external_host: Option<String>,
    pub external_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MqttCredentialsYaml {
    pub signature_key: Option<String>,
    pub admin_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VisionYaml {
    pub url: Option<String>,
    pub token: Option<String>,
}

/// Provider selection. `devices` holds complete per-device overrides keyed by
/// device id.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersYaml {
    pub system_prompt: Option<String>,
    pub asr: Option<AsrProviderConfig>,
    pub llm: Option<LlmProviderConfig>,
    pub tts: Option<TtsProviderConfig>,
    pub vad: Option<VadProviderConfig>,
    pub devices: HashMap<String, DeviceConfig>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - A provider section names an unknown provider or carries unknown keys
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 8080

auth:
  enabled: true
  tokens: ["t1", "t2"]

mqtt:
  enabled: true
  broker: "mqtt.local"
  scheme: ssl

udp:
  listen_port: 9000
  external_host: "203.0.113.7"

mqtt_credentials:
  signature_key: "sig"

chat:
  max_idle_secs: 30
  exit_phrases: ["再见"]

vad_pool:
  max_size: 4

mcp:
  global_enabled: true
  servers:
    - name: weather
      sse_url: "http://127.0.0.1:3001/sse"

vision:
  url: "http://vision.local/explain"
  token: "vt"

providers:
  system_prompt: "be brief"
  llm:
    provider: openai
    config:
      model: "qwen-plus"
  devices:
    "AA:BB":
      system_prompt: "kitchen"
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.as_ref().unwrap().port, Some(8080));
        assert_eq!(
            config.auth.as_ref().unwrap().tokens,
            Some(vec!["t1".to_string(), "t2".to_string()])
        );
        assert_eq!(config.mqtt.as_ref().unwrap().scheme, Some(MqttScheme::Ssl));
        assert_eq!(config.udp.as_ref().unwrap().listen_port, Some(9000));
        assert_eq!(config.chat.as_ref().unwrap().max_idle_secs, 30);
        assert_eq!(config.chat.as_ref().unwrap().exit_phrases, vec!["再见".to_string()]);
        assert_eq!(config.vad_pool.as_ref().unwrap().max_size, 4);
        assert_eq!(config.mcp.as_ref().unwrap().servers[0].name, "weather");

        let providers = config.providers.unwrap();
        match providers.llm.unwrap() {
            LlmProviderConfig::Openai(cfg) => assert_eq!(cfg.model, "qwen-plus"),
        }
        assert_eq!(providers.devices["AA:BB"].system_prompt, "kitchen");
    }

    #[test]
    fn test_yaml_config_partial() {
        let config: YamlConfig = serde_yaml::from_str("server:\n  port: 9000\n").unwrap();

        assert_eq!(config.server.as_ref().unwrap().port, Some(9000));
        assert!(config.server.as_ref().unwrap().host.is_none());
        assert!(config.mqtt.is_none());
        assert!(config.providers.is_none());
    }

    #[test]
    fn test_unknown_provider_key_is_rejected() {
        let yaml = r#"
providers:
  llm:
    provider: openai
    config:
      modle: "typo"
"#;
        assert!(serde_yaml::from_str::<YamlConfig>(yaml).is_err());
    }

    #[test]
    fn test_yaml_from_file_missing() {
        let result = YamlConfig::from_file(&PathBuf::from("/nonexistent/config.yaml"));
        assert!(result.unwrap_err().to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_yaml_from_file_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "server: [unclosed").unwrap();

        let result = YamlConfig::from_file(&path);
        assert!(result.unwrap_err().to_string().contains("Failed to parse YAML"));
    }
}
