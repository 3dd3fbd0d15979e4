//! Configuration module for the xiaozhi server
//!
//! This module handles server configuration from YAML files and environment
//! variables. When both are present, YAML values win and the environment fills
//! whatever the file leaves out.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading and typed env helpers
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use xiaozhi_server::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file, falling back to environment variables
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use crate::core::device_config::{DeviceConfig, StaticDeviceConfigProvider};
use crate::core::mcp::{McpConfig, VisionCapability};
use crate::core::pool::PoolConfig;
use crate::session::{ChatConfig, SessionSettings};
use crate::transport::CredentialPolicy;
use crate::transport::mqtt_udp::MqttConfig;

mod env;
mod merge;
mod validation;
mod yaml;

pub const DEFAULT_PORT: u16 = 8989;
pub const DEFAULT_UDP_PORT: u16 = 8990;

/// Server configuration
///
/// Contains everything needed to run the server:
/// - HTTP listener and device authentication
/// - MQTT broker connection and the UDP audio listener
/// - Conversation behaviour and VAD pool sizing
/// - MCP servers and the vision capability offered to devices
/// - Default and per-device provider selection
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // Device authentication
    pub auth_enabled: bool,
    pub auth_tokens: Vec<String>,

    // MQTT signaling and UDP audio
    pub mqtt: MqttConfig,
    pub udp_listen_host: String,
    pub udp_listen_port: u16,
    pub udp_external_host: String,
    pub udp_external_port: u16,

    // MQTT credential checks
    pub mqtt_signature_key: String,
    pub mqtt_admin_password: Option<String>,

    pub chat: ChatConfig,
    pub vad_pool: PoolConfig,
    pub mcp: McpConfig,
    pub vision: Option<VisionCapability>,

    // Providers
    pub device: DeviceConfig,
    pub device_overrides: HashMap<String, DeviceConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            auth_enabled: false,
            auth_tokens: Vec::new(),
            mqtt: MqttConfig::default(),
            udp_listen_host: "0.0.0.0".to_string(),
            udp_listen_port: DEFAULT_UDP_PORT,
            udp_external_host: "127.0.0.1".to_string(),
            udp_external_port: DEFAULT_UDP_PORT,
            mqtt_signature_key: String::new(),
            mqtt_admin_password: None,
            chat: ChatConfig::default(),
            vad_pool: PoolConfig::default(),
            mcp: McpConfig::default(),
            vision: None,
            device: DeviceConfig::default(),
            device_overrides: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file, falling back to environment
    /// variables for anything the file does not set.
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables
    /// 3. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        // A .env file is not consulted here: the YAML file is the source of
        // truth and only real environment variables fill its gaps.
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Get the HTTP listen address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the UDP audio listen address as "host:port"
    pub fn udp_address(&self) -> String {
        format!("{}:{}", self.udp_listen_host, self.udp_listen_port)
    }

    /// Whether `token` may open a device connection.
    pub fn is_token_allowed(&self, token: &str) -> bool {
        !self.auth_enabled || self.auth_tokens.iter().any(|t| t == token)
    }

    pub fn credential_policy(&self) -> CredentialPolicy {
        CredentialPolicy {
            signature_key: self.mqtt_signature_key.clone(),
            admin_password: self.mqtt_admin_password.clone(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            chat: self.chat.clone(),
            udp_external_host: self.udp_external_host.clone(),
            udp_external_port: self.udp_external_port,
            vision: self.vision.clone(),
        }
    }

    pub fn device_config_provider(&self) -> StaticDeviceConfigProvider {
        self.device_overrides.iter().fold(
            StaticDeviceConfigProvider::new(self.device.clone()),
            |provider, (device_id, config)| provider.with_override(device_id.clone(), config.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device_config::DeviceConfigProvider;
    use crate::core::llm::LlmProviderConfig;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    // Helper to clean up environment variables
    fn cleanup_env_vars() {
        unsafe {
            for name in [
                "HOST",
                "PORT",
                "AUTH_ENABLED",
                "AUTH_TOKENS",
                "MQTT_ENABLED",
                "MQTT_BROKER",
                "UDP_EXTERNAL_HOST",
                "LLM_MODEL",
                "LLM_API_KEY",
            ] {
                env::remove_var(name);
            }
        }
    }

    #[test]
    fn test_token_check() {
        let mut config = ServerConfig::default();
        assert!(config.is_token_allowed("anything"));

        config.auth_enabled = true;
        config.auth_tokens = vec!["good".to_string()];
        assert!(config.is_token_allowed("good"));
        assert!(!config.is_token_allowed("bad"));
        assert!(!config.is_token_allowed(""));
    }

    #[test]
    fn test_addresses() {
        let config = ServerConfig::default();
        assert_eq!(config.address(), "0.0.0.0:8989");
        assert_eq!(config.udp_address(), "0.0.0.0:8990");
    }

    #[test]
    fn test_session_settings_carry_udp_advertisement() {
        let config = ServerConfig {
            udp_external_host: "203.0.113.7".to_string(),
            udp_external_port: 9999,
            ..ServerConfig::default()
        };
        let settings = config.session_settings();
        assert_eq!(settings.udp_external_host, "203.0.113.7");
        assert_eq!(settings.udp_external_port, 9999);
    }

    #[tokio::test]
    async fn test_device_overrides_reach_provider() {
        let mut config = ServerConfig::default();
        config.device_overrides.insert(
            "AA:BB".to_string(),
            DeviceConfig {
                system_prompt: "kitchen".to_string(),
                ..DeviceConfig::default()
            },
        );
        let provider = config.device_config_provider();
        assert_eq!(provider.device_config("AA:BB").await.system_prompt, "kitchen");
        assert_eq!(
            provider.device_config("CC:DD").await.system_prompt,
            config.device.system_prompt
        );
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_only() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        let yaml_content = r#"
server:
  host: "127.0.0.1"
  port: 8080

udp:
  external_host: "198.51.100.2"

providers:
  llm:
    provider: openai
    config:
      model: "qwen-plus"
"#;
        fs::write(&config_path, yaml_content).unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.udp_external_host, "198.51.100.2");
        match &config.device.llm {
            LlmProviderConfig::Openai(cfg) => assert_eq!(cfg.model, "qwen-plus"),
        }

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_wins_over_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "server:\n  host: \"127.0.0.1\"\n").unwrap();

        unsafe {
            env::set_var("HOST", "10.0.0.1");
            env::set_var("PORT", "9100");
        }

        let config = ServerConfig::from_file(&config_path).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        // ENV fills what YAML leaves out
        assert_eq!(config.port, 9100);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_rejects_mqtt_without_broker() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "mqtt:\n  enabled: true\n").unwrap();

        let result = ServerConfig::from_file(&config_path);
        assert!(result.unwrap_err().to_string().contains("broker"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_partial_config() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "chat:\n  max_idle_secs: 15\n").unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();

        assert_eq!(config.chat.max_idle_secs, 15);
        assert_eq!(config.chat.memory_turns, ChatConfig::default().memory_turns);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(!config.auth_enabled);
        assert!(!config.mqtt.enabled);

        cleanup_env_vars();
    }
}
