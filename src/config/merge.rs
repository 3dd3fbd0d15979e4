use std::env;

use super::env::{env_flag, env_list, env_parse};
use super::yaml::YamlConfig;
use super::{DEFAULT_PORT, DEFAULT_UDP_PORT, ServerConfig};
use crate::core::device_config::DeviceConfig;
use crate::core::llm::{LlmProviderConfig, OpenAiConfig};
use crate::core::mcp::VisionCapability;
use crate::transport::mqtt_udp::{MqttConfig, MqttScheme};

/// Merge YAML configuration with environment variables
///
/// Priority order (highest to lowest):
/// 1. YAML configuration values
/// 2. Environment variables
/// 3. Default values
///
/// Lists and provider sections only come from YAML; the environment can still
/// point the default OpenAI-compatible LLM at a different endpoint.
pub fn merge_config(yaml_config: Option<YamlConfig>) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let yaml = yaml_config.unwrap_or_default();

    // Helper macro to get value with priority: YAML > ENV > Default
    macro_rules! get_value {
        ($env_var:expr, $yaml_value:expr, $default:expr) => {
            $yaml_value
                .or_else(|| env::var($env_var).ok())
                .unwrap_or_else(|| $default.to_string())
        };
    }

    // Helper macro for optional values: YAML > ENV
    macro_rules! get_optional {
        ($env_var:expr, $yaml_value:expr) => {
            $yaml_value.or_else(|| env::var($env_var).ok())
        };
    }

    // Helper macro for parsed values: YAML > ENV (parsed) > Default
    macro_rules! get_parsed {
        ($env_var:expr, $yaml_value:expr, $default:expr) => {
            match $yaml_value {
                Some(value) => value,
                None => env_parse($env_var)?.unwrap_or($default),
            }
        };
    }

    // Server configuration
    let server = yaml.server.unwrap_or_default();
    let host = get_value!("HOST", server.host, "0.0.0.0");
    let port = get_parsed!("PORT", server.port, DEFAULT_PORT);

    // Device authentication
    let auth = yaml.auth.unwrap_or_default();
    let auth_enabled = match auth.enabled {
        Some(enabled) => enabled,
        None => env_flag("AUTH_ENABLED")?.unwrap_or(false),
    };
    let auth_tokens = auth.tokens.or_else(|| env_list("AUTH_TOKENS")).unwrap_or_default();

    // MQTT broker
    let mqtt_yaml = yaml.mqtt.unwrap_or_default();
    let mqtt_default = MqttConfig::default();
    let mqtt = MqttConfig {
        enabled: match mqtt_yaml.enabled {
            Some(enabled) => enabled,
            None => env_flag("MQTT_ENABLED")?.unwrap_or(mqtt_default.enabled),
        },
        broker: get_value!("MQTT_BROKER", mqtt_yaml.broker, mqtt_default.broker),
        port: get_parsed!("MQTT_PORT", mqtt_yaml.port, mqtt_default.port),
        scheme: match mqtt_yaml.scheme {
            Some(scheme) => scheme,
            None => match env::var("MQTT_SCHEME").ok().as_deref() {
                Some("ssl") => MqttScheme::Ssl,
                Some("tcp") | None => MqttScheme::Tcp,
                Some(other) => return Err(format!("Invalid MQTT_SCHEME: {other}").into()),
            },
        },
        client_id: get_value!("MQTT_CLIENT_ID", mqtt_yaml.client_id, mqtt_default.client_id),
        username: get_optional!("MQTT_USERNAME", mqtt_yaml.username),
        password: get_optional!("MQTT_PASSWORD", mqtt_yaml.password),
    };

    // UDP audio
    let udp = yaml.udp.unwrap_or_default();
    let udp_listen_host = get_value!("UDP_LISTEN_HOST", udp.listen_host, "0.0.0.0");
    let udp_listen_port = get_parsed!("UDP_LISTEN_PORT", udp.listen_port, DEFAULT_UDP_PORT);
    let udp_external_host = get_value!("UDP_EXTERNAL_HOST", udp.external_host, "127.0.0.1");
    let udp_external_port = get_parsed!("UDP_EXTERNAL_PORT", udp.external_port, udp_listen_port);

    // MQTT credentials
    let credentials = yaml.mqtt_credentials.unwrap_or_default();
    let mqtt_signature_key = get_value!("MQTT_SIGNATURE_KEY", credentials.signature_key, "");
    let mqtt_admin_password = get_optional!("MQTT_ADMIN_PASSWORD", credentials.admin_password);

    // Vision is only advertised when both parts are known
    let vision_yaml = yaml.vision.unwrap_or_default();
    let vision = match (
        get_optional!("VISION_URL", vision_yaml.url),
        get_optional!("VISION_TOKEN", vision_yaml.token),
    ) {
        (Some(url), Some(token)) if !url.is_empty() => Some(VisionCapability { url, token }),
        _ => None,
    };

    // Providers
    let providers = yaml.providers.unwrap_or_default();
    let default_device = DeviceConfig::default();
    let llm = match providers.llm {
        Some(llm) => llm,
        None => {
            let defaults = OpenAiConfig::default();
            LlmProviderConfig::Openai(OpenAiConfig {
                base_url: get_value!("LLM_BASE_URL", None::<String>, defaults.base_url),
                api_key: get_value!("LLM_API_KEY", None::<String>, defaults.api_key),
                model: get_value!("LLM_MODEL", None::<String>, defaults.model),
                ..defaults
            })
        }
    };
    let device = DeviceConfig {
        system_prompt: get_value!(
            "SYSTEM_PROMPT",
            providers.system_prompt,
            default_device.system_prompt
        ),
        asr: providers.asr.unwrap_or(default_device.asr),
        llm,
        tts: providers.tts.unwrap_or(default_device.tts),
        vad: providers.vad.unwrap_or(default_device.vad),
    };

    Ok(ServerConfig {
        host,
        port,
        auth_enabled,
        auth_tokens,
        mqtt,
        udp_listen_host,
        udp_listen_port,
        udp_external_host,
        udp_external_port,
        mqtt_signature_key,
        mqtt_admin_password,
        chat: yaml.chat.unwrap_or_default(),
        vad_pool: yaml.vad_pool.unwrap_or_default(),
        mcp: yaml.mcp.unwrap_or_default(),
        vision,
        device,
        device_overrides: providers.devices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleanup_env_vars() {
        unsafe {
            for name in [
                "PORT",
                "AUTH_TOKENS",
                "MQTT_SCHEME",
                "MQTT_BROKER",
                "UDP_LISTEN_PORT",
                "UDP_EXTERNAL_PORT",
                "VISION_URL",
                "VISION_TOKEN",
                "LLM_MODEL",
                "LLM_BASE_URL",
            ] {
                env::remove_var(name);
            }
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_sources() {
        cleanup_env_vars();

        let config = merge_config(None).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.udp_listen_port, DEFAULT_UDP_PORT);
        assert_eq!(config.udp_external_port, DEFAULT_UDP_PORT);
        assert!(config.vision.is_none());
        assert!(config.device_overrides.is_empty());
    }

    #[test]
    #[serial]
    fn test_env_fills_scalars_and_lists() {
        cleanup_env_vars();
        unsafe {
            env::set_var("AUTH_TOKENS", "a, b,,c");
            env::set_var("MQTT_SCHEME", "ssl");
            env::set_var("UDP_LISTEN_PORT", "9200");
            env::set_var("VISION_URL", "http://vision.local");
            env::set_var("VISION_TOKEN", "tok");
        }

        let config = merge_config(None).unwrap();
        assert_eq!(config.auth_tokens, vec!["a", "b", "c"]);
        assert_eq!(config.mqtt.scheme, MqttScheme::Ssl);
        assert_eq!(config.udp_listen_port, 9200);
        // External port follows the listen port unless set
        assert_eq!(config.udp_external_port, 9200);
        assert_eq!(config.vision.as_ref().unwrap().token, "tok");

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_llm_env_only_applies_without_yaml_section() {
        cleanup_env_vars();
        unsafe {
            env::set_var("LLM_MODEL", "env-model");
            env::set_var("LLM_BASE_URL", "http://llm.local/v1");
        }

        let config = merge_config(None).unwrap();
        match &config.device.llm {
            LlmProviderConfig::Openai(cfg) => {
                assert_eq!(cfg.model, "env-model");
                assert_eq!(cfg.base_url, "http://llm.local/v1");
            }
        }

        let yaml: YamlConfig =
            serde_yaml::from_str("providers:\n  llm:\n    provider: openai\n    config:\n      model: yaml-model\n")
                .unwrap();
        let config = merge_config(Some(yaml)).unwrap();
        match &config.device.llm {
            LlmProviderConfig::Openai(cfg) => assert_eq!(cfg.model, "yaml-model"),
        }

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_invalid_env_values_are_errors() {
        cleanup_env_vars();

        unsafe { env::set_var("PORT", "not-a-port") };
        assert!(merge_config(None).unwrap_err().to_string().contains("PORT"));
        unsafe { env::remove_var("PORT") };

        unsafe { env::set_var("MQTT_SCHEME", "quic") };
        assert!(merge_config(None).unwrap_err().to_string().contains("MQTT_SCHEME"));

        cleanup_env_vars();
    }
}
