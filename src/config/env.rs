use std::env;
use std::fmt::Display;
use std::str::FromStr;

use super::ServerConfig;
use super::merge::merge_config;
use super::validation::validate;

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// Reads configuration from environment variables, with sensible defaults.
    /// Also loads from .env file if present using dotenvy.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Environment variables are malformed
    /// - Configuration validation fails
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = merge_config(None)?;
        validate(&config)?;
        Ok(config)
    }
}

/// Parse an environment variable, treating an unset variable as `None`.
pub(super) fn env_parse<T>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid {name} environment variable: {e}").into()),
        Err(_) => Ok(None),
    }
}

/// Switch such as `AUTH_ENABLED` or `MQTT_ENABLED`. Accepts true/false,
/// 1/0 and yes/no in any case.
pub(super) fn env_flag(name: &str) -> Result<Option<bool>, Box<dyn std::error::Error>> {
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(Some(true)),
        "false" | "0" | "no" => Ok(Some(false)),
        other => Err(format!("Invalid {name} environment variable: expected a boolean, got '{other}'").into()),
    }
}

/// Comma separated list; empty items are dropped.
pub(super) fn env_list(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
}
