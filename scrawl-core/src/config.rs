use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub ws_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            ws_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty URL selects the in-memory single-instance directory
    pub url: String,
    pub connect_timeout_seconds: u64,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_seconds: 5,
            key_prefix: "scrawl:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Outbound envelope queue depth per connection; full queues drop
    /// relayed events for that subscriber only
    pub outbound_buffer: usize,
    /// Maximum accepted WebSocket message size in bytes
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 1000,
            max_message_bytes: 64 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (SCRAWL_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("SCRAWL")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get Redis URL
    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    /// Get WebSocket listen address
    #[must_use]
    pub fn ws_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.ws_port)
    }

    /// Validate configuration, collecting every problem instead of stopping
    /// at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.ws_port == 0 {
            errors.push("server.ws_port must be non-zero".to_string());
        }
        if !self.redis.url.is_empty() && !self.redis.url.starts_with("redis://") {
            errors.push(format!(
                "redis.url must start with redis:// (got {})",
                self.redis.url
            ));
        }
        if self.redis.connect_timeout_seconds == 0 {
            errors.push("redis.connect_timeout_seconds must be non-zero".to_string());
        }
        if self.relay.outbound_buffer == 0 {
            errors.push("relay.outbound_buffer must be non-zero".to_string());
        }
        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => errors.push(format!("logging.format must be json or pretty (got {other})")),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ws_address(), "0.0.0.0:8080");
        assert!(config.redis_url().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.server.ws_port = 0;
        config.redis.url = "http://localhost".to_string();
        config.logging.format = "xml".to_string();

        let errors = config.validate().expect_err("should be invalid");
        assert_eq!(errors.len(), 3);
    }
}
