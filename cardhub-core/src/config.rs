use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub presence: PresenceConfig,
    pub delivery: DeliveryConfig,
    pub call: CallConfig,
    pub email: EmailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty URL runs the fanout bus in single-node mode
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 shared secret for verifying bearer tokens issued upstream
    pub token_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: "change-me".to_string(),
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

/// Presence/registry tunables. The sweep interval and heartbeat timeout
/// are tunables, not fixed guarantees.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub heartbeat_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
    /// Remote instance presence claims older than this are pruned
    pub remote_max_age_seconds: u64,
    pub max_connections_per_user: usize,
    pub max_connections_total: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 60,
            sweep_interval_seconds: 30,
            remote_max_age_seconds: 300,
            max_connections_per_user: 8,
            max_connections_total: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub workers_per_kind: usize,
    pub queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_seconds: 2,
            workers_per_kind: 4,
            queue_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// How long a call may ring unanswered before timing out
    pub ring_timeout_seconds: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_seconds: 45,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// Empty host disables outgoing email
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_email: String,
    pub from_name: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            from_email: "noreply@cardhub.example".to_string(),
            from_name: "Cardhub".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus `CARDHUB_*` env
    /// overrides (e.g. `CARDHUB_SERVER__HTTP_PORT=9090`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder
            .add_source(Environment::with_prefix("CARDHUB").separator("__"))
            .build()?
            .try_deserialize()
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    #[must_use]
    pub fn email_configured(&self) -> bool {
        !self.email.smtp_host.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.delivery.max_attempts, 3);
        assert_eq!(config.delivery.backoff_base_seconds, 2);
        assert_eq!(config.presence.heartbeat_timeout_seconds, 60);
        assert!(config.call.ring_timeout_seconds >= 30 && config.call.ring_timeout_seconds <= 60);
        assert!(!config.email_configured());
    }

    #[test]
    fn test_http_address() {
        let config = Config::default();
        assert_eq!(config.http_address(), "0.0.0.0:8080");
    }
}
