//! Service configuration.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. `adfleet.yaml` (or `.toml`/`.json`) in the working directory, if present
//! 3. the file named by `ADFLEET_CONFIG`, if set
//! 4. `ADFLEET__SECTION__KEY` environment variables

use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

pub const CONFIG_ENV_VAR: &str = "ADFLEET_CONFIG";
pub const CONFIG_ENV_PREFIX: &str = "ADFLEET";
const DEFAULT_CONFIG_FILE: &str = "adfleet";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub evidence: EvidenceConfig,
    pub notifications: NotificationConfig,
    pub retry: RetryConfig,
    pub lifecycle: LifecycleConfig,
    pub log: LogConfig,
}

impl Config {
    pub fn load() -> Result<Config, Error> {
        use ::config::{Config as ConfigLib, Environment, File};

        let mut builder =
            ConfigLib::builder().add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false));

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for raw request bodies such as evidence uploads.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackend {
    Mongo,
    Memory,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub uri: String,
    pub name: String,
}

impl Default for DatabaseConfig {
    fn default() -> DatabaseConfig {
        DatabaseConfig {
            backend: DatabaseBackend::Mongo,
            uri: "mongodb://localhost:27017/?replicaSet=rs0".to_string(),
            name: "adfleet".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    pub callback_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> GatewayConfig {
        GatewayConfig {
            base_url: "https://api.paystack.co".to_string(),
            secret_key: String::new(),
            callback_url: None,
            timeout_secs: 30,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub directory: String,
    pub public_url: String,
}

impl Default for EvidenceConfig {
    fn default() -> EvidenceConfig {
        EvidenceConfig {
            directory: "./evidence".to_string(),
            public_url: "http://127.0.0.1:8080/evidence".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// When unset, notifications are only written to the log.
    pub webhook_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig {
            min_delay_ms: 100,
            max_delay_ms: 5_000,
            max_attempts: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub sweep_interval_secs: u64,
    /// Approved assignments become due soon this many days before the
    /// campaign ends.
    pub due_soon_days: i64,
}

impl Default for LifecycleConfig {
    fn default() -> LifecycleConfig {
        LifecycleConfig {
            sweep_interval_secs: 300,
            due_soon_days: 7,
        }
    }
}

impl LifecycleConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn due_soon_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.due_soon_days)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// An `EnvFilter` directive, e.g. `info,adfleet=debug`.
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            filter: "info,adfleet=debug".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_for_local_development() {
        let config = Config::default();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.backend, DatabaseBackend::Mongo);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.lifecycle.due_soon_window(), chrono::Duration::days(7));
        assert!(config.notifications.webhook_url.is_none());
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "database": { "backend": "memory" }, "retry": { "max_attempts": 2 } }"#,
        )
        .unwrap();

        assert_eq!(config.database.backend, DatabaseBackend::Memory);
        assert_eq!(config.database.name, "adfleet");
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.min_delay_ms, 100);
    }
}
