use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

pub const DEFAULT_CONFIG_PATH: &str = "config/server.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: String,
    pub server_port: u16,
    pub max_connections: usize,
    /// A user whose last heartbeat is older than this is evicted.
    pub heartbeat_timeout_ms: u64,
    /// How often the heartbeat monitor sweeps the registry.
    pub heartbeat_interval_ms: u64,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            server_port: 8888,
            max_connections: 100,
            heartbeat_timeout_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.server_port)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be at least 1".into()));
        }
        if self.heartbeat_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(ServerError::Config(
                "heartbeat timeout and interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> ServerConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<ServerConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                ServerConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            ServerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let path = std::env::temp_dir().join(format!("server-{}.json", uuid::Uuid::new_v4()));
        fs::write(&path, r#"{ "server_port": 9999, "heartbeat_timeout_ms": 5000 }"#).unwrap();

        let config = load_config(path.to_str().unwrap());
        assert_eq!(config.server_port, 9999);
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));

        fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_or_broken_file_falls_back() {
        assert_eq!(load_config("does/not/exist.json"), ServerConfig::default());

        let path = std::env::temp_dir().join(format!("server-{}.json", uuid::Uuid::new_v4()));
        fs::write(&path, "server_port = 1").unwrap();
        assert_eq!(load_config(path.to_str().unwrap()), ServerConfig::default());
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_validate() {
        assert!(ServerConfig::default().validate().is_ok());

        let config = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            heartbeat_interval_ms: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
