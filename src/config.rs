//! Configuration
//!
//! Endpoint settings shared by every role, plus the load-or-create helper
//! each instance uses for its YAML file. A missing config file is written
//! with defaults on first start.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;

/// Listener settings for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, `host:port`.
    pub address: String,
    pub use_tls: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Per-read timeout in seconds.
    pub read_timeout: u64,
    /// Maximum frame size in bytes.
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "localhost:4000".to_string(),
            use_tls: false,
            cert_file: None,
            key_file: None,
            read_timeout: 10,
            buffer_size: 1024,
        }
    }
}

impl ServerConfig {
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_read_timeout(mut self, seconds: u64) -> Self {
        self.read_timeout = seconds;
        self
    }
}

/// Outbound connection settings for one remote instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote address, `host:port`.
    pub server_address: String,
    pub use_tls: bool,
    pub ca_cert_file: Option<PathBuf>,
    /// Timeouts in seconds.
    pub connect_timeout: u64,
    pub write_timeout: u64,
    pub read_timeout: u64,
    /// Reconnect policy: at most `max_retries` attempts spaced
    /// `retry_wait_time` seconds apart.
    pub max_retries: u32,
    pub retry_wait_time: u64,
    /// Maximum frame size in bytes.
    pub buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost:4001".to_string(),
            use_tls: false,
            ca_cert_file: None,
            connect_timeout: 5,
            write_timeout: 5,
            read_timeout: 5,
            max_retries: 3,
            retry_wait_time: 1,
            buffer_size: 1024,
        }
    }
}

impl ClientConfig {
    pub fn with_server_address(mut self, address: impl Into<String>) -> Self {
        self.server_address = address.into();
        self
    }
}

/// Read a role config from `dir/file_name`, creating it with the given
/// defaults when absent.
pub fn load_or_create<T>(dir: &Path, file_name: &str, default: T) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let path = dir.join(file_name);
    if path.exists() {
        let raw = fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&raw)?)
    } else {
        info!(path = %path.display(), "config file missing, writing defaults");
        fs::write(&path, serde_yaml::to_string(&default)?)?;
        Ok(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
    struct RoleConfig {
        health_check_interval: u64,
        server_config: ServerConfig,
    }

    #[test]
    fn test_create_then_reload() {
        let dir = tempdir().unwrap();

        let default = RoleConfig {
            health_check_interval: 2,
            server_config: ServerConfig::default().with_address("localhost:4009"),
        };
        let created = load_or_create(dir.path(), ".node", default.clone()).unwrap();
        assert_eq!(created, default);
        assert!(dir.path().join(".node").exists());

        let reloaded: RoleConfig = load_or_create(dir.path(), ".node", RoleConfig::default()).unwrap();
        assert_eq!(reloaded, default);
    }

    #[test]
    fn test_existing_file_wins_over_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(".cluster"),
            "health_check_interval: 7\nserver_config:\n  address: localhost:9999\n",
        )
        .unwrap();

        let loaded: RoleConfig =
            load_or_create(dir.path(), ".cluster", RoleConfig::default()).unwrap();
        assert_eq!(loaded.health_check_interval, 7);
        assert_eq!(loaded.server_config.address, "localhost:9999");
    }
}
