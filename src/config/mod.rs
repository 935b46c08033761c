//! # Configuration Management Module
//!
//! TOML configuration for the mesh client. Every section and every key has a default, so an
//! empty file (or no file at all, via [`Config::default`]) is a valid configuration.
//!
//! ## Configuration Structure
//!
//! - [`ConnectionConfig`] - node address, connect timeout, heartbeat period
//! - [`ReconnectConfig`] - automatic reconnection after link loss
//! - [`BridgeConfig`] - event queue sizing and consumer pacing
//! - [`StorageConfig`] - SQLite database location and lock-contention handling
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshclient::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("meshclient.toml").await?;
//!     let config = Config::load("meshclient.toml").await?;
//!     println!("Node: {}:{}", config.connection.host, config.connection.port);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [connection]
//! host = "localhost"
//! port = 4403
//! connect_timeout_ms = 10000
//! heartbeat_secs = 60
//!
//! [reconnect]
//! enabled = true
//! backoff_ms = [1000, 2000, 5000, 10000, 30000]
//! max_attempts = 10
//!
//! [bridge]
//! capacity = 1024
//! drain_batch = 64
//! poll_interval_ms = 100
//!
//! [storage]
//! database = "mesh_client.db"
//! busy_timeout_ms = 5000
//! max_retries = 5
//! retry_backoff_ms = 20
//!
//! [logging]
//! level = "info"
//! file = "meshclient.log"
//! ```

use crate::adapter::{AdapterSettings, ReconnectPolicy};
use crate::driver::{Endpoint, TcpDriverOptions};
use crate::storage::StoreSettings;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectConfig,
    pub bridge: BridgeConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Covers TCP connect and the config handshake together.
    pub connect_timeout_ms: u64,
    pub heartbeat_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host: "localhost".to_string(),
            port: 4403,
            connect_timeout_ms: 10_000,
            heartbeat_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub backoff_ms: Vec<u64>,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            enabled: true,
            backoff_ms: vec![1_000, 2_000, 5_000, 10_000, 30_000],
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Events held before node updates and diagnostics start being shed.
    pub capacity: usize,
    /// Events applied per pump.
    pub drain_batch: usize,
    /// Longest idle wait of the consumer loop.
    pub poll_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            capacity: 1024,
            drain_batch: 64,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database: String,
    pub busy_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database: "mesh_client.db".to_string(),
            busy_timeout_ms: 5_000,
            max_retries: 5,
            retry_backoff_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.host.trim().is_empty() {
            return Err(anyhow!("connection.host must not be empty"));
        }
        if self.connection.port == 0 {
            return Err(anyhow!("connection.port must be non-zero"));
        }
        if self.bridge.capacity == 0 || self.bridge.drain_batch == 0 {
            return Err(anyhow!("bridge.capacity and bridge.drain_batch must be positive"));
        }
        if self.reconnect.enabled && self.reconnect.backoff_ms.is_empty() {
            return Err(anyhow!("reconnect.backoff_ms needs at least one delay"));
        }
        if self.storage.database.trim().is_empty() {
            return Err(anyhow!("storage.database must not be empty"));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.connection.host.clone(), self.connection.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.bridge.poll_interval_ms)
    }

    pub fn driver_options(&self) -> TcpDriverOptions {
        TcpDriverOptions {
            heartbeat_interval: Duration::from_secs(self.connection.heartbeat_secs.max(1)),
            ..TcpDriverOptions::default()
        }
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        let reconnect = if self.reconnect.enabled {
            ReconnectPolicy {
                enabled: true,
                backoff: self
                    .reconnect
                    .backoff_ms
                    .iter()
                    .copied()
                    .map(Duration::from_millis)
                    .collect(),
                max_attempts: self.reconnect.max_attempts,
            }
        } else {
            ReconnectPolicy::disabled()
        };
        AdapterSettings {
            connect_timeout: self.connect_timeout(),
            reconnect,
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            busy_timeout: Duration::from_millis(self.storage.busy_timeout_ms),
            max_retries: self.storage.max_retries,
            retry_backoff: Duration::from_millis(self.storage.retry_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.port, 4403);
        assert_eq!(config.storage.database, "mesh_client.db");
        assert!(config.reconnect.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            host = "192.168.1.50"

            [reconnect]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.host, "192.168.1.50");
        assert_eq!(config.connection.port, 4403);
        assert_eq!(config.adapter_settings().reconnect, ReconnectPolicy::disabled());
    }

    #[test]
    fn validation_rejects_zero_capacity() {
        let mut config = Config::default();
        config.bridge.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn default_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshclient.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.bridge.capacity, Config::default().bridge.capacity);
        assert_eq!(loaded.reconnect.backoff_ms, ReconnectConfig::default().backoff_ms);
    }
}
