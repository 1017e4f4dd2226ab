//! Configuration for a peerprobe node.
//!
//! A single TOML file with `[network]`, `[heartbeat]`, `[subnet]` and
//! `[logging]` sections. Missing fields fall back to the defaults below, so a
//! file only needs the values it changes.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub heartbeat: HeartbeatConfig,
    pub subnet: SubnetConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub node_port: u16,
    pub http_info_port: u16,
    pub listen_host: String,
    pub max_conn_in_bound: usize,
    pub max_conn_out_bound: usize,
    pub max_conn_in_bound_per_ip: usize,
    /// Peers allowed in reserved-only mode. Entries may be IPs or
    /// "host:port" names.
    pub reserved_peers: Vec<String>,
    pub reserved_only: bool,
    /// Address prefixes discovery never hands out.
    pub mask_peers: Vec<String>,
    pub seeds: Vec<String>,
    pub handshake_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub discovery_interval_secs: u64,
    pub bootstrap_interval_secs: u64,
    pub reconnect_interval_secs: u64,
    pub reconnect_max_retries: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_port: 20338,
            http_info_port: 20335,
            listen_host: "0.0.0.0".to_string(),
            max_conn_in_bound: 1024,
            max_conn_out_bound: 1024,
            max_conn_in_bound_per_ip: 16,
            reserved_peers: Vec::new(),
            reserved_only: false,
            mask_peers: Vec::new(),
            seeds: Vec::new(),
            handshake_timeout_secs: 10,
            dial_timeout_secs: 5,
            discovery_interval_secs: 10,
            bootstrap_interval_secs: 10,
            reconnect_interval_secs: 5,
            reconnect_max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub gen_block_time_secs: u64,
    pub update_rate_per_block: u64,
    pub keepalive_timeout_factor: u32,
    pub initial_height: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            gen_block_time_secs: 6,
            update_rate_per_block: 2,
            keepalive_timeout_factor: 15,
            initial_height: 9442,
        }
    }
}

impl HeartbeatConfig {
    /// Ticker period: block time divided by the update rate.
    pub fn period(&self) -> Duration {
        let rate = self.update_rate_per_block.max(1);
        Duration::from_millis(self.gen_block_time_secs * 1000 / rate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubnetConfig {
    pub refresh_secs: u64,
    pub max_inactive_secs: u64,
    pub max_member_requests: usize,
    /// Hex seed of this node's governance account, if it is one.
    pub gov_account: Option<String>,
    /// Governance public keys (hex) the mock ledger starts with.
    pub gov_pubkeys: Vec<String>,
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self {
            refresh_secs: 60,
            max_inactive_secs: 600,
            max_member_requests: 3,
            gov_account: None,
            gov_pubkeys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.network.node_port == 0 {
            return Err(AppError::InvalidPort(0));
        }
        if self.network.max_conn_in_bound_per_ip == 0 {
            return Err(AppError::Config(
                "max_conn_in_bound_per_ip must be at least 1".to_string(),
            ));
        }
        if self.network.reserved_only && self.network.reserved_peers.is_empty() {
            tracing::warn!("⚠️ reserved_only set without reserved_peers, filter disabled");
        }
        if self.heartbeat.update_rate_per_block == 0 || self.heartbeat.gen_block_time_secs == 0 {
            return Err(AppError::Config(
                "heartbeat period must be positive".to_string(),
            ));
        }
        match self.logging.format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(AppError::Config(format!("unknown log format {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("peerprobe.toml");

        let mut config = Config::default();
        config.network.node_port = 30338;
        config.network.seeds = vec!["10.0.0.1:20338".to_string()];
        config.subnet.max_member_requests = 5;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.network.node_port, 30338);
        assert_eq!(loaded.network.seeds, config.network.seeds);
        assert_eq!(loaded.subnet.max_member_requests, 5);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[network]\nnode_port = 40000\n").unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.network.node_port, 40000);
        assert_eq!(loaded.network.max_conn_in_bound_per_ip, 16);
        assert_eq!(loaded.heartbeat.keepalive_timeout_factor, 15);
        assert_eq!(loaded.subnet.refresh_secs, 60);
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = Config::default();
        config.network.node_port = 0;
        assert!(matches!(config.validate(), Err(AppError::InvalidPort(0))));
    }

    #[test]
    fn test_heartbeat_period() {
        let hb = HeartbeatConfig::default();
        assert_eq!(hb.period(), Duration::from_secs(3));
    }
}
