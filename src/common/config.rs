//! Configuration for minishard components

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::sharder::Sharder;

/// Per-process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server ID (unique identifier)
    pub server_id: String,

    /// Address this server is reachable at (for shard routing)
    pub address: String,

    /// Cluster-wide settings, identical on every process
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Which balancing discipline this deployment runs
    #[serde(default)]
    pub mode: BalanceMode,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Balancing discipline. A deployment picks one; they are not mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BalanceMode {
    /// Versioned assignments published by the elected assigner
    #[default]
    Assigner,
    /// Decentralised master-only claims held directly in the store
    Roler,
}

/// Cluster-wide configuration. Every process must be provisioned with
/// identical values; disagreement about the shard space is fatal at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Discovery store namespace all keys live under
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Number of shards in the global shard space
    #[serde(default = "default_num_shards")]
    pub num_shards: u64,

    /// Replicas per shard
    #[serde(default)]
    pub num_replicas: u64,

    /// Lease on server state entries; a server whose lease lapses is dead.
    /// State is refreshed every `hold_ttl_secs / 2`.
    #[serde(default = "default_hold_ttl")]
    pub hold_ttl_secs: u64,

    /// Roler tick interval (milliseconds)
    #[serde(default = "default_roler_tick")]
    pub roler_tick_ms: u64,
}

fn default_namespace() -> String {
    "minishard".to_string()
}
fn default_num_shards() -> u64 {
    16
}
fn default_hold_ttl() -> u64 {
    20
}
fn default_roler_tick() -> u64 {
    1000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            num_shards: default_num_shards(),
            num_replicas: 0,
            hold_ttl_secs: default_hold_ttl(),
            roler_tick_ms: default_roler_tick(),
        }
    }
}

impl ClusterConfig {
    /// Lease duration on server state entries
    pub fn hold_ttl(&self) -> Duration {
        Duration::from_secs(self.hold_ttl_secs)
    }

    /// Roler tick interval
    pub fn roler_tick(&self) -> Duration {
        Duration::from_millis(self.roler_tick_ms)
    }

    /// Build the sharder described by this config
    pub fn sharder(&self) -> crate::Result<Sharder> {
        Sharder::new(self.num_shards, self.num_replicas)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.namespace.is_empty() {
            return Err(crate::Error::InvalidConfig("namespace is required".into()));
        }
        if self.num_shards == 0 {
            return Err(crate::Error::InvalidConfig(
                "num_shards must be at least 1".into(),
            ));
        }
        if self.hold_ttl_secs < 2 {
            return Err(crate::Error::InvalidConfig(
                "hold_ttl_secs must be at least 2 (state is refreshed at ttl/2)".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Save to file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Internal(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.server_id.is_empty() {
            return Err(crate::Error::InvalidConfig("server_id is required".into()));
        }
        if self.address.is_empty() {
            return Err(crate::Error::InvalidConfig("address is required".into()));
        }
        self.cluster.validate()
    }
}
