//! Configuration for shard-registrar components

use crate::common::utils::duration_serde;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Process-level configuration (file + environment)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Postgres connection string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Pool size shared by the store and the bus
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Registrar settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registrar: Option<RegistrarConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_connections() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: default_max_connections(),
            registrar: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from `shard-registrar.toml` (optional) and `SHARD_REGISTRAR__*` env vars
    pub fn load() -> crate::Result<Self> {
        Self::load_from("shard-registrar")
    }

    /// Load from the given file stem (optional) and `SHARD_REGISTRAR__*` env vars
    pub fn load_from(file_stem: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file_stem).required(false))
            .add_source(
                config::Environment::with_prefix("SHARD_REGISTRAR")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Registrar configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrarConfig {
    /// Cluster (partitioning domain) to join
    pub cluster: String,

    /// How often the lease is renewed
    #[serde(default = "default_heartbeat_interval", with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Extra lease time beyond the heartbeat interval
    #[serde(default = "default_grace_period", with = "duration_serde")]
    pub grace_period: Duration,

    /// Minimum time between two reshards of the cluster
    #[serde(default = "default_reshard_interval", with = "duration_serde")]
    pub reshard_interval: Duration,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}
fn default_reshard_interval() -> Duration {
    Duration::from_secs(60)
}

impl RegistrarConfig {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            heartbeat_interval: default_heartbeat_interval(),
            grace_period: default_grace_period(),
            reshard_interval: default_reshard_interval(),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_reshard_interval(mut self, interval: Duration) -> Self {
        self.reshard_interval = interval;
        self
    }

    /// Lease length written on every heartbeat
    pub fn lease_duration(&self) -> Duration {
        self.heartbeat_interval + self.grace_period
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.cluster.trim().is_empty() {
            return Err(crate::Error::InvalidConfig(
                "cluster name cannot be empty".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(crate::Error::InvalidConfig(
                "heartbeat interval must be positive".into(),
            ));
        }
        Ok(())
    }
}
