//! ShardSync Configuration
//!
//! This module provides configuration structures for the replication core
//! and the in-memory simulator.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::replication::{ReplicationConfig, ReplicationMode, ReplicationProxy};
use crate::shard::ActiveShardCount;

/// Main ShardSync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardSyncConfig {
    /// Replication settings
    #[serde(default)]
    pub replication: ReplicationSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Simulator configuration
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Replication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Upper bound of the first retry delay in milliseconds
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,

    /// Time after which replica calls stop being retried, in milliseconds
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,

    /// Active copies required before a write starts ("none", "all" or a count)
    #[serde(default)]
    pub wait_for_active_shards: ActiveShardCount,

    /// Mode for copies without a topology hint (mode-aware policy only)
    #[serde(default)]
    pub replication_mode_override: Option<ReplicationMode>,

    /// Respect per-copy replication mode hints instead of fanning out to every copy
    #[serde(default)]
    pub mode_aware: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Shard group built by the simulator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of started replica copies
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Number of writes to replicate
    #[serde(default = "default_writes")]
    pub writes: usize,

    /// Replica copies that are not allocated anywhere
    #[serde(default)]
    pub unassigned_replicas: usize,

    /// Replicas that reject the first `flaky_attempts` calls with a transient error
    #[serde(default)]
    pub flaky_replicas: usize,

    #[serde(default = "default_flaky_attempts")]
    pub flaky_attempts: usize,

    /// Replicas that reject every call with a permanent error
    #[serde(default)]
    pub failing_replicas: usize,

    /// Upper bound of the simulated replica latency in milliseconds
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
}

fn default_retry_initial_backoff_ms() -> u64 {
    50
}

fn default_retry_timeout_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_replicas() -> usize {
    2
}

fn default_writes() -> usize {
    10
}

fn default_flaky_attempts() -> usize {
    2
}

fn default_max_latency_ms() -> u64 {
    5
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            retry_timeout_ms: default_retry_timeout_ms(),
            wait_for_active_shards: ActiveShardCount::default(),
            replication_mode_override: None,
            mode_aware: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            writes: default_writes(),
            unassigned_replicas: 0,
            flaky_replicas: 0,
            flaky_attempts: default_flaky_attempts(),
            failing_replicas: 0,
            max_latency_ms: default_max_latency_ms(),
        }
    }
}

impl ShardSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ShardSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        let replication = &self.replication;
        if replication.retry_initial_backoff_ms < 1 {
            return Err(crate::Error::Config(
                "replication.retry_initial_backoff_ms must be at least 1".into(),
            ));
        }

        if replication.retry_timeout_ms < replication.retry_initial_backoff_ms {
            return Err(crate::Error::Config(format!(
                "replication.retry_timeout_ms ({}) must not be less than retry_initial_backoff_ms ({})",
                replication.retry_timeout_ms, replication.retry_initial_backoff_ms
            )));
        }

        if replication.replication_mode_override.is_some() && !replication.mode_aware {
            return Err(crate::Error::Config(
                "replication.replication_mode_override requires mode_aware = true".into(),
            ));
        }

        let simulation = &self.simulation;
        if simulation.flaky_replicas + simulation.failing_replicas > simulation.replicas {
            return Err(crate::Error::Config(format!(
                "simulation has {} replicas but {} flaky and {} failing",
                simulation.replicas, simulation.flaky_replicas, simulation.failing_replicas
            )));
        }

        Ok(())
    }

    /// Get initial retry backoff as Duration
    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.replication.retry_initial_backoff_ms)
    }

    /// Get retry timeout as Duration
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.retry_timeout_ms)
    }

    /// Get simulated replica latency bound as Duration
    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.simulation.max_latency_ms)
    }

    /// Retry settings for replication operations
    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            retry_initial_backoff: self.retry_initial_backoff(),
            retry_timeout: self.retry_timeout(),
        }
    }

    /// Replication mode policy
    pub fn replication_proxy(&self) -> ReplicationProxy {
        if self.replication.mode_aware {
            ReplicationProxy::mode_aware(self.replication.replication_mode_override)
        } else {
            ReplicationProxy::Fanout
        }
    }
}
