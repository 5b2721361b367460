use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::rule_engine::FailurePolicy;

/// Kernel queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// NFQUEUE number the iptables/nftables rule sends packets to
    pub num: u16,
}

/// Locations of the files shared with the administrative interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Ordered rule list (JSON array)
    pub rules_file: PathBuf,
    /// DoS thresholds (`warn_5s` / `drop_5s`)
    pub dos_config_file: PathBuf,
    /// DoS status written after every evaluated packet
    pub dos_state_file: PathBuf,
}

/// Where verdict records go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    File,
    Redis,
}

/// Verdict log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub backend: LogBackend,
    /// JSON-lines file used by the `file` backend
    pub path: PathBuf,
    /// Redis connection URL used by the `redis` backend
    pub redis_url: String,
    /// Redis list receiving the records
    pub redis_key: String,
    /// Cap on the Redis list length; zero keeps everything
    pub max_entries: usize,
}

/// Decision pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Verdict when no decision can be reached
    pub failure_policy: FailurePolicy,
    /// Minimum time between rule store reads; zero checks before every packet
    pub rule_reload_interval_ms: u64,
    /// Idle time after which a source's DoS window is evicted
    pub source_idle_secs: u64,
    /// Hard cap on sources tracked by the DoS detector
    pub max_tracked_sources: usize,
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
    pub engine: EngineConfig,
    pub metrics: MetricsConfig,
}
