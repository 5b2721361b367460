//! External collaborators of the decision pipeline.
//!
//! The rule file and DoS config file are owned by the administrative
//! interface and read here as best-effort snapshots. The DoS status file and
//! the verdict log are write-only sinks; their failures never reach the
//! packet path.

mod dos_config;
mod log_sink;
mod rules;
mod status;

use thiserror::Error;

pub use dos_config::{DosConfigStore, JsonFileDosConfigStore, MemoryDosConfigStore};
pub use log_sink::{JsonLinesLogSink, LogRecord, LogSink, RedisLogSink};
pub use rules::{JsonFileRuleStore, MemoryRuleStore, RuleLoad, RuleStore};
pub use status::{DosStatus, JsonFileStatusSink, StatusSink};

#[cfg(test)]
pub use log_sink::MockLogSink;
#[cfg(test)]
pub use status::MockStatusSink;

/// Errors raised while reading the rule or DoS config store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while writing to a status or log sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
