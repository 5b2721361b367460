use thiserror::Error;

use crate::storage::SinkError;

/// Errors that stop the firewall from starting or keep it from running
#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("Packet queue error: {0}")]
    Queue(#[from] std::io::Error),
    #[error("Metrics exporter error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Unsupported platform: {0}")]
    Unsupported(String),
}
