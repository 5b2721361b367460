use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::SinkError;
use crate::core::dos_detector::DosState;

/// Snapshot of the DoS detector published after every evaluated packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DosStatus {
    pub state: DosState,
    #[serde(rename = "warn_5s")]
    pub warn_threshold: u32,
    #[serde(rename = "drop_5s")]
    pub drop_threshold: u32,
    #[serde(rename = "window_sec")]
    pub window_seconds: u64,
    #[serde(rename = "block_sec")]
    pub block_seconds: u64,
    #[serde(rename = "src", skip_serializing_if = "Option::is_none", default)]
    pub source: Option<IpAddr>,
    #[serde(rename = "rate_5s", skip_serializing_if = "Option::is_none", default)]
    pub rate: Option<usize>,
}

/// Write-only channel for [`DosStatus`] updates
#[cfg_attr(test, mockall::automock)]
pub trait StatusSink {
    fn publish(&mut self, status: &DosStatus) -> Result<(), SinkError>;
}

/// Status sink that replaces a JSON file on every update
///
/// The file is written next to its destination and renamed into place, so a
/// reader never observes a partial document.
pub struct JsonFileStatusSink {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl JsonFileStatusSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            path,
            tmp_path: PathBuf::from(tmp),
        }
    }
}

impl StatusSink for JsonFileStatusSink {
    fn publish(&mut self, status: &DosStatus) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(status)?;
        fs::write(&self.tmp_path, payload)?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}
