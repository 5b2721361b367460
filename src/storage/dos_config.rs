use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::StoreError;
use crate::core::dos_detector::RawDosConfig;

/// Source of the DoS thresholds
///
/// `Ok(None)` means no configuration is stored and built-in defaults apply.
pub trait DosConfigStore {
    fn load(&self) -> Result<Option<RawDosConfig>, StoreError>;
}

/// DoS config store backed by a JSON file with `warn_5s` / `drop_5s` keys
pub struct JsonFileDosConfigStore {
    path: PathBuf,
}

impl JsonFileDosConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DosConfigStore for JsonFileDosConfigStore {
    fn load(&self) -> Result<Option<RawDosConfig>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }
}

/// In-memory DoS config store; clones share the same value
#[derive(Clone, Default)]
pub struct MemoryDosConfigStore {
    inner: Arc<Mutex<Option<RawDosConfig>>>,
}

impl MemoryDosConfigStore {
    pub fn new(config: Option<RawDosConfig>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(config)),
        }
    }

    /// Thresholds given directly, as the administrative interface would store them
    pub fn with_thresholds(warn: i64, drop: i64) -> Self {
        Self::new(Some(RawDosConfig {
            warn_5s: Some(warn),
            drop_5s: Some(drop),
        }))
    }

    pub fn set(&self, config: Option<RawDosConfig>) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = config;
        }
    }
}

impl DosConfigStore for MemoryDosConfigStore {
    fn load(&self) -> Result<Option<RawDosConfig>, StoreError> {
        self.inner
            .lock()
            .map(|inner| inner.clone())
            .map_err(|_| StoreError::Unavailable("DoS config lock poisoned".to_string()))
    }
}
