use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use log::{debug, warn};

use super::StoreError;
use crate::core::rule_engine::Rule;

/// Result of reading the rule store
#[derive(Debug, Clone, PartialEq)]
pub enum RuleLoad {
    /// The store has no rule set; the fallback verdict applies
    Absent,
    /// The store has not changed since the previous successful read
    Unchanged,
    /// A freshly read, ordered rule list
    Rules(Vec<Rule>),
}

/// Source of the persisted, ordered rule list
pub trait RuleStore {
    fn load(&mut self) -> Result<RuleLoad, StoreError>;
}

/// Rule store backed by the JSON rule file
///
/// The file is re-parsed only when its modification time changes.
pub struct JsonFileRuleStore {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl JsonFileRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RuleStore for JsonFileRuleStore {
    fn load(&mut self) -> Result<RuleLoad, StoreError> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.last_modified = None;
                return Ok(RuleLoad::Absent);
            }
            Err(e) => return Err(e.into()),
        };

        let modified = metadata.modified().ok();
        if modified.is_some() && modified == self.last_modified {
            return Ok(RuleLoad::Unchanged);
        }

        let content = fs::read_to_string(&self.path)?;
        let rules = parse_rules(&content)?;
        debug!("Read {} rules from {}", rules.len(), self.path.display());

        // Only remember the timestamp once the content parsed, so a file caught
        // mid-write is retried on the next read.
        self.last_modified = modified;
        Ok(RuleLoad::Rules(rules))
    }
}

/// Parse the rule file, skipping individual rules that do not parse
///
/// A document that is not a JSON array is an error; a single bad entry (a
/// CIDR in `src`, an unknown protocol) only drops that entry, since it could
/// never match a packet anyway.
fn parse_rules(content: &str) -> Result<Vec<Rule>, StoreError> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(content)?;
    let mut rules = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let id = entry.get("id").map(|id| id.to_string());
        match serde_json::from_value::<Rule>(entry) {
            Ok(rule) => rules.push(rule),
            Err(e) => warn!(
                "Skipping rule {} (entry {}): {}",
                id.as_deref().unwrap_or("without id"),
                index,
                e
            ),
        }
    }
    Ok(rules)
}

/// In-memory rule store
///
/// Clones share the same contents, so a test or embedding can swap rules
/// while the engine owns the store.
#[derive(Clone)]
pub struct MemoryRuleStore {
    inner: Arc<Mutex<Result<Option<Vec<Rule>>, String>>>,
}

impl Default for MemoryRuleStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MemoryRuleStore {
    pub fn new(rules: Option<Vec<Rule>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Ok(rules))),
        }
    }

    /// Replace the stored rules; `None` means no rule set
    pub fn set(&self, rules: Option<Vec<Rule>>) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = Ok(rules);
        }
    }

    /// Make subsequent reads fail
    pub fn fail_with(&self, reason: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = Err(reason.to_string());
        }
    }
}

impl RuleStore for MemoryRuleStore {
    fn load(&mut self) -> Result<RuleLoad, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Unavailable("rule store lock poisoned".to_string()))?;
        match &*inner {
            Ok(Some(rules)) => Ok(RuleLoad::Rules(rules.clone())),
            Ok(None) => Ok(RuleLoad::Absent),
            Err(reason) => Err(StoreError::Unavailable(reason.clone())),
        }
    }
}
