//! DoS detection for the firewall.
//!
//! This module tracks a sliding window of packet arrival times per source
//! address and sanctions sources that exceed the configured rate with a
//! temporary block. Thresholds are read from the DoS config store through a
//! debounced cache, and every evaluation is published to the status sink.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use lru::LruCache;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::classifier::PacketDescriptor;
use crate::core::monitoring;
use crate::storage::{DosConfigStore, DosStatus, StatusSink};

/// Trailing span over which a source's rate is measured
pub const WINDOW: Duration = Duration::from_secs(5);
/// Lifetime of a temporary block
pub const BLOCK_DURATION: Duration = Duration::from_secs(10);
/// Minimum time between two reads of the DoS config store
pub const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(2);

pub const DEFAULT_WARN_THRESHOLD: u32 = 50;
pub const DEFAULT_DROP_THRESHOLD: u32 = 110;

const MIN_THRESHOLD: i64 = 10;
const MAX_THRESHOLD: i64 = 2000;
/// Minimum distance between the warn and drop thresholds
const THRESHOLD_GAP: i64 = 10;

/// DoS thresholds exactly as read from the store, before clamping
///
/// Both fields are optional and accept either a JSON number or a numeric
/// string. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawDosConfig {
    #[serde(default, deserialize_with = "lenient_int")]
    pub warn_5s: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub drop_5s: Option<i64>,
}

fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(n)) => Ok(Some(n)),
        Some(Raw::Float(f)) => Ok(Some(f as i64)),
        Some(Raw::Text(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid threshold '{}'", s))),
    }
}

/// Effective, clamped DoS thresholds (packets per [`WINDOW`])
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosConfig {
    pub warn_threshold: u32,
    pub drop_threshold: u32,
}

impl Default for DosConfig {
    fn default() -> Self {
        Self {
            warn_threshold: DEFAULT_WARN_THRESHOLD,
            drop_threshold: DEFAULT_DROP_THRESHOLD,
        }
    }
}

impl DosConfig {
    /// Build a config from arbitrary thresholds
    ///
    /// The warn threshold is clamped to `[10, 1990]` and the drop threshold to
    /// `[warn + 10, 2000]`.
    pub fn clamped(warn: i64, drop: i64) -> Self {
        let warn = warn.clamp(MIN_THRESHOLD, MAX_THRESHOLD - THRESHOLD_GAP);
        let drop = drop.clamp(warn + THRESHOLD_GAP, MAX_THRESHOLD);
        Self {
            warn_threshold: warn as u32,
            drop_threshold: drop as u32,
        }
    }

    /// Apply defaults for missing fields, then clamp
    pub fn from_raw(raw: &RawDosConfig) -> Self {
        Self::clamped(
            raw.warn_5s.unwrap_or(DEFAULT_WARN_THRESHOLD as i64),
            raw.drop_5s.unwrap_or(DEFAULT_DROP_THRESHOLD as i64),
        )
    }
}

/// Coarse indicator of the most recent DoS evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DosState {
    #[default]
    Safe,
    Warn,
    Drop,
}

impl DosState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DosState::Safe => "safe",
            DosState::Warn => "warn",
            DosState::Drop => "drop",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => DosState::Warn,
            2 => DosState::Drop,
            _ => DosState::Safe,
        }
    }
}

impl fmt::Display for DosState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, read-only view of the detector's [`DosState`]
///
/// Only the detector writes it. Other holders may read it for observability
/// but never to make decisions.
#[derive(Debug, Clone, Default)]
pub struct DosStateCell(Arc<AtomicU8>);

impl DosStateCell {
    pub fn get(&self) -> DosState {
        DosState::from_u8(self.0.load(Ordering::Relaxed))
    }

    fn set(&self, state: DosState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }
}

/// Outcome of a DoS evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DosVerdict {
    /// No sanction, nothing to report
    Clear,
    /// Rate above the warn threshold; the rule engine still decides
    Warn(String),
    /// Rate above the drop threshold or an active temp block
    ForceDrop(String),
}

impl DosVerdict {
    /// Text attached to the log record, if any
    pub fn note(&self) -> Option<&str> {
        match self {
            DosVerdict::Clear => None,
            DosVerdict::Warn(note) | DosVerdict::ForceDrop(note) => Some(note),
        }
    }

    pub fn is_forced_drop(&self) -> bool {
        matches!(self, DosVerdict::ForceDrop(_))
    }
}

/// Cached DoS thresholds with debounced refresh from the store
pub struct DosConfigCache {
    store: Box<dyn DosConfigStore + Send>,
    config: DosConfig,
    last_reload: Option<Instant>,
}

impl DosConfigCache {
    pub fn new(store: Box<dyn DosConfigStore + Send>) -> Self {
        Self {
            store,
            config: DosConfig::default(),
            last_reload: None,
        }
    }

    /// Thresholds currently in effect, without touching the store
    pub fn config(&self) -> DosConfig {
        self.config
    }

    /// Thresholds in effect at `now`, reloading first if the cached value is
    /// older than [`CONFIG_RELOAD_INTERVAL`]
    pub fn current(&mut self, now: Instant) -> DosConfig {
        let stale = match self.last_reload {
            Some(last) => now.saturating_duration_since(last) > CONFIG_RELOAD_INTERVAL,
            None => true,
        };
        if stale {
            self.reload();
            self.last_reload = Some(now);
        }
        self.config
    }

    /// Reload from the store unconditionally
    ///
    /// A missing config means built-in defaults; an unreadable one keeps the
    /// last known thresholds.
    pub fn reload(&mut self) {
        let config = match self.store.load() {
            Ok(Some(raw)) => DosConfig::from_raw(&raw),
            Ok(None) => DosConfig::default(),
            Err(e) => {
                warn!("DoS config unavailable, keeping {:?}: {}", self.config, e);
                return;
            }
        };
        if config != self.config {
            info!(
                "DoS thresholds set to warn={} drop={} per {}s",
                config.warn_threshold,
                config.drop_threshold,
                WINDOW.as_secs()
            );
        }
        self.config = config;
    }
}

/// Bounds on the per-source state kept by the detector
#[derive(Debug, Clone, Copy)]
pub struct DetectorLimits {
    /// Windows with no packet for longer than this are dropped by the sweep
    pub source_idle: Duration,
    /// Hard cap on tracked source windows
    pub max_tracked_sources: usize,
    /// Time between two eviction sweeps
    pub sweep_interval: Duration,
}

impl Default for DetectorLimits {
    fn default() -> Self {
        Self {
            source_idle: Duration::from_secs(60),
            max_tracked_sources: 65_536,
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Per-source sliding-window DoS detector
pub struct DosDetector {
    /// Arrival times per source, oldest first; least recently active source
    /// at the LRU end
    windows: LruCache<IpAddr, VecDeque<Instant>>,
    /// Expiry of active temp blocks
    blocks: HashMap<IpAddr, Instant>,
    config: DosConfigCache,
    status: Box<dyn StatusSink + Send>,
    state: DosStateCell,
    limits: DetectorLimits,
    last_sweep: Option<Instant>,
}

impl DosDetector {
    /// Create a new DoS detector instance
    ///
    /// # Arguments
    ///
    /// * `config` - Source of the warn/drop thresholds
    /// * `status` - Sink receiving a status snapshot after every evaluation
    /// * `limits` - Eviction bounds for per-source state
    pub fn new(
        config: Box<dyn DosConfigStore + Send>,
        status: Box<dyn StatusSink + Send>,
        limits: DetectorLimits,
    ) -> Self {
        let capacity = NonZeroUsize::new(limits.max_tracked_sources).unwrap_or(NonZeroUsize::MIN);
        Self {
            windows: LruCache::new(capacity),
            blocks: HashMap::new(),
            config: DosConfigCache::new(config),
            status,
            state: DosStateCell::default(),
            limits,
            last_sweep: None,
        }
    }

    /// Handle on the global DoS state
    pub fn state(&self) -> DosStateCell {
        self.state.clone()
    }

    /// Thresholds currently in effect
    pub fn config(&self) -> DosConfig {
        self.config.config()
    }

    /// Number of sources with a live activity window
    pub fn tracked_sources(&self) -> usize {
        self.windows.len()
    }

    /// Whether `source` is under an unexpired temp block at `now`
    pub fn is_blocked(&self, source: &IpAddr, now: Instant) -> bool {
        self.blocks.get(source).map_or(false, |&expires_at| expires_at > now)
    }

    /// Load the thresholds, reset the state to SAFE and publish it
    pub fn reset(&mut self, now: Instant) {
        let config = self.config.current(now);
        self.state.set(DosState::Safe);
        self.publish(DosState::Safe, config, None, None);
    }

    /// Evaluate one packet arriving at `now`
    ///
    /// # Arguments
    ///
    /// * `pkt` - The classified packet
    /// * `now` - Arrival time; must not go backwards between calls
    ///
    /// # Returns
    ///
    /// * `DosVerdict::ForceDrop` if the source is or becomes temp-blocked
    /// * `DosVerdict::Warn` if the source rate reached the warn threshold
    /// * `DosVerdict::Clear` otherwise, and always for loopback destinations
    pub fn evaluate(&mut self, pkt: &PacketDescriptor, now: Instant) -> DosVerdict {
        if pkt.destination.is_loopback() {
            // Loopback resolves to SAFE for this packet only; the global state is left alone.
            return DosVerdict::Clear;
        }
        self.sweep_if_due(now);

        let source = pkt.source;
        if let Some(&expires_at) = self.blocks.get(&source) {
            if expires_at > now {
                let left = expires_at.saturating_duration_since(now).as_secs();
                self.state.set(DosState::Drop);
                self.publish(DosState::Drop, self.config.config(), Some(source), None);
                return DosVerdict::ForceDrop(format!("DoS temp-drop active ({}s left)", left));
            }
            debug!("Temp block for {} expired", source);
            self.blocks.remove(&source);
        }

        let rate = self.record(source, now);
        let config = self.config.current(now);

        let (state, verdict) = if rate >= config.drop_threshold as usize {
            self.blocks.insert(source, now + BLOCK_DURATION);
            warn!(
                "Temp-blocking {} for {}s at {} packets/{}s",
                source,
                BLOCK_DURATION.as_secs(),
                rate,
                WINDOW.as_secs()
            );
            (
                DosState::Drop,
                DosVerdict::ForceDrop(format!("DoS temp-drop triggered ({}/5s)", rate)),
            )
        } else if rate >= config.warn_threshold as usize {
            (DosState::Warn, DosVerdict::Warn(format!("DoS warning ({}/5s)", rate)))
        } else {
            (DosState::Safe, DosVerdict::Clear)
        };

        self.state.set(state);
        self.publish(state, config, Some(source), Some(rate));
        verdict
    }

    /// Append `now` to the source's window, trim it and return the rate
    fn record(&mut self, source: IpAddr, now: Instant) -> usize {
        if !self.windows.contains(&source) && self.windows.len() >= self.windows.cap().get() {
            self.make_room(now);
        }

        let window = self.windows.get_or_insert_mut(source, VecDeque::new);
        window.push_back(now);
        if let Some(cutoff) = now.checked_sub(WINDOW) {
            while window.front().map_or(false, |&t| t < cutoff) {
                window.pop_front();
            }
        }
        window.len()
    }

    fn sweep_if_due(&mut self, now: Instant) {
        match self.last_sweep {
            Some(last) if now.saturating_duration_since(last) < self.limits.sweep_interval => {}
            Some(_) => self.sweep(now),
            None => self.last_sweep = Some(now),
        }
    }

    /// Drop idle windows and expired temp blocks
    pub fn sweep(&mut self, now: Instant) {
        let evicted = self.evict_idle(now);
        self.blocks.retain(|_, expires_at| *expires_at > now);
        self.last_sweep = Some(now);

        if evicted > 0 {
            debug!("Evicted {} idle source windows", evicted);
        }
        monitoring::record_tracked_sources(self.windows.len());
    }

    /// Pop idle windows from the LRU end; stops at the first active one
    fn evict_idle(&mut self, now: Instant) -> usize {
        let idle = self.limits.source_idle;
        let mut evicted = 0;
        while let Some((_, window)) = self.windows.peek_lru() {
            let active = window
                .back()
                .map_or(false, |&last| now.saturating_duration_since(last) <= idle);
            if active {
                break;
            }
            self.windows.pop_lru();
            evicted += 1;
        }
        evicted
    }

    fn make_room(&mut self, now: Instant) {
        if self.evict_idle(now) > 0 {
            return;
        }
        if let Some((source, _)) = self.windows.pop_lru() {
            debug!("Source table full, evicting window of {}", source);
        }
    }

    fn publish(&mut self, state: DosState, config: DosConfig, source: Option<IpAddr>, rate: Option<usize>) {
        monitoring::record_dos_state(state);
        let status = DosStatus {
            state,
            warn_threshold: config.warn_threshold,
            drop_threshold: config.drop_threshold,
            window_seconds: WINDOW.as_secs(),
            block_seconds: BLOCK_DURATION.as_secs(),
            source,
            rate,
        };
        if let Err(e) = self.status.publish(&status) {
            warn!("Failed to publish DoS status: {}", e);
        }
    }
}
