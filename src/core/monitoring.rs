//! Monitoring for the firewall.
//!
//! This module names the Prometheus metrics recorded on the packet path and
//! installs the optional scrape endpoint. Without an installed recorder every
//! recording call is a no-op.

use std::net::SocketAddr;

use log::{info, warn};
use metrics::{counter, describe_counter, describe_gauge, gauge, increment_counter};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::core::dos_detector::DosState;
use crate::core::rule_engine::Action;

pub const PACKETS_TOTAL: &str = "firewall_packets_total";
pub const MALFORMED_PACKETS_TOTAL: &str = "firewall_malformed_packets_total";
pub const DOS_FORCED_DROPS_TOTAL: &str = "firewall_dos_forced_drops_total";
pub const DOS_STATE: &str = "firewall_dos_state";
pub const DOS_TRACKED_SOURCES: &str = "firewall_dos_tracked_sources";

const LABEL_VERDICT: &str = "verdict";

/// Install the global Prometheus recorder with an HTTP listener on `listen`
///
/// Must be called from within a Tokio runtime, once per process.
pub fn install_exporter(listen: SocketAddr) -> Result<(), BuildError> {
    if listen.ip().is_unspecified() {
        warn!("Metrics endpoint {} is exposed on all interfaces", listen);
    }
    PrometheusBuilder::new().with_http_listener(listen).install()?;
    describe_all();
    info!("Prometheus metrics available on http://{}/metrics", listen);
    Ok(())
}

fn describe_all() {
    describe_counter!(PACKETS_TOTAL, "Packets given a verdict, by verdict");
    describe_counter!(MALFORMED_PACKETS_TOTAL, "Packets that could not be classified");
    describe_counter!(DOS_FORCED_DROPS_TOTAL, "Packets dropped by the DoS detector");
    describe_gauge!(DOS_STATE, "Most recent DoS state: 0 safe, 1 warn, 2 drop");
    describe_gauge!(DOS_TRACKED_SOURCES, "Source addresses with a live activity window");
}

pub fn record_verdict(action: Action) {
    counter!(PACKETS_TOTAL, 1, LABEL_VERDICT => action.as_str());
}

pub fn record_malformed() {
    increment_counter!(MALFORMED_PACKETS_TOTAL);
}

pub fn record_forced_drop() {
    increment_counter!(DOS_FORCED_DROPS_TOTAL);
}

pub fn record_dos_state(state: DosState) {
    gauge!(DOS_STATE, state as u8 as f64);
}

pub fn record_tracked_sources(count: usize) {
    gauge!(DOS_TRACKED_SOURCES, count as f64);
}
