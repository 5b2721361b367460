//! Core functionality for the firewall.
//!
//! This module contains the per-packet decision pipeline: packet
//! classification, the ordered rule engine, the DoS detector and the
//! orchestrator tying them together, plus metrics recording.

pub mod classifier;
pub mod dos_detector;
pub mod monitoring;
pub mod orchestrator;
pub mod rule_engine;

pub use classifier::{classify, ClassifyError, PacketDescriptor, Protocol};
pub use dos_detector::{DetectorLimits, DosConfig, DosDetector, DosState, DosStateCell, DosVerdict};
pub use orchestrator::{Decision, Orchestrator, PacketHandle};
pub use rule_engine::{decide, Action, FailurePolicy, Filter, Rule, RuleDecision, RuleEngine};
