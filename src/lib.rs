//! Userspace NFQUEUE firewall.
//!
//! Packets handed over by the kernel packet queue are classified, checked
//! against a per-source DoS sliding window and decided ACCEPT or DROP by an
//! ordered rule list. Rules and DoS thresholds are read from files maintained
//! by an external administrative interface.

pub mod config;
pub mod core;
pub mod error;
pub mod models;
pub mod queue;
pub mod storage;
pub mod utils;

pub use crate::core::orchestrator::{Decision, Orchestrator, PacketHandle};
pub use crate::error::FirewallError;
