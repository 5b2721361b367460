//! Ordered rule engine for the firewall.
//!
//! This module holds the ordered rule list and returns a verdict plus a
//! human-readable reason for each classified packet. Rule priority is the
//! stored order and nothing else: the first matching rule wins.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::classifier::{PacketDescriptor, Protocol};
use crate::storage::{RuleLoad, RuleStore};

/// Reason attached to the implicit verdict when no rule matches
pub const FALLBACK_ACCEPT_REASON: &str = "fallback accept";
/// Reason attached to the implicit verdict under a fail-closed policy
pub const FALLBACK_DROP_REASON: &str = "fallback drop";

/// Final action applied to a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Action {
    #[default]
    #[serde(rename = "ACCEPT", alias = "accept", alias = "Accept")]
    Accept,
    #[serde(rename = "DROP", alias = "drop", alias = "Drop")]
    Drop,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behaviour when the pipeline cannot reach a normal decision
///
/// `Open` accepts on a malformed packet or an empty rule set, `Closed` drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Open,
    Closed,
}

impl FailurePolicy {
    /// Verdict used when no decision could be reached
    pub fn fallback_action(&self) -> Action {
        match self {
            FailurePolicy::Open => Action::Accept,
            FailurePolicy::Closed => Action::Drop,
        }
    }

    fn fallback_reason(&self) -> &'static str {
        match self {
            FailurePolicy::Open => FALLBACK_ACCEPT_REASON,
            FailurePolicy::Closed => FALLBACK_DROP_REASON,
        }
    }
}

/// A single rule filter field: either a wildcard or one exact value
///
/// In the rule file `"any"`, `null` or a missing field mean [`Filter::Any`].
/// Numbers and strings are both accepted for exact values, so `"dport": 22`
/// and `"dport": "22"` are equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter<T> {
    #[default]
    Any,
    Exact(T),
}

impl<T: PartialEq> Filter<T> {
    /// Whether this filter accepts the given packet field
    ///
    /// An exact filter never matches an absent field.
    pub fn matches(&self, value: Option<&T>) -> bool {
        match self {
            Filter::Any => true,
            Filter::Exact(expected) => value == Some(expected),
        }
    }
}

impl<T: fmt::Display> Serialize for Filter<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Filter::Any => serializer.serialize_str("any"),
            Filter::Exact(value) => serializer.collect_str(value),
        }
    }
}

impl<'de, T> Deserialize<'de> for Filter<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        let text = match Option::<Raw>::deserialize(deserializer)? {
            None => return Ok(Filter::Any),
            Some(Raw::Number(n)) => n.to_string(),
            Some(Raw::Text(s)) => s,
        };
        let text = text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case("any") {
            return Ok(Filter::Any);
        }
        text.parse::<T>()
            .map(Filter::Exact)
            .map_err(|e| D::Error::custom(format!("invalid filter value '{}': {}", text, e)))
    }
}

/// Rule definition
///
/// Field names on the wire follow the rule file maintained by the
/// administrative interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Caller-assigned rule ID, stable across edits
    pub id: u64,
    /// Action applied when the rule matches
    #[serde(default)]
    pub action: Action,
    /// Protocol filter
    #[serde(default, rename = "proto")]
    pub protocol: Filter<Protocol>,
    /// Source address filter
    #[serde(default, rename = "src")]
    pub source: Filter<IpAddr>,
    /// Destination address filter
    #[serde(default, rename = "dst")]
    pub destination: Filter<IpAddr>,
    /// Destination port filter
    #[serde(default, rename = "dport")]
    pub destination_port: Filter<u16>,
    /// Free-form comment, reported as the match reason
    #[serde(default)]
    pub comment: String,
}

impl Rule {
    /// Whether every non-wildcard filter equals the packet's field
    pub fn matches(&self, pkt: &PacketDescriptor) -> bool {
        self.protocol.matches(Some(&pkt.protocol))
            && self.source.matches(Some(&pkt.source))
            && self.destination.matches(Some(&pkt.destination))
            && self.destination_port.matches(pkt.destination_port.as_ref())
    }
}

/// Outcome of rule evaluation for one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDecision {
    /// Action to apply
    pub action: Action,
    /// Comment of the matching rule, or the fallback reason
    pub reason: String,
    /// ID of the matching rule; `None` for the fallback verdict
    pub rule_id: Option<u64>,
}

/// Evaluate an ordered rule list against a packet
///
/// Returns the action and comment of the first matching rule, or ACCEPT with
/// the fixed fallback reason if nothing matches.
pub fn decide(rules: &[Rule], pkt: &PacketDescriptor) -> RuleDecision {
    decide_with_policy(rules, pkt, FailurePolicy::Open)
}

fn decide_with_policy(rules: &[Rule], pkt: &PacketDescriptor, policy: FailurePolicy) -> RuleDecision {
    rules
        .iter()
        .find(|rule| rule.matches(pkt))
        .map(|rule| RuleDecision {
            action: rule.action,
            reason: rule.comment.clone(),
            rule_id: Some(rule.id),
        })
        .unwrap_or_else(|| RuleDecision {
            action: policy.fallback_action(),
            reason: policy.fallback_reason().to_string(),
            rule_id: None,
        })
}

/// Rule engine state
///
/// Owns the rule store and a cache of the last successfully loaded rule list.
/// The cache is refreshed from the store before evaluation once the reload
/// interval has elapsed; a failed refresh keeps the previous list.
pub struct RuleEngine {
    store: Box<dyn RuleStore + Send>,
    rules: Vec<Rule>,
    reload_interval: Duration,
    last_reload: Option<Instant>,
    policy: FailurePolicy,
}

impl RuleEngine {
    /// Create a new rule engine instance
    ///
    /// # Arguments
    ///
    /// * `store` - Source of the persisted rule list
    /// * `reload_interval` - Minimum time between store reads; zero checks before every packet
    /// * `policy` - Failure policy deciding the fallback verdict
    pub fn new(
        store: Box<dyn RuleStore + Send>,
        reload_interval: Duration,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            store,
            rules: Vec::new(),
            reload_interval,
            last_reload: None,
            policy,
        }
    }

    /// Currently cached rules
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Refresh the rule cache if it is stale, then decide the packet
    pub fn evaluate(&mut self, pkt: &PacketDescriptor, now: Instant) -> RuleDecision {
        self.refresh_if_stale(now);
        let decision = decide_with_policy(&self.rules, pkt, self.policy);
        debug!(
            "Rule decision for {} {} -> {}: {} ({:?})",
            pkt.protocol, pkt.source, pkt.destination, decision.action, decision.rule_id
        );
        decision
    }

    /// Reload rules from the store if the reload interval has elapsed
    pub fn refresh_if_stale(&mut self, now: Instant) {
        let stale = match self.last_reload {
            Some(last) => now.saturating_duration_since(last) >= self.reload_interval,
            None => true,
        };
        if stale {
            self.reload();
            self.last_reload = Some(now);
        }
    }

    /// Reload rules from the store unconditionally
    pub fn reload(&mut self) {
        match self.store.load() {
            Ok(RuleLoad::Rules(rules)) => {
                if rules != self.rules {
                    info!("Loaded {} firewall rules", rules.len());
                }
                self.rules = rules;
            }
            Ok(RuleLoad::Unchanged) => {}
            Ok(RuleLoad::Absent) => {
                if !self.rules.is_empty() {
                    info!("Rule store is empty, using {}", self.policy.fallback_reason());
                }
                self.rules.clear();
            }
            Err(e) => {
                warn!(
                    "Rule store unavailable, keeping {} cached rules: {}",
                    self.rules.len(),
                    e
                );
            }
        }
    }
}
