//! Per-packet decision pipeline.
//!
//! The orchestrator classifies a queued packet, runs the DoS detector and,
//! unless the detector forces a drop, the rule engine. It then applies exactly
//! one verdict to the packet and emits at most one log record.

use std::time::Instant;

use log::{debug, warn};

use crate::core::classifier::classify;
use crate::core::dos_detector::{DosDetector, DosStateCell, DosVerdict};
use crate::core::monitoring;
use crate::core::rule_engine::{Action, RuleEngine};
use crate::storage::{LogRecord, LogSink};
use crate::utils::Clock;

const NOTE_SEPARATOR: &str = " | ";

/// A packet held by the kernel queue until a verdict is given
///
/// `accept` and `drop_packet` release the packet immediately; the
/// orchestrator calls exactly one of them, before any log I/O.
pub trait PacketHandle {
    /// Raw network-layer bytes
    fn payload(&self) -> &[u8];
    /// Let the packet through
    fn accept(&mut self);
    /// Discard the packet
    fn drop_packet(&mut self);
}

/// Verdict for one packet and the record to log for it, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Action,
    pub record: Option<LogRecord>,
}

/// Decision orchestrator
///
/// Owns every piece of per-process state the pipeline needs. Packets are
/// handled one at a time.
pub struct Orchestrator {
    rules: RuleEngine,
    detector: DosDetector,
    log: Box<dyn LogSink + Send>,
    clock: Box<dyn Clock + Send>,
}

impl Orchestrator {
    /// Create a new orchestrator instance
    ///
    /// # Arguments
    ///
    /// * `rules` - Rule engine with its rule store and failure policy
    /// * `detector` - DoS detector with its config store and status sink
    /// * `log` - Sink receiving one record per logged packet
    /// * `clock` - Source of packet arrival times
    pub fn new(
        rules: RuleEngine,
        detector: DosDetector,
        log: Box<dyn LogSink + Send>,
        clock: Box<dyn Clock + Send>,
    ) -> Self {
        Self {
            rules,
            detector,
            log,
            clock,
        }
    }

    /// Handle on the global DoS state
    pub fn dos_state(&self) -> DosStateCell {
        self.detector.state()
    }

    pub fn detector(&self) -> &DosDetector {
        &self.detector
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Publish a SAFE status with the current thresholds
    pub fn reset_status(&mut self) {
        let now = self.clock.now();
        self.detector.reset(now);
    }

    /// Decide a raw packet without applying the verdict or logging it
    pub fn decide(&mut self, raw: &[u8]) -> Decision {
        let now = self.clock.now();
        let pkt = match classify(raw) {
            Ok(pkt) => pkt,
            Err(e) => {
                let verdict = self.rules.policy().fallback_action();
                debug!("{}; applying {}", e, verdict);
                monitoring::record_malformed();
                monitoring::record_verdict(verdict);
                return Decision {
                    verdict,
                    record: None,
                };
            }
        };

        let (verdict, note) = match self.detector.evaluate(&pkt, now) {
            DosVerdict::ForceDrop(reason) => {
                monitoring::record_forced_drop();
                (Action::Drop, reason)
            }
            dos => {
                let decision = self.rules.evaluate(&pkt, now);
                (decision.action, compose_note(&decision.reason, dos.note()))
            }
        };
        monitoring::record_verdict(verdict);

        let record = if self.log.is_exempt(&pkt.destination) {
            None
        } else {
            Some(LogRecord::new(verdict, &pkt, note))
        };
        Decision { verdict, record }
    }

    /// Decide a queued packet, release it with its verdict, then log it
    pub fn handle<P: PacketHandle + ?Sized>(&mut self, packet: &mut P) -> Action {
        let decision = self.decide(packet.payload());
        match decision.verdict {
            Action::Accept => packet.accept(),
            Action::Drop => packet.drop_packet(),
        }
        self.emit(decision.record);
        decision.verdict
    }

    /// Decide and log a raw packet that has no queue handle
    pub fn handle_raw(&mut self, raw: &[u8]) -> Action {
        let decision = self.decide(raw);
        self.emit(decision.record);
        decision.verdict
    }

    fn emit(&mut self, record: Option<LogRecord>) {
        let Some(record) = record else {
            return;
        };
        if let Err(e) = self.log.record(&record) {
            warn!("Failed to log verdict for {} -> {}: {}", record.src, record.dst, e);
        }
    }
}

/// Append the DoS note to the rule reason, trimming dangling separators
///
/// Without a DoS note the rule reason is kept as is.
fn compose_note(reason: &str, dos_note: Option<&str>) -> String {
    match dos_note {
        Some(note) => format!("{}{}{}", reason, NOTE_SEPARATOR, note)
            .trim_matches(|c| c == ' ' || c == '|')
            .to_string(),
        None => reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::{build, Protocol};
    use crate::core::dos_detector::{DetectorLimits, DosState};
    use crate::core::rule_engine::{FailurePolicy, Filter, Rule, FALLBACK_ACCEPT_REASON};
    use crate::storage::{MemoryDosConfigStore, MemoryRuleStore, MockLogSink, MockStatusSink, SinkError};
    use crate::utils::ManualClock;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn tcp(dst: Ipv4Addr, dport: u16) -> Vec<u8> {
        build::ipv4(6, CLIENT, dst, &build::tcp(40000, dport))
    }

    fn udp(dport: u16) -> Vec<u8> {
        build::ipv4(17, CLIENT, SERVER, &build::udp(40000, dport))
    }

    fn ssh_rules() -> Vec<Rule> {
        vec![
            Rule {
                id: 1,
                action: Action::Drop,
                protocol: Filter::Exact(Protocol::Tcp),
                source: Filter::Any,
                destination: Filter::Any,
                destination_port: Filter::Exact(22),
                comment: "Block SSH".to_string(),
            },
            Rule {
                id: 2,
                action: Action::Accept,
                protocol: Filter::Any,
                source: Filter::Any,
                destination: Filter::Any,
                destination_port: Filter::Any,
                comment: "Allow rest".to_string(),
            },
        ]
    }

    fn loopback_exempt_sink() -> MockLogSink {
        let mut log = MockLogSink::new();
        log.expect_is_exempt().returning(|dst| dst.is_loopback());
        log
    }

    fn orchestrator(
        rules: Option<Vec<Rule>>,
        policy: FailurePolicy,
        log: MockLogSink,
        clock: ManualClock,
    ) -> Orchestrator {
        let mut status = MockStatusSink::new();
        status.expect_publish().returning(|_| Ok(()));
        let engine = RuleEngine::new(
            Box::new(MemoryRuleStore::new(rules)),
            Duration::ZERO,
            policy,
        );
        let detector = DosDetector::new(
            Box::new(MemoryDosConfigStore::with_thresholds(10, 20)),
            Box::new(status),
            DetectorLimits::default(),
        );
        Orchestrator::new(engine, detector, Box::new(log), Box::new(clock))
    }

    #[derive(Default)]
    struct QueuedPacket {
        payload: Vec<u8>,
        accepted: usize,
        dropped: usize,
    }

    impl PacketHandle for QueuedPacket {
        fn payload(&self) -> &[u8] {
            &self.payload
        }

        fn accept(&mut self) {
            self.accepted += 1;
        }

        fn drop_packet(&mut self) {
            self.dropped += 1;
        }
    }

    #[test]
    fn test_rule_verdicts() {
        let mut orch = orchestrator(
            Some(ssh_rules()),
            FailurePolicy::Open,
            loopback_exempt_sink(),
            ManualClock::default(),
        );

        let ssh = orch.decide(&tcp(SERVER, 22));
        assert_eq!(ssh.verdict, Action::Drop);
        let record = ssh.record.unwrap();
        assert_eq!(record.note, "Block SSH");
        assert_eq!(record.proto, Protocol::Tcp);
        assert_eq!(record.dport, Some(22));

        let http = orch.decide(&tcp(SERVER, 80));
        assert_eq!(http.verdict, Action::Accept);
        assert_eq!(http.record.unwrap().note, "Allow rest");
    }

    #[test]
    fn test_handle_applies_one_verdict_then_logs() {
        let mut log = loopback_exempt_sink();
        log.expect_record()
            .withf(|r| r.verdict == Action::Drop && r.note == "Block SSH")
            .times(1)
            .returning(|_| Ok(()));
        let mut orch = orchestrator(Some(ssh_rules()), FailurePolicy::Open, log, ManualClock::default());

        let mut packet = QueuedPacket {
            payload: tcp(SERVER, 22),
            ..QueuedPacket::default()
        };
        assert_eq!(orch.handle(&mut packet), Action::Drop);
        assert_eq!((packet.accepted, packet.dropped), (0, 1));
    }

    struct OrderedPacket {
        payload: Vec<u8>,
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl PacketHandle for OrderedPacket {
        fn payload(&self) -> &[u8] {
            &self.payload
        }

        fn accept(&mut self) {
            self.events.lock().unwrap().push("accept");
        }

        fn drop_packet(&mut self) {
            self.events.lock().unwrap().push("drop");
        }
    }

    #[test]
    fn test_verdict_is_released_before_logging() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let logged = events.clone();
        let mut log = loopback_exempt_sink();
        log.expect_record().times(2).returning(move |_| {
            logged.lock().unwrap().push("log");
            Ok(())
        });
        let mut orch = orchestrator(Some(ssh_rules()), FailurePolicy::Open, log, ManualClock::default());

        let mut ssh = OrderedPacket {
            payload: tcp(SERVER, 22),
            events: events.clone(),
        };
        orch.handle(&mut ssh);
        let mut web = OrderedPacket {
            payload: tcp(SERVER, 80),
            events: events.clone(),
        };
        orch.handle(&mut web);

        assert_eq!(*events.lock().unwrap(), vec!["drop", "log", "accept", "log"]);
    }

    #[test]
    fn test_malformed_packet_fails_open_without_log() {
        let mut log = MockLogSink::new();
        log.expect_is_exempt().times(0);
        log.expect_record().times(0);
        let mut orch = orchestrator(Some(ssh_rules()), FailurePolicy::Open, log, ManualClock::default());

        let mut packet = QueuedPacket {
            payload: vec![0x45, 0x00],
            ..QueuedPacket::default()
        };
        assert_eq!(orch.handle(&mut packet), Action::Accept);
        assert_eq!((packet.accepted, packet.dropped), (1, 0));
        assert_eq!(orch.detector().tracked_sources(), 0);
    }

    #[test]
    fn test_malformed_packet_fails_closed() {
        let mut orch = orchestrator(None, FailurePolicy::Closed, MockLogSink::new(), ManualClock::default());
        assert_eq!(orch.decide(&[]), Decision { verdict: Action::Drop, record: None });
    }

    #[test]
    fn test_dos_warning_is_appended_to_note() {
        let mut orch = orchestrator(
            None,
            FailurePolicy::Open,
            loopback_exempt_sink(),
            ManualClock::default(),
        );

        for _ in 0..9 {
            let decision = orch.decide(&udp(53));
            assert_eq!(decision.record.unwrap().note, FALLBACK_ACCEPT_REASON);
        }
        let decision = orch.decide(&udp(53));
        assert_eq!(decision.verdict, Action::Accept);
        assert_eq!(
            decision.record.unwrap().note,
            "fallback accept | DoS warning (10/5s)"
        );
        assert_eq!(orch.dos_state().get(), DosState::Warn);
    }

    #[test]
    fn test_forced_drop_bypasses_rules() {
        let clock = ManualClock::default();
        let mut orch = orchestrator(
            Some(ssh_rules()),
            FailurePolicy::Open,
            loopback_exempt_sink(),
            clock.clone(),
        );

        for _ in 0..19 {
            assert_eq!(orch.decide(&udp(53)).verdict, Action::Accept);
        }
        let triggered = orch.decide(&udp(53));
        assert_eq!(triggered.verdict, Action::Drop);
        assert_eq!(triggered.record.unwrap().note, "DoS temp-drop triggered (20/5s)");

        clock.advance(Duration::from_secs(1));
        let active = orch.decide(&tcp(SERVER, 80));
        assert_eq!(active.verdict, Action::Drop);
        assert_eq!(active.record.unwrap().note, "DoS temp-drop active (9s left)");

        clock.advance(Duration::from_secs(9));
        assert_eq!(orch.decide(&tcp(SERVER, 80)).verdict, Action::Accept);
    }

    #[test]
    fn test_loopback_is_never_logged() {
        let mut log = loopback_exempt_sink();
        log.expect_record().times(0);
        let mut orch = orchestrator(Some(ssh_rules()), FailurePolicy::Open, log, ManualClock::default());

        assert_eq!(orch.handle_raw(&tcp(Ipv4Addr::LOCALHOST, 22)), Action::Drop);
        for _ in 0..50 {
            assert_eq!(orch.handle_raw(&tcp(Ipv4Addr::LOCALHOST, 80)), Action::Accept);
        }
        assert_eq!(orch.detector().tracked_sources(), 0);
        assert!(!orch.detector().is_blocked(&IpAddr::V4(CLIENT), orch.now()));
    }

    #[test]
    fn test_log_failure_does_not_change_verdict() {
        let mut log = loopback_exempt_sink();
        log.expect_record()
            .returning(|_| Err(SinkError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))));
        let mut orch = orchestrator(Some(ssh_rules()), FailurePolicy::Open, log, ManualClock::default());

        let mut packet = QueuedPacket {
            payload: tcp(SERVER, 22),
            ..QueuedPacket::default()
        };
        assert_eq!(orch.handle(&mut packet), Action::Drop);
        assert_eq!(packet.dropped, 1);
    }

    #[test]
    fn test_compose_note() {
        assert_eq!(compose_note("Block SSH", None), "Block SSH");
        assert_eq!(compose_note("Block SSH", Some("DoS warning (60/5s)")), "Block SSH | DoS warning (60/5s)");
        assert_eq!(compose_note("", Some("DoS warning (60/5s)")), "DoS warning (60/5s)");
        assert_eq!(compose_note("", None), "");
        assert_eq!(compose_note(" ssh | legacy |", None), " ssh | legacy |");
    }
}
