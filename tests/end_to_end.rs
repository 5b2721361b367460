use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use nfq_firewall::core::classifier::build;
use nfq_firewall::core::dos_detector::{DetectorLimits, DosDetector, DosState};
use nfq_firewall::core::rule_engine::{Action, FailurePolicy, RuleEngine};
use nfq_firewall::storage::{
    JsonFileDosConfigStore, JsonFileRuleStore, JsonFileStatusSink, LogRecord, LogSink, SinkError,
};
use nfq_firewall::utils::ManualClock;
use nfq_firewall::Orchestrator;

const CLIENT: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);
const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

#[derive(Clone, Default)]
struct RecordingLog {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl RecordingLog {
    fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl LogSink for RecordingLog {
    fn record(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

struct Firewall {
    orchestrator: Orchestrator,
    log: RecordingLog,
    clock: ManualClock,
}

fn firewall(dir: &Path, rules: &str) -> Firewall {
    fs::write(dir.join("rules.json"), rules).unwrap();
    fs::write(dir.join("dos_config.json"), r#"{"warn_5s": 50, "drop_5s": 110}"#).unwrap();

    let log = RecordingLog::default();
    let clock = ManualClock::default();
    let engine = RuleEngine::new(
        Box::new(JsonFileRuleStore::new(dir.join("rules.json"))),
        Duration::ZERO,
        FailurePolicy::Open,
    );
    let detector = DosDetector::new(
        Box::new(JsonFileDosConfigStore::new(dir.join("dos_config.json"))),
        Box::new(JsonFileStatusSink::new(dir.join("dos_state.json"))),
        DetectorLimits::default(),
    );
    let orchestrator = Orchestrator::new(engine, detector, Box::new(log.clone()), Box::new(clock.clone()));
    Firewall {
        orchestrator,
        log,
        clock,
    }
}

fn tcp(dst: Ipv4Addr, dport: u16) -> Vec<u8> {
    build::ipv4(6, CLIENT, dst, &build::tcp(51000, dport))
}

fn udp(dport: u16) -> Vec<u8> {
    build::ipv4(17, CLIENT, SERVER, &build::udp(51000, dport))
}

fn status(dir: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(dir.join("dos_state.json")).unwrap()).unwrap()
}

const SSH_RULES: &str = r#"[
    {"id": 1, "action": "DROP", "proto": "tcp", "src": "any", "dst": "any", "dport": 22, "comment": "Block SSH"},
    {"id": 2, "action": "ACCEPT", "proto": "any", "src": "any", "dst": "any", "dport": "any", "comment": ""}
]"#;

#[test]
fn ssh_is_blocked_and_web_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let mut fw = firewall(dir.path(), SSH_RULES);

    assert_eq!(fw.orchestrator.handle_raw(&tcp(SERVER, 22)), Action::Drop);
    assert_eq!(fw.orchestrator.handle_raw(&tcp(SERVER, 80)), Action::Accept);

    let records = fw.log.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].verdict, Action::Drop);
    assert_eq!(records[0].note, "Block SSH");
    assert_eq!(records[0].src, IpAddr::V4(CLIENT));
    assert_eq!(records[0].dport, Some(22));
    assert_eq!(records[1].verdict, Action::Accept);
}

#[test]
fn unmatched_packet_falls_back_to_accept() {
    let dir = tempfile::tempdir().unwrap();
    let mut fw = firewall(
        dir.path(),
        r#"[{"id": 1, "action": "DROP", "proto": "tcp", "dport": "22", "comment": "Block SSH"}]"#,
    );

    assert_eq!(fw.orchestrator.handle_raw(&tcp(SERVER, 80)), Action::Accept);
    assert_eq!(fw.log.records()[0].note, "fallback accept");
}

#[test]
fn udp_flood_triggers_temp_block() {
    let dir = tempfile::tempdir().unwrap();
    let mut fw = firewall(dir.path(), SSH_RULES);

    for _ in 0..109 {
        fw.clock.advance(Duration::from_millis(10));
        assert_eq!(fw.orchestrator.handle_raw(&udp(53)), Action::Accept);
    }
    assert_eq!(fw.orchestrator.dos_state().get(), DosState::Warn);

    fw.clock.advance(Duration::from_millis(10));
    assert_eq!(fw.orchestrator.handle_raw(&udp(53)), Action::Drop);
    assert!(fw.orchestrator.detector().is_blocked(&IpAddr::V4(CLIENT), fw.orchestrator.now()));

    for _ in 0..2 {
        fw.clock.advance(Duration::from_millis(10));
        assert_eq!(fw.orchestrator.handle_raw(&udp(53)), Action::Drop);
    }

    let records = fw.log.records();
    assert_eq!(records.len(), 112);
    assert_eq!(records[49].note, "DoS warning (50/5s)");
    assert_eq!(records[109].note, "DoS temp-drop triggered (110/5s)");
    assert!(records[110].note.starts_with("DoS temp-drop active"));
    assert!(records[111].note.starts_with("DoS temp-drop active"));

    let status = status(dir.path());
    assert_eq!(status["state"], "drop");
    assert_eq!(status["src"], CLIENT.to_string());
    assert!(status.get("rate_5s").is_none());
    assert_eq!(status["warn_5s"], 50);
    assert_eq!(status["drop_5s"], 110);
}

#[test]
fn temp_block_expires() {
    let dir = tempfile::tempdir().unwrap();
    let mut fw = firewall(dir.path(), SSH_RULES);

    for _ in 0..110 {
        fw.orchestrator.handle_raw(&udp(53));
    }
    assert_eq!(fw.orchestrator.handle_raw(&udp(53)), Action::Drop);

    fw.clock.advance(Duration::from_secs(10));
    assert_eq!(fw.orchestrator.handle_raw(&udp(53)), Action::Accept);

    let status = status(dir.path());
    assert_eq!(status["state"], "safe");
    assert_eq!(status["rate_5s"], 1);
}

#[test]
fn loopback_traffic_is_never_logged_or_counted() {
    let dir = tempfile::tempdir().unwrap();
    let mut fw = firewall(dir.path(), SSH_RULES);

    assert_eq!(fw.orchestrator.handle_raw(&tcp(Ipv4Addr::LOCALHOST, 22)), Action::Drop);
    for _ in 0..500 {
        assert_eq!(fw.orchestrator.handle_raw(&tcp(Ipv4Addr::LOCALHOST, 80)), Action::Accept);
    }

    assert!(fw.log.records().is_empty());
    assert_eq!(fw.orchestrator.detector().tracked_sources(), 0);
    assert_eq!(fw.orchestrator.dos_state().get(), DosState::Safe);
    assert!(!dir.path().join("dos_state.json").exists());
}

#[test]
fn corrupt_rule_file_keeps_previous_rules() {
    let dir = tempfile::tempdir().unwrap();
    let mut fw = firewall(dir.path(), SSH_RULES);
    assert_eq!(fw.orchestrator.handle_raw(&tcp(SERVER, 22)), Action::Drop);

    let path = dir.path().join("rules.json");
    fs::write(&path, r#"[{"id": 1, "action": "DR"#).unwrap();
    let file = fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();

    assert_eq!(fw.orchestrator.handle_raw(&tcp(SERVER, 22)), Action::Drop);
}

#[test]
fn unparseable_rule_does_not_disable_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let mut fw = firewall(
        dir.path(),
        r#"[{"id":1,"action":"DROP","src":"10.0.0.0/24"},{"id":2,"action":"DROP","comment":"Default deny"}]"#,
    );

    assert_eq!(fw.orchestrator.handle_raw(&tcp(SERVER, 80)), Action::Drop);
    assert_eq!(fw.log.records()[0].note, "Default deny");
}

#[test]
fn malformed_packets_are_accepted_silently() {
    let dir = tempfile::tempdir().unwrap();
    let mut fw = firewall(dir.path(), r#"[{"id": 1, "action": "DROP"}]"#);

    assert_eq!(fw.orchestrator.handle_raw(&[0x45, 0, 0]), Action::Accept);
    assert_eq!(fw.orchestrator.handle_raw(&[0x70; 40]), Action::Accept);
    assert!(fw.log.records().is_empty());
}
