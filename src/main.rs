//! NFQUEUE firewall
//!
//! This is the main entry point for the firewall. It loads the configuration,
//! wires the rule and DoS stores, sinks and orchestrator together and runs the
//! packet queue dispatch loop until interrupted.

use std::thread;
use std::time::Duration;

use anyhow::Context;
use dotenv::dotenv;
use log::{error, info};
use tokio::sync::oneshot;

use nfq_firewall::config;
use nfq_firewall::core::dos_detector::{DetectorLimits, DosDetector};
use nfq_firewall::core::monitoring;
use nfq_firewall::core::rule_engine::RuleEngine;
use nfq_firewall::models::{Config, LogBackend};
use nfq_firewall::queue;
use nfq_firewall::storage::{
    JsonFileDosConfigStore, JsonFileRuleStore, JsonFileStatusSink, JsonLinesLogSink, LogSink,
    RedisLogSink,
};
use nfq_firewall::utils::SystemClock;
use nfq_firewall::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting NFQUEUE firewall...");

    let config = config::load_config().context("Failed to load configuration")?;

    if config.metrics.enabled {
        monitoring::install_exporter(config.metrics.listen)
            .context("Failed to start metrics exporter")?;
    }

    let mut orchestrator = build_orchestrator(&config)?;
    orchestrator.reset_status();
    info!(
        "Rules from {}, DoS thresholds from {}, failure policy {:?}",
        config.storage.rules_file.display(),
        config.storage.dos_config_file.display(),
        config.engine.failure_policy
    );

    // The dispatch loop blocks on the kernel queue, so it gets its own thread.
    let queue_num = config.queue.num;
    let (done_tx, done_rx) = oneshot::channel();
    thread::Builder::new()
        .name("nfqueue".to_string())
        .spawn(move || {
            let result = queue::run(queue_num, &mut orchestrator);
            let _ = done_tx.send(result);
        })
        .context("Failed to spawn dispatch thread")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutting down");
        }
        result = done_rx => match result {
            Ok(Ok(())) => info!("Packet queue closed"),
            Ok(Err(e)) => {
                error!("Packet queue stopped: {}", e);
                return Err(e).context(format!("NFQUEUE {} unavailable", queue_num));
            }
            Err(_) => anyhow::bail!("Dispatch thread exited unexpectedly"),
        },
    }

    Ok(())
}

fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let rules = RuleEngine::new(
        Box::new(JsonFileRuleStore::new(&config.storage.rules_file)),
        Duration::from_millis(config.engine.rule_reload_interval_ms),
        config.engine.failure_policy,
    );

    let detector = DosDetector::new(
        Box::new(JsonFileDosConfigStore::new(&config.storage.dos_config_file)),
        Box::new(JsonFileStatusSink::new(&config.storage.dos_state_file)),
        DetectorLimits {
            source_idle: Duration::from_secs(config.engine.source_idle_secs),
            max_tracked_sources: config.engine.max_tracked_sources,
            ..DetectorLimits::default()
        },
    );

    let log: Box<dyn LogSink + Send> = match config.log.backend {
        LogBackend::File => Box::new(JsonLinesLogSink::new(&config.log.path)),
        LogBackend::Redis => Box::new(
            RedisLogSink::new(&config.log.redis_url, &config.log.redis_key, config.log.max_entries)
                .context("Failed to create Redis log sink")?,
        ),
    };

    Ok(Orchestrator::new(rules, detector, log, Box::new(SystemClock)))
}
