//! Configuration management for the firewall.
//!
//! This module loads the application configuration from an optional TOML
//! file and `FIREWALL__*` environment variables, on top of built-in defaults.

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::Config;

const DEFAULT_CONFIG_FILE: &str = "config/firewall.toml";

/// Load configuration from the config file and environment variables
///
/// The file named by `CONFIG_FILE` (default `config/firewall.toml`) is
/// optional. Environment variables use the `FIREWALL` prefix and `__` as the
/// section separator, e.g. `FIREWALL__QUEUE__NUM=3`.
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    build(&config_file)?.try_deserialize()
}

fn build(config_file: &str) -> Result<ConfigBuilder, ConfigError> {
    ConfigBuilder::builder()
        .set_default("queue.num", 1)?
        .set_default("storage.rules_file", "rules.json")?
        .set_default("storage.dos_config_file", "dos_config.json")?
        .set_default("storage.dos_state_file", "dos_state.json")?
        .set_default("log.backend", "file")?
        .set_default("log.path", "firewall_log.jsonl")?
        .set_default("log.redis_url", "redis://127.0.0.1:6379")?
        .set_default("log.redis_key", "firewall:logs")?
        .set_default("log.max_entries", 0)?
        .set_default("engine.failure_policy", "open")?
        .set_default("engine.rule_reload_interval_ms", 0)?
        .set_default("engine.source_idle_secs", 60)?
        .set_default("engine.max_tracked_sources", 65_536)?
        .set_default("metrics.enabled", false)?
        .set_default("metrics.listen", "127.0.0.1:9898")?
        .add_source(File::with_name(config_file).required(false))
        .add_source(Environment::with_prefix("FIREWALL").separator("__").try_parsing(true))
        .build()
}
