use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use redis::Commands;
use serde::{Deserialize, Serialize};

use super::SinkError;
use crate::core::classifier::{PacketDescriptor, Protocol};
use crate::core::rule_engine::Action;

/// Redis connect/read/write timeout; the packet path must never stall on the sink
const REDIS_TIMEOUT: Duration = Duration::from_millis(250);

/// One verdict record, as stored for later inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub verdict: Action,
    pub proto: Protocol,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
    pub note: String,
}

impl LogRecord {
    pub fn new(verdict: Action, pkt: &PacketDescriptor, note: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            verdict,
            proto: pkt.protocol,
            src: pkt.source,
            dst: pkt.destination,
            sport: pkt.source_port,
            dport: pkt.destination_port,
            note: note.into(),
        }
    }
}

/// Append-only verdict log
#[cfg_attr(test, mockall::automock)]
pub trait LogSink {
    /// Append one record
    fn record(&mut self, record: &LogRecord) -> Result<(), SinkError>;

    /// Whether packets to this destination are never persisted
    ///
    /// Loopback traffic is exempt so local management traffic stays out of the log.
    fn is_exempt(&self, destination: &IpAddr) -> bool {
        destination.is_loopback()
    }
}

/// Log sink appending one JSON object per line to a file
pub struct JsonLinesLogSink {
    path: PathBuf,
    file: Option<File>,
}

impl JsonLinesLogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    fn file(&mut self) -> Result<&mut File, SinkError> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
                info!("Writing verdict log to {}", self.path.display());
                file
            }
        };
        Ok(self.file.insert(file))
    }
}

impl LogSink for JsonLinesLogSink {
    fn record(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let result = self.file()?.write_all(&line);
        if result.is_err() {
            // Reopen on the next record, e.g. after log rotation.
            self.file = None;
        }
        result.map_err(SinkError::from)
    }
}

/// Log sink pushing JSON records onto a Redis list
pub struct RedisLogSink {
    client: redis::Client,
    connection: Option<redis::Connection>,
    key: String,
    max_entries: usize,
}

impl RedisLogSink {
    /// Create a new Redis log sink
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL
    /// * `key` - List the records are appended to
    /// * `max_entries` - Trim the list to this many newest records; zero keeps everything
    pub fn new(url: &str, key: impl Into<String>, max_entries: usize) -> Result<Self, SinkError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            connection: None,
            key: key.into(),
            max_entries,
        })
    }

    fn push(&mut self, payload: &str) -> Result<(), SinkError> {
        let conn = match self.connection.take() {
            Some(conn) => conn,
            None => {
                let conn = self.client.get_connection_with_timeout(REDIS_TIMEOUT)?;
                conn.set_read_timeout(Some(REDIS_TIMEOUT))?;
                conn.set_write_timeout(Some(REDIS_TIMEOUT))?;
                conn
            }
        };
        let conn = self.connection.insert(conn);

        let _: () = conn.rpush(&self.key, payload)?;
        if self.max_entries > 0 {
            let keep = -(self.max_entries as isize);
            let _: () = conn.ltrim(&self.key, keep, -1)?;
        }
        Ok(())
    }
}

impl LogSink for RedisLogSink {
    fn record(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        let payload = serde_json::to_string(record)?;
        let result = self.push(&payload);
        if result.is_err() {
            self.connection = None;
        }
        result
    }
}
