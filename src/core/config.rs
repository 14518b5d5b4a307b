//! Configuration handling.
//!
//! Configuration is a flat `key=value` file. Any key may be overridden on
//! the command line as `-Dkey=value`, or `-Dkey` as shorthand for
//! `-Dkey=true`. Unrecognized keys are kept so that adapters can consume
//! keys this module does not know about.

use crate::core::error::{HtracedError, Result};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const WEB_ADDRESS: &str = "web.address";
pub const HRPC_ADDRESS: &str = "hrpc.address";
pub const DATA_STORE_DIRECTORIES: &str = "data.store.directories";
pub const DATA_STORE_CLEAR: &str = "data.store.clear";
pub const WRITER_QUEUE_CAPACITY: &str = "writer.queue.capacity";
pub const WRITER_BATCH_MAX_SPANS: &str = "writer.batch.max.spans";
pub const WRITER_FLUSH_INTERVAL_MS: &str = "writer.flush.interval.ms";
pub const METRICS_HEARTBEAT_PERIOD_MS: &str = "metrics.heartbeat.period.ms";
pub const METRICS_MAX_ADDR_ENTRIES: &str = "metrics.max.addr.entries";
pub const DATASTORE_HEARTBEAT_PERIOD_MS: &str = "datastore.heartbeat.period.ms";
pub const QUERY_TIMEOUT_MS: &str = "query.timeout.ms";
pub const QUERY_DEFAULT_LIMIT: &str = "query.default.limit";
pub const SPAN_RECEIVERS: &str = "span.receivers";
pub const LOG_LEVEL: &str = "log.level";
pub const STARTUP_NOTIFICATION_ADDRESS: &str = "startup.notification.address";

/// Separator between entries of path-list values.
pub const PATH_LIST_SEPARATOR: char = ';';

/// Flat daemon configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a `key=value` configuration body. Blank lines and lines
    /// starting with `#` are ignored.
    pub fn parse(body: &str) -> Result<Self> {
        let mut config = Config::new();
        for (line_number, raw) in body.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                HtracedError::config(format!(
                    "Line {}: expected key=value, got '{}'",
                    line_number + 1,
                    line
                ))
            })?;
            config.set(key.trim(), value.trim());
        }
        Ok(config)
    }

    /// Loads a configuration file from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path).map_err(|e| {
            HtracedError::config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::parse(&body)
    }

    /// Applies command-line defines of the form `key=value` or bare `key`
    /// (which reads as `key=true`). These win over the file.
    pub fn apply_defines<I, S>(&mut self, defines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for define in defines {
            let define = define.as_ref();
            match define.split_once('=') {
                Some((key, value)) => self.set(key.trim(), value.trim()),
                None => self.set(define.trim(), "true"),
            }
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn get_or(&self, key: &str, default: &'static str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                HtracedError::config(format!("{}: expected an integer, got '{}'", key, raw))
            }),
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(raw) => Err(HtracedError::config(format!(
                "{}: expected true or false, got '{}'",
                key, raw
            ))),
        }
    }

    pub fn web_address(&self) -> String {
        self.get_or(WEB_ADDRESS, "127.0.0.1:9096")
    }

    pub fn hrpc_address(&self) -> String {
        self.get_or(HRPC_ADDRESS, "127.0.0.1:9075")
    }

    /// Shard directories, in configuration order. Load reorders by the
    /// persisted shard index, so this order carries no meaning beyond
    /// naming the set.
    pub fn data_store_directories(&self) -> Vec<String> {
        self.get(DATA_STORE_DIRECTORIES)
            .unwrap_or("")
            .split(PATH_LIST_SEPARATOR)
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn data_store_clear(&self) -> Result<bool> {
        self.get_bool(DATA_STORE_CLEAR, false)
    }

    pub fn writer_queue_capacity(&self) -> Result<usize> {
        Ok(self.get_u64(WRITER_QUEUE_CAPACITY, 1024)? as usize)
    }

    pub fn writer_batch_max_spans(&self) -> Result<usize> {
        Ok(self.get_u64(WRITER_BATCH_MAX_SPANS, 128)? as usize)
    }

    pub fn writer_flush_interval(&self) -> Result<Duration> {
        Ok(Duration::from_millis(self.get_u64(WRITER_FLUSH_INTERVAL_MS, 50)?))
    }

    pub fn metrics_heartbeat_period(&self) -> Result<Duration> {
        Ok(Duration::from_millis(self.get_u64(METRICS_HEARTBEAT_PERIOD_MS, 45_000)?))
    }

    pub fn metrics_max_addr_entries(&self) -> Result<usize> {
        Ok(self.get_u64(METRICS_MAX_ADDR_ENTRIES, 2)? as usize)
    }

    pub fn datastore_heartbeat_period(&self) -> Result<Duration> {
        Ok(Duration::from_millis(self.get_u64(DATASTORE_HEARTBEAT_PERIOD_MS, 45_000)?))
    }

    pub fn query_timeout(&self) -> Result<Duration> {
        Ok(Duration::from_millis(self.get_u64(QUERY_TIMEOUT_MS, 30_000)?))
    }

    pub fn query_default_limit(&self) -> Result<usize> {
        Ok(self.get_u64(QUERY_DEFAULT_LIMIT, 100)? as usize)
    }

    /// Extra span receiver identifiers to register, `;`-separated.
    pub fn span_receivers(&self) -> Vec<String> {
        self.get(SPAN_RECEIVERS)
            .unwrap_or("")
            .split(PATH_LIST_SEPARATOR)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn log_level(&self) -> String {
        self.get_or(LOG_LEVEL, "info")
    }

    pub fn startup_notification_address(&self) -> Option<String> {
        self.get(STARTUP_NOTIFICATION_ADDRESS)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
    }

    /// Checks the values this module knows how to interpret.
    pub fn validate(&self) -> Result<()> {
        self.data_store_clear()?;
        self.writer_queue_capacity()?;
        self.writer_batch_max_spans()?;
        self.writer_flush_interval()?;
        self.metrics_heartbeat_period()?;
        self.metrics_max_addr_entries()?;
        self.datastore_heartbeat_period()?;
        self.query_timeout()?;
        self.query_default_limit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_basic_file() {
        let config = Config::parse(
            "# htraced config\n\
             web.address=0.0.0.0:8080\n\
             \n\
             data.store.directories=/a;/b\n\
             data.store.clear=true\n",
        )
        .unwrap();
        assert_eq!(config.web_address(), "0.0.0.0:8080");
        assert_eq!(config.data_store_directories(), vec!["/a", "/b"]);
        assert!(config.data_store_clear().unwrap());
    }

    #[test]
    fn test_parse_rejects_missing_equals() {
        let err = Config::parse("web.address").unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.web_address(), "127.0.0.1:9096");
        assert_eq!(config.hrpc_address(), "127.0.0.1:9075");
        assert_eq!(config.metrics_max_addr_entries().unwrap(), 2);
        assert_eq!(config.writer_queue_capacity().unwrap(), 1024);
        assert_eq!(config.writer_batch_max_spans().unwrap(), 128);
        assert_eq!(config.writer_flush_interval().unwrap(), Duration::from_millis(50));
        assert!(config.data_store_directories().is_empty());
        assert!(config.startup_notification_address().is_none());
    }

    #[test]
    fn test_defines_override_file() {
        let mut config = Config::parse("log.level=info\n").unwrap();
        config.apply_defines(["log.level=debug", "data.store.clear"]);
        assert_eq!(config.log_level(), "debug");
        assert!(config.data_store_clear().unwrap());
    }

    #[test]
    fn test_bad_integer_is_config_error() {
        let config = Config::parse("writer.queue.capacity=lots\n").unwrap();
        assert!(config.writer_queue_capacity().is_err());
        assert!(config.validate().is_err());
    }
}
