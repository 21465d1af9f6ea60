use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::IngestError;
use crate::event::RawFormat;
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkSelection {
    Csv,
    Store,
    Both,
}

impl SinkSelection {
    pub fn wants_files(&self) -> bool {
        matches!(self, SinkSelection::Csv | SinkSelection::Both)
    }

    pub fn wants_store(&self) -> bool {
        matches!(self, SinkSelection::Store | SinkSelection::Both)
    }
}

impl FromStr for SinkSelection {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" | "file" => Ok(SinkSelection::Csv),
            "store" | "sqlite" | "pg" => Ok(SinkSelection::Store),
            "both" => Ok(SinkSelection::Both),
            other => Err(IngestError::Configuration(format!("unknown sink '{}'", other))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub out_dir_root: PathBuf,
    /// Exact output directory, single-pair mode only
    pub out_dir: Option<PathBuf>,
    pub sink: SinkSelection,
    pub no_write: bool,
    pub color: bool,
    pub raw_format: RawFormat,
    pub subscribe_chunk: usize,
    pub subscribe_pause_ms: u64,
    pub ack_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub reconnect: RetryConfig,
    pub sqlite_path: String,
    pub store_table: String,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub batch_max_retries: u32,
    pub batch_queue_capacity: usize,
    pub hl_root: PathBuf,
    /// Set when the log root was given explicitly; pulls the log source into `--all`
    pub hl_root_explicit: bool,
    pub hl_poll_ms: u64,
    /// Quiet time an old hour file must show before the tailer leaves it
    pub hl_rotate_grace_ms: u64,
    pub hl_cursor_path: Option<PathBuf>,
    pub hl_min_abs_size: f64,
    pub bybit_rest_base: String,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn default_hl_root() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join("hl/data/node_fills_streaming/hourly")
}

impl Config {
    pub fn from_env() -> Self {
        let hl_root_env = std::env::var("HL_ROOT").ok();
        let reconnect = RetryConfig::reconnect();
        Self {
            out_dir_root: PathBuf::from(std::env::var("OUT_DIR_ROOT").unwrap_or_else(|_| "data".to_string())),
            out_dir: None,
            sink: std::env::var("SINK").ok().and_then(|v| v.parse().ok()).unwrap_or(SinkSelection::Both),
            no_write: false,
            color: true,
            raw_format: std::env::var("RAW_FORMAT").ok().and_then(|v| v.parse().ok()).unwrap_or_default(),
            subscribe_chunk: env_parse("SUBSCRIBE_CHUNK", 100usize).max(1),
            subscribe_pause_ms: env_parse("SUBSCRIBE_PAUSE_MS", 100),
            ack_timeout_ms: env_parse("ACK_TIMEOUT_MS", 5000),
            idle_timeout_secs: env_parse("IDLE_TIMEOUT_SECS", 60),
            keepalive_secs: env_parse("KEEPALIVE_SECS", 20),
            reconnect: RetryConfig {
                base_delay_ms: env_parse("RECONNECT_BASE_MS", reconnect.base_delay_ms),
                max_delay_ms: env_parse("RECONNECT_MAX_MS", reconnect.max_delay_ms),
                jitter_factor: env_parse("RECONNECT_JITTER", reconnect.jitter_factor),
                ..reconnect
            },
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./liquidations.sqlite".to_string()),
            store_table: std::env::var("STORE_TABLE").unwrap_or_else(|_| "liquidations".to_string()),
            batch_size: env_parse("BATCH_SIZE", 500usize).max(1),
            batch_interval_ms: env_parse("BATCH_INTERVAL_MS", 1000u64).max(50),
            batch_max_retries: env_parse("BATCH_MAX_RETRIES", 3),
            batch_queue_capacity: env_parse("BATCH_QUEUE_CAP", 50_000usize).max(1),
            hl_root_explicit: hl_root_env.is_some(),
            hl_root: hl_root_env.map(PathBuf::from).unwrap_or_else(default_hl_root),
            hl_poll_ms: env_parse("HL_POLL_MS", 150),
            hl_rotate_grace_ms: env_parse("HL_ROTATE_GRACE_MS", 1000),
            hl_cursor_path: std::env::var("HL_CURSOR_PATH").ok().map(PathBuf::from),
            hl_min_abs_size: env_parse("HL_MIN_ABS_SIZE", 0.0),
            bybit_rest_base: std::env::var("BYBIT_REST_BASE").unwrap_or_else(|_| "https://api.bybit.com".to_string()),
        }
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Bounded flush retry for the batch store
    pub fn flush_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.batch_max_retries,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            jitter_factor: 0.3,
        }
    }

    /// Check the values that cannot be clamped silently.
    pub fn validate(&self) -> Result<(), IngestError> {
        if !(0.0..1.0).contains(&self.reconnect.jitter_factor) {
            return Err(IngestError::Configuration(format!(
                "reconnect jitter must be in [0, 1), got {}",
                self.reconnect.jitter_factor
            )));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(IngestError::Configuration(
                "reconnect base delay exceeds the cap".to_string(),
            ));
        }
        url::Url::parse(&self.bybit_rest_base)
            .map_err(|e| IngestError::Configuration(format!("bad BYBIT_REST_BASE: {}", e)))?;
        if self.store_table.is_empty()
            || !self
                .store_table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(IngestError::Configuration(format!(
                "store table name '{}' must be alphanumeric",
                self.store_table
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_selection_parse() {
        assert_eq!("both".parse::<SinkSelection>().unwrap(), SinkSelection::Both);
        assert_eq!("pg".parse::<SinkSelection>().unwrap(), SinkSelection::Store);
        assert!("kafka".parse::<SinkSelection>().is_err());
        assert!(SinkSelection::Both.wants_files());
        assert!(!SinkSelection::Store.wants_files());
    }

    #[test]
    fn test_defaults_validate() {
        let cfg = Config::from_env();
        assert!(cfg.subscribe_chunk >= 1);
        assert!(cfg.batch_interval_ms >= 50);
        assert_eq!(cfg.reconnect.max_retries, u32::MAX);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_injected_table_name() {
        let mut cfg = Config::from_env();
        cfg.store_table = "liq; DROP TABLE x".to_string();
        assert!(matches!(cfg.validate(), Err(IngestError::Configuration(_))));
    }
}
