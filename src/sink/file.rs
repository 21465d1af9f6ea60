use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};

use super::Sink;
use crate::error::{IngestError, Result};
use crate::event::{Exchange, LiquidationEvent, Market, RawFormat, SCHEMA_COLUMNS};
use crate::logging::{info, obj, v_str, warn, Domain};

const NAME: &str = "file";

struct DailyFile {
    date: NaiveDate,
    path: PathBuf,
    writer: csv::Writer<File>,
}

/// One CSV file per (exchange, market) per UTC day.
///
/// All pairs share one lock; each write is a single row followed by a flush,
/// so rows from different pipelines never interleave inside a file.
pub struct FileSink {
    root: PathBuf,
    fixed_dir: Option<PathBuf>,
    raw_format: RawFormat,
    files: Mutex<HashMap<(Exchange, Market), DailyFile>>,
}

pub fn pair_dir(root: &Path, exchange: Exchange, market: Market) -> PathBuf {
    root.join(format!("{}_{}", exchange, market))
}

pub fn file_name(date: NaiveDate) -> String {
    format!("liquidations_{}.csv", date.format("%Y-%m-%d"))
}

fn utc_date(ts_ms: i64) -> Result<NaiveDate> {
    DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.date_naive())
        .ok_or_else(|| IngestError::sink(NAME, format!("timestamp out of range: {}", ts_ms)))
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>, raw_format: RawFormat) -> Self {
        Self {
            root: root.into(),
            fixed_dir: None,
            raw_format,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Write every pair into `dir` directly (single-pair mode).
    pub fn with_fixed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fixed_dir = Some(dir.into());
        self
    }

    fn dir_for(&self, exchange: Exchange, market: Market) -> PathBuf {
        match &self.fixed_dir {
            Some(d) => d.clone(),
            None => pair_dir(&self.root, exchange, market),
        }
    }

    fn open(&self, exchange: Exchange, market: Market, date: NaiveDate) -> Result<DailyFile> {
        let dir = self.dir_for(exchange, market);
        fs::create_dir_all(&dir).map_err(|e| IngestError::sink(NAME, e))?;
        let path = dir.join(file_name(date));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| IngestError::sink(NAME, e))?;
        let fresh = file.metadata().map(|m| m.len() == 0).unwrap_or(true);
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if fresh {
            writer
                .write_record(SCHEMA_COLUMNS)
                .and_then(|_| writer.flush().map_err(csv::Error::from))
                .map_err(|e| IngestError::sink(NAME, e))?;
        }
        info(
            Domain::Sink,
            "file_opened",
            obj(&[
                ("exchange", v_str(exchange.as_str())),
                ("market", v_str(market.as_str())),
                ("path", v_str(&path.display().to_string())),
            ]),
        );
        Ok(DailyFile { date, path, writer })
    }

    fn write_row(&self, event: &LiquidationEvent) -> Result<()> {
        let date = utc_date(event.ts_ingest_ms())?;
        let key = (event.exchange(), event.market());
        let mut files = self
            .files
            .lock()
            .map_err(|_| IngestError::sink(NAME, "file table poisoned"))?;

        let rotate = files.get(&key).map(|f| f.date != date).unwrap_or(true);
        if rotate {
            let opened = self.open(key.0, key.1, date)?;
            if let Some(mut old) = files.insert(key, opened) {
                if let Err(e) = old.writer.flush() {
                    warn(
                        Domain::Sink,
                        "rotated_file_flush_failed",
                        obj(&[
                            ("path", v_str(&old.path.display().to_string())),
                            ("error", v_str(&e.to_string())),
                        ]),
                    );
                }
            }
        }
        let daily = files
            .get_mut(&key)
            .ok_or_else(|| IngestError::sink(NAME, "no open file"))?;
        daily
            .writer
            .write_record(event.to_row(self.raw_format))
            .map_err(|e| IngestError::sink(NAME, format!("{}: {}", daily.path.display(), e)))?;
        daily
            .writer
            .flush()
            .map_err(|e| IngestError::sink(NAME, format!("{}: {}", daily.path.display(), e)))
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn write(&self, event: Arc<LiquidationEvent>) -> Result<()> {
        self.write_row(&event)
    }

    async fn close(&self) -> Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| IngestError::sink(NAME, "file table poisoned"))?;
        for (_, mut f) in files.drain() {
            f.writer.flush().map_err(|e| IngestError::sink(NAME, e))?;
        }
        Ok(())
    }
}
