//! Tailer for locally written Hyperliquid node fill logs.
//!
//! Layout: `root/YYYYMMDD/H`, one append-only JSON-lines file per hour. The
//! tailer tracks a [`TailCursor`] (file + byte offset of the last complete
//! line consumed) so that resuming never re-emits or skips a line.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep, Duration};

use super::{FeedAdapter, Frame, SubscriptionSet};
use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::event::{Exchange, Market, RawRecord};
use crate::logging::{debug, info, log_transition, obj, v_num, v_str, warn, Domain};
use crate::normalize::number;

/// Read window per poll; a line that does not fit is skipped.
pub const MAX_READ_BYTES: u64 = 4 * 1024 * 1024;
const LABEL: &str = "hyperliquid/usdc";

#[derive(Debug, Clone)]
pub struct TailSettings {
    pub root: PathBuf,
    pub poll_interval: Duration,
    pub cursor_path: Option<PathBuf>,
    pub min_abs_size: f64,
    /// How long the old hour file must stay unchanged before switching to the next
    pub rotate_grace: Duration,
    pub max_read_bytes: u64,
}

impl TailSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            root: cfg.hl_root.clone(),
            poll_interval: Duration::from_millis(cfg.hl_poll_ms.max(10)),
            cursor_path: cfg.hl_cursor_path.clone(),
            min_abs_size: cfg.hl_min_abs_size,
            rotate_grace: Duration::from_millis(cfg.hl_rotate_grace_ms),
            max_read_bytes: MAX_READ_BYTES,
        }
    }
}

/// Position of the last complete line consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailCursor {
    pub file: PathBuf,
    pub offset: u64,
}

impl TailCursor {
    pub fn load(path: &Path) -> Option<Self> {
        let text = fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Write via a temp file so a crash never leaves a torn cursor.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let tmp = path.with_extension("tmp");
        let body = serde_json::to_vec(self).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    Tailing,
    /// A newer hour file exists; draining the current one before switching
    AwaitingRotation,
    /// Restarted from a recorded cursor
    ResumingAfterGap,
}

impl TailState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TailState::Tailing => "tailing",
            TailState::AwaitingRotation => "awaiting_rotation",
            TailState::ResumingAfterGap => "resuming_after_gap",
        }
    }
}

fn hour_key(path: &Path) -> Option<(u64, u64)> {
    let hour = path.file_name()?.to_str()?.parse::<u64>().ok()?;
    let day = path.parent()?.file_name()?.to_str()?.parse::<u64>().ok()?;
    Some((day, hour))
}

fn all_digits(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

/// All hour files under `root`, oldest first.
pub fn hour_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let days = match fs::read_dir(root) {
        Ok(d) => d,
        Err(_) => return files,
    };
    for day in days.flatten() {
        let day_path = day.path();
        let is_day = day_path.is_dir()
            && day_path.file_name().and_then(|n| n.to_str()).map(all_digits).unwrap_or(false);
        if !is_day {
            continue;
        }
        if let Ok(hours) = fs::read_dir(&day_path) {
            for hour in hours.flatten() {
                let p = hour.path();
                if p.is_file() && p.file_name().and_then(|n| n.to_str()).map(all_digits).unwrap_or(false) {
                    files.push(p);
                }
            }
        }
    }
    files.sort_by_key(|p| hour_key(p));
    files
}

/// First hour file strictly newer than `current`.
pub fn next_file_after(root: &Path, current: &Path) -> Option<PathBuf> {
    let key = hour_key(current)?;
    hour_files(root).into_iter().find(|p| hour_key(p).map(|k| k > key).unwrap_or(false))
}

/// `block_time` is ISO-8601 (offset optional) or epoch seconds/millis.
pub fn parse_log_time(value: &Value) -> Option<i64> {
    if let Some(v) = number(Some(value)) {
        return Some(if v < 1e12 { (v * 1000.0) as i64 } else { v as i64 });
    }
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Liquidation fills in one log line, or `None` if the line is not valid JSON.
///
/// A fill counts only when its taker is the liquidated user.
pub fn liquidation_fills(line: &str, min_abs_size: f64) -> Option<Vec<RawRecord>> {
    let rec: Value = serde_json::from_str(line).ok()?;
    let ts = rec
        .get("block_time")
        .and_then(parse_log_time)
        .or_else(|| rec.get("local_time").and_then(parse_log_time));
    let mut out = Vec::new();
    let events = match rec.get("events").and_then(Value::as_array) {
        Some(e) => e,
        None => return Some(out),
    };
    for ev in events {
        let (taker, fill) = match ev.as_array().map(Vec::as_slice) {
            Some([taker, fill]) => (taker, fill),
            _ => continue,
        };
        let liq_user = match fill.get("liquidation").and_then(|l| l.get("liquidatedUser")) {
            Some(u) => u,
            None => continue,
        };
        if taker != liq_user {
            continue;
        }
        match number(fill.get("sz")).map(f64::abs) {
            Some(sz) if sz >= min_abs_size => {}
            _ => continue,
        }
        out.push(RawRecord::new(fill.clone()).with_ts(ts));
    }
    Some(out)
}

/// Last observed size of the old hour file while a newer one exists.
#[derive(Debug, Clone, Copy)]
struct RotationWatch {
    seen_len: u64,
    since: Instant,
}

pub struct LogTailAdapter {
    settings: TailSettings,
    cursor: Option<TailCursor>,
    state: TailState,
    rotation: Option<RotationWatch>,
    skip_to_newline: bool,
    connected: bool,
    subscriptions: SubscriptionSet,
}

impl LogTailAdapter {
    pub fn new(settings: TailSettings) -> Self {
        let cursor = settings.cursor_path.as_deref().and_then(TailCursor::load);
        let state = if cursor.is_some() {
            TailState::ResumingAfterGap
        } else {
            TailState::Tailing
        };
        Self {
            settings,
            cursor,
            state,
            rotation: None,
            skip_to_newline: false,
            connected: false,
            subscriptions: SubscriptionSet::default(),
        }
    }

    /// Start from an explicit cursor instead of the newest file's end.
    pub fn with_cursor(mut self, cursor: TailCursor) -> Self {
        self.cursor = Some(cursor);
        self.state = TailState::ResumingAfterGap;
        self
    }

    pub fn cursor(&self) -> Option<&TailCursor> {
        self.cursor.as_ref()
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    fn set_state(&mut self, next: TailState, evidence: &str) {
        if self.state != next {
            log_transition(LABEL, self.state.as_str(), next.as_str(), evidence);
            self.state = next;
        }
    }

    fn persist(&self) {
        if let (Some(path), Some(cursor)) = (&self.settings.cursor_path, &self.cursor) {
            if let Err(e) = cursor.save(path) {
                warn(
                    Domain::Feed,
                    "cursor_save_failed",
                    obj(&[("pipeline", v_str(LABEL)), ("error", v_str(&e.to_string()))]),
                );
            }
        }
    }

    /// Read complete lines past the cursor. Returns `None` when nothing new was consumed.
    fn read_new_lines(&mut self) -> Result<Option<Vec<RawRecord>>> {
        let cursor = match self.cursor.as_mut() {
            Some(c) => c,
            None => return Ok(None),
        };
        let mut file = match File::open(&cursor.file) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(IngestError::connection(e)),
        };
        let len = file.metadata().map_err(IngestError::connection)?.len();
        if len < cursor.offset {
            warn(
                Domain::Feed,
                "file_truncated",
                obj(&[
                    ("pipeline", v_str(LABEL)),
                    ("file", v_str(&cursor.file.display().to_string())),
                    ("offset", v_num(cursor.offset as f64)),
                    ("len", v_num(len as f64)),
                ]),
            );
            cursor.offset = 0;
        }
        if len == cursor.offset {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(cursor.offset)).map_err(IngestError::connection)?;
        let window = self.settings.max_read_bytes.max(1);
        let mut buf = Vec::new();
        file.take(window)
            .read_to_end(&mut buf)
            .map_err(IngestError::connection)?;

        // Tail of an oversized line from the previous poll.
        let mut start = 0usize;
        if self.skip_to_newline {
            match buf.iter().position(|b| *b == b'\n') {
                Some(i) => {
                    start = i + 1;
                    self.skip_to_newline = false;
                }
                None => {
                    cursor.offset += buf.len() as u64;
                    self.persist();
                    return Ok(Some(Vec::new()));
                }
            }
        }
        let complete = match buf[start..].iter().rposition(|b| *b == b'\n') {
            Some(i) => start + i + 1,
            None if start == 0 && buf.len() as u64 >= window => {
                warn(
                    Domain::Feed,
                    "oversized_line_skipped",
                    obj(&[
                        ("pipeline", v_str(LABEL)),
                        ("file", v_str(&cursor.file.display().to_string())),
                        ("offset", v_num(cursor.offset as f64)),
                        ("limit", v_num(window as f64)),
                    ]),
                );
                cursor.offset += buf.len() as u64;
                self.skip_to_newline = true;
                self.persist();
                return Ok(Some(Vec::new()));
            }
            None if start > 0 => {
                cursor.offset += start as u64;
                self.persist();
                return Ok(Some(Vec::new()));
            }
            None => return Ok(None),
        };
        cursor.offset += complete as u64;

        let mut records = Vec::new();
        let mut malformed = 0u64;
        for line in buf[start..complete].split(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match liquidation_fills(line, self.settings.min_abs_size) {
                Some(fills) => records.extend(fills),
                None => malformed += 1,
            }
        }
        if malformed > 0 {
            debug(
                Domain::Feed,
                "malformed_lines",
                obj(&[("pipeline", v_str(LABEL)), ("count", v_num(malformed as f64))]),
            );
        }
        self.persist();
        Ok(Some(records))
    }

    fn rotate_to(&mut self, next: PathBuf) {
        info(
            Domain::Feed,
            "rotated",
            obj(&[
                ("pipeline", v_str(LABEL)),
                ("file", v_str(&next.display().to_string())),
            ]),
        );
        self.cursor = Some(TailCursor { file: next, offset: 0 });
        self.rotation = None;
        self.skip_to_newline = false;
        self.persist();
        self.set_state(TailState::Tailing, "next hour file");
    }

    /// One polling step: records if any complete liquidation lines were consumed.
    pub fn poll_once(&mut self) -> Result<Option<Vec<RawRecord>>> {
        if self.cursor.is_none() {
            // Nothing existed at connect time; a file appearing now is read from its start.
            if let Some(first) = hour_files(&self.settings.root).pop() {
                self.rotate_to(first);
            } else {
                return Ok(None);
            }
        }
        if let Some(records) = self.read_new_lines()? {
            if self.state == TailState::ResumingAfterGap {
                self.set_state(TailState::Tailing, "caught up from cursor");
            }
            return Ok(Some(records));
        }
        let current = match &self.cursor {
            Some(c) => c.file.clone(),
            None => return Ok(None),
        };
        let next = match next_file_after(&self.settings.root, &current) {
            Some(n) => n,
            None => return Ok(None),
        };
        let len = match fs::metadata(&current) {
            Ok(m) => m.len(),
            Err(_) => {
                self.rotate_to(next);
                return Ok(Some(Vec::new()));
            }
        };

        // Leave the old file only after it has stopped growing for the grace period.
        let now = Instant::now();
        let settled = match self.rotation {
            Some(w) if w.seen_len == len => now.duration_since(w.since) >= self.settings.rotate_grace,
            _ => {
                if self.rotation.is_none() {
                    self.set_state(TailState::AwaitingRotation, "newer hour file");
                }
                self.rotation = Some(RotationWatch { seen_len: len, since: now });
                false
            }
        };
        if !settled {
            return Ok(None);
        }
        let offset = self.cursor.as_ref().map(|c| c.offset).unwrap_or(len);
        if len > offset {
            warn(
                Domain::Feed,
                "partial_line_abandoned",
                obj(&[
                    ("pipeline", v_str(LABEL)),
                    ("file", v_str(&current.display().to_string())),
                    ("bytes", v_num((len - offset) as f64)),
                ]),
            );
        }
        self.rotate_to(next);
        Ok(Some(Vec::new()))
    }
}

#[async_trait]
impl FeedAdapter for LogTailAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Hyperliquid
    }

    fn market(&self) -> Market {
        Market::Usdc
    }

    async fn connect(&mut self) -> Result<()> {
        if !self.settings.root.is_dir() {
            return Err(IngestError::Connection(format!(
                "log root {} is not a directory",
                self.settings.root.display()
            )));
        }
        if self.cursor.is_none() {
            // No recorded position: start at the end of the newest file.
            if let Some(newest) = hour_files(&self.settings.root).pop() {
                let offset = fs::metadata(&newest).map(|m| m.len()).unwrap_or(0);
                self.cursor = Some(TailCursor { file: newest, offset });
                self.persist();
            }
        }
        self.connected = true;
        info(
            Domain::Feed,
            "tail_opened",
            obj(&[
                ("pipeline", v_str(LABEL)),
                ("state", v_str(self.state.as_str())),
                (
                    "file",
                    v_str(
                        &self
                            .cursor
                            .as_ref()
                            .map(|c| c.file.display().to_string())
                            .unwrap_or_default(),
                    ),
                ),
            ]),
        );
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<()> {
        Ok(())
    }

    async fn receive(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(IngestError::Connection("log tail not open".to_string()));
        }
        loop {
            match self.poll_once()? {
                Some(records) if !records.is_empty() => return Ok(Frame::Records(records)),
                Some(_) => continue,
                None => sleep(self.settings.poll_interval).await,
            }
        }
    }

    async fn disconnect(&mut self) {
        self.connected = false;
        self.persist();
    }

    fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }
}
