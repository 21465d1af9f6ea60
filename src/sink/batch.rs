use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

use super::Sink;
use crate::error::{IngestError, Result};
use crate::event::LiquidationEvent;
use crate::logging::{agg_increment, error, info, obj, v_num, v_str, warn, Domain, ProfileScope};
use crate::retry::{retry_async, RetryConfig};
use crate::storage::LiquidationStore;

const NAME: &str = "store";

/// Destination of flushed batches. A batch is written whole or not at all.
pub trait BatchStore: Send + 'static {
    fn write_batch(&mut self, events: &[Arc<LiquidationEvent>]) -> anyhow::Result<()>;
}

impl BatchStore for LiquidationStore {
    fn write_batch(&mut self, events: &[Arc<LiquidationEvent>]) -> anyhow::Result<()> {
        self.insert_batch(events).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    pub max_size: usize,
    pub interval: Duration,
}

/// Ordered buffer with a size-or-age flush rule.
#[derive(Debug)]
pub struct BatchBuffer {
    policy: BatchPolicy,
    items: Vec<Arc<LiquidationEvent>>,
    last_flush: Instant,
}

impl BatchBuffer {
    pub fn new(policy: BatchPolicy, now: Instant) -> Self {
        Self {
            policy,
            items: Vec::with_capacity(policy.max_size.min(4096)),
            last_flush: now,
        }
    }

    pub fn push(&mut self, event: Arc<LiquidationEvent>) {
        self.items.push(event);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Flush iff non-empty and either full or older than the interval.
    pub fn due(&self, now: Instant) -> bool {
        !self.items.is_empty()
            && (self.items.len() >= self.policy.max_size
                || now.saturating_duration_since(self.last_flush) >= self.policy.interval)
    }

    pub fn deadline(&self) -> Instant {
        self.last_flush + self.policy.interval
    }

    pub fn take(&mut self, now: Instant) -> Vec<Arc<LiquidationEvent>> {
        self.last_flush = now;
        std::mem::take(&mut self.items)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub flushes: u64,
    pub rows: u64,
    pub failed_batches: u64,
    pub lost_rows: u64,
}

struct Worker<S: BatchStore> {
    store: S,
    retry: RetryConfig,
    degraded: Arc<AtomicBool>,
    stats: FlushStats,
}

impl<S: BatchStore> Worker<S> {
    async fn flush(&mut self, batch: Vec<Arc<LiquidationEvent>>, reason: &str) {
        if batch.is_empty() {
            return;
        }
        let _scope = ProfileScope::with_context(
            "store_flush",
            &[("rows", v_num(batch.len() as f64)), ("reason", v_str(reason))],
        );
        let store = &mut self.store;
        let result = retry_async(&self.retry, "store_flush", || {
            futures_util::future::ready(store.write_batch(&batch))
        })
        .await;
        match result {
            Ok(()) => {
                self.stats.flushes += 1;
                self.stats.rows += batch.len() as u64;
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info(Domain::Sink, "store_recovered", obj(&[("sink", v_str(NAME))]));
                }
            }
            Err(e) => {
                self.stats.failed_batches += 1;
                self.stats.lost_rows += batch.len() as u64;
                self.degraded.store(true, Ordering::SeqCst);
                agg_increment("sink_error");
                error(
                    Domain::Sink,
                    "store_flush_failed",
                    obj(&[
                        ("sink", v_str(NAME)),
                        ("rows", v_num(batch.len() as f64)),
                        ("attempts", v_num(self.retry.max_retries as f64 + 1.0)),
                        ("error", v_str(&e.to_string())),
                    ]),
                );
            }
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Arc<LiquidationEvent>>, policy: BatchPolicy) -> FlushStats {
        let mut buffer = BatchBuffer::new(policy, Instant::now());
        loop {
            let deadline = buffer.deadline();
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(event) => {
                        buffer.push(event);
                        let now = Instant::now();
                        if buffer.due(now) {
                            let reason = if buffer.len() >= policy.max_size { "size" } else { "interval" };
                            let batch = buffer.take(now);
                            self.flush(batch, reason).await;
                        }
                    }
                    None => break,
                },
                _ = sleep_until(deadline), if !buffer.is_empty() => {
                    let now = Instant::now();
                    if buffer.due(now) {
                        let batch = buffer.take(now);
                        self.flush(batch, "interval").await;
                    }
                }
            }
        }
        // Queue closed: final flush, exactly once.
        let batch = buffer.take(Instant::now());
        self.flush(batch, "shutdown").await;
        self.stats
    }
}

/// Batch-store sink shared by all pipelines.
///
/// Pipelines enqueue into a bounded channel; a single worker task owns the
/// store, so batching stays consistent without locking the store itself.
pub struct BatchSink {
    tx: Mutex<Option<mpsc::Sender<Arc<LiquidationEvent>>>>,
    worker: Mutex<Option<JoinHandle<FlushStats>>>,
    degraded: Arc<AtomicBool>,
    dropped: AtomicU64,
}

impl BatchSink {
    /// Start the worker. Requires a running tokio runtime.
    pub fn spawn<S: BatchStore>(store: S, policy: BatchPolicy, retry: RetryConfig, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let degraded = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            store,
            retry,
            degraded: degraded.clone(),
            stats: FlushStats::default(),
        };
        let handle = tokio::spawn(worker.run(rx, policy));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            degraded,
            dropped: AtomicU64::new(0),
        }
    }

    /// True after a flush exhausted its retries, until the next good flush.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting events, flush what is buffered and wait for the worker.
    pub async fn shutdown(&self) -> Result<FlushStats> {
        drop(self.tx.lock().map_err(|_| IngestError::sink(NAME, "sender poisoned"))?.take());
        let handle = self
            .worker
            .lock()
            .map_err(|_| IngestError::sink(NAME, "worker poisoned"))?
            .take();
        match handle {
            Some(h) => h.await.map_err(|e| IngestError::sink(NAME, e)),
            None => Ok(FlushStats::default()),
        }
    }
}

#[async_trait]
impl Sink for BatchSink {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn write(&self, event: Arc<LiquidationEvent>) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| IngestError::sink(NAME, "sender poisoned"))?
            .clone()
            .ok_or_else(|| IngestError::sink(NAME, "closed"))?;
        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(e)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn(
                    Domain::Sink,
                    "store_queue_full",
                    obj(&[
                        ("sink", v_str(NAME)),
                        ("exchange", v_str(e.exchange().as_str())),
                        ("symbol", v_str(e.symbol())),
                        ("dropped_total", v_num(n as f64)),
                    ]),
                );
                Err(IngestError::sink(NAME, "queue full, event dropped"))
            }
            Err(TrySendError::Closed(_)) => Err(IngestError::sink(NAME, "worker stopped")),
        }
    }

    async fn close(&self) -> Result<()> {
        let stats = self.shutdown().await?;
        info(
            Domain::Sink,
            "store_closed",
            obj(&[
                ("sink", v_str(NAME)),
                ("flushes", v_num(stats.flushes as f64)),
                ("rows", v_num(stats.rows as f64)),
                ("lost_rows", v_num(stats.lost_rows as f64)),
                ("dropped", v_num(self.dropped() as f64)),
            ]),
        );
        if stats.lost_rows > 0 {
            return Err(IngestError::sink(
                NAME,
                format!("{} rows lost after retries", stats.lost_rows),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Exchange, Market, Side};
    use anyhow::anyhow;

    #[derive(Clone, Default)]
    struct MemoryStore {
        batches: Arc<Mutex<Vec<usize>>>,
    }

    impl BatchStore for MemoryStore {
        fn write_batch(&mut self, events: &[Arc<LiquidationEvent>]) -> anyhow::Result<()> {
            self.batches.lock().unwrap().push(events.len());
            Ok(())
        }
    }

    struct FailingStore {
        attempts: Arc<AtomicU64>,
    }

    impl BatchStore for FailingStore {
        fn write_batch(&mut self, _events: &[Arc<LiquidationEvent>]) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("connection refused"))
        }
    }

    fn event() -> Arc<LiquidationEvent> {
        Arc::new(LiquidationEvent::new(
            Exchange::Bybit,
            Market::Usdt,
            "BTCUSDT".into(),
            Side::Long,
            1.0,
            1.0,
            1,
            1,
            serde_json::json!({}),
        ))
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn due_iff_full_or_stale() {
        let t0 = Instant::now();
        let policy = BatchPolicy {
            max_size: 3,
            interval: Duration::from_millis(1000),
        };
        let mut buf = BatchBuffer::new(policy, t0);
        assert!(!buf.due(t0 + Duration::from_secs(10)), "empty never flushes");
        buf.push(event());
        assert!(!buf.due(t0 + Duration::from_millis(999)));
        assert!(buf.due(t0 + Duration::from_millis(1000)));
        buf.push(event());
        buf.push(event());
        assert!(buf.due(t0));
        let taken = buf.take(t0 + Duration::from_millis(5));
        assert_eq!(taken.len(), 3);
        assert!(buf.is_empty());
        buf.push(event());
        assert!(!buf.due(t0 + Duration::from_millis(1004)));
        assert!(buf.due(t0 + Duration::from_millis(1005)));
    }

    #[tokio::test]
    async fn size_flush_then_final_flush_on_close() {
        let store = MemoryStore::default();
        let batches = store.batches.clone();
        let sink = BatchSink::spawn(
            store,
            BatchPolicy {
                max_size: 2,
                interval: Duration::from_secs(3600),
            },
            fast_retry(0),
            16,
        );
        for _ in 0..5 {
            sink.write(event()).await.unwrap();
        }
        sink.close().await.unwrap();
        assert_eq!(batches.lock().unwrap().as_slice(), [2, 2, 1]);

        // second close is a no-op, no extra flush
        sink.close().await.unwrap();
        assert_eq!(batches.lock().unwrap().len(), 3);
        assert!(sink.write(event()).await.is_err());
    }

    #[tokio::test]
    async fn interval_flush_without_new_events() {
        let store = MemoryStore::default();
        let batches = store.batches.clone();
        let sink = BatchSink::spawn(
            store,
            BatchPolicy {
                max_size: 100,
                interval: Duration::from_millis(50),
            },
            fast_retry(0),
            16,
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        sink.write(event()).await.unwrap();
        sink.write(event()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let flushed: usize = batches.lock().unwrap().iter().sum();
        assert_eq!(flushed, 2);
        sink.close().await.unwrap();
        let flushed: usize = batches.lock().unwrap().iter().sum();
        assert_eq!(flushed, 2);
    }

    #[tokio::test]
    async fn bounded_retry_marks_degraded() {
        let attempts = Arc::new(AtomicU64::new(0));
        let sink = BatchSink::spawn(
            FailingStore {
                attempts: attempts.clone(),
            },
            BatchPolicy {
                max_size: 1,
                interval: Duration::from_secs(3600),
            },
            fast_retry(2),
            16,
        );
        sink.write(event()).await.unwrap();
        let err = sink.close().await.unwrap_err();
        assert!(matches!(err, IngestError::SinkWrite { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(sink.is_degraded());
    }
}
