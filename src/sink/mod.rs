//! Event destinations and the router that fans events out to them.
//!
//! Each sink owns its own write discipline. The router delivers to every
//! sink concurrently and contains per-sink failures, so a stalled or broken
//! sink never stops delivery to the others.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::error::{IngestError, Result};
use crate::event::LiquidationEvent;
use crate::logging::{agg_increment, error, info, obj, v_str, Domain};

pub mod batch;
pub mod console;
pub mod file;

pub use batch::{BatchBuffer, BatchPolicy, BatchSink, BatchStore};
pub use console::ConsoleSink;
pub use file::FileSink;

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write(&self, event: Arc<LiquidationEvent>) -> Result<()>;

    /// Flush buffered state and release resources. Called once at shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared by every pipeline in the process.
pub struct SinkRouter {
    sinks: Vec<Arc<dyn Sink>>,
    closed: AtomicBool,
}

impl SinkRouter {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self {
            sinks,
            closed: AtomicBool::new(false),
        }
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Deliver one event to every sink. Returns the failures, already logged.
    pub async fn route(&self, event: LiquidationEvent) -> Vec<IngestError> {
        let event = Arc::new(event);
        let writes = self.sinks.iter().map(|sink| {
            let event = Arc::clone(&event);
            async move { sink.write(event).await }
        });
        let mut failures = Vec::new();
        for (sink, result) in self.sinks.iter().zip(join_all(writes).await) {
            if let Err(e) = result {
                agg_increment("sink_error");
                error(
                    Domain::Sink,
                    "sink_write_failed",
                    obj(&[
                        ("sink", v_str(sink.name())),
                        ("exchange", v_str(event.exchange().as_str())),
                        ("market", v_str(event.market().as_str())),
                        ("symbol", v_str(event.symbol())),
                        ("error", v_str(&e.to_string())),
                    ]),
                );
                failures.push(e);
            }
        }
        agg_increment("routed");
        failures
    }

    /// Close every sink once; later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let results = join_all(self.sinks.iter().map(|s| s.close())).await;
        for (sink, result) in self.sinks.iter().zip(results) {
            match result {
                Ok(()) => info(Domain::Sink, "sink_closed", obj(&[("sink", v_str(sink.name()))])),
                Err(e) => error(
                    Domain::Sink,
                    "sink_close_failed",
                    obj(&[("sink", v_str(sink.name())), ("error", v_str(&e.to_string()))]),
                ),
            }
        }
    }
}
