//! One Adapter -> Normalizer -> Router pipeline, driven by a `StreamSession`.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::sleep;

use crate::error::Result;
use crate::event::{Exchange, Market};
use crate::feed::{FeedAdapter, Frame, SessionEvent, StreamSession};
use crate::logging::{agg_increment, error, info, log_schema_drop, log_transition, obj, v_num, v_str, warn, Domain};
use crate::normalize::Normalizer;
use crate::retry::RetryConfig;
use crate::sink::SinkRouter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub exchange: Exchange,
    pub market: Market,
    /// Events handed to the router
    pub events: u64,
    /// Records dropped by the normalizer
    pub dropped: u64,
    pub reconnects: u64,
    pub sink_failures: u64,
}

/// Resolves once shutdown is requested or the sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

enum Step {
    Continue,
    Lost(String),
    Stop,
}

struct Runner {
    adapter: Box<dyn FeedAdapter>,
    normalizer: Normalizer,
    router: Arc<SinkRouter>,
    session: StreamSession,
    label: String,
    report: PipelineReport,
}

impl Runner {
    fn advance(&mut self, event: SessionEvent, evidence: &str) {
        match self.session.apply(event) {
            Ok(prev) => log_transition(&self.label, prev.as_str(), self.session.state().as_str(), evidence),
            Err(e) => error(
                Domain::Pipeline,
                "invalid_transition",
                obj(&[("pipeline", v_str(&self.label)), ("error", v_str(&e.msg))]),
            ),
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Step {
        match frame {
            Frame::Records(records) => {
                for record in &records {
                    match self.normalizer.normalize(record) {
                        Ok(Some(event)) => {
                            let failures = self.router.route(event).await;
                            self.report.events += 1;
                            self.report.sink_failures += failures.len() as u64;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            self.report.dropped += 1;
                            log_schema_drop(&self.label, &e.to_string(), &record.payload);
                        }
                    }
                }
                Step::Continue
            }
            Frame::Ack | Frame::Control => Step::Continue,
            Frame::Rejected(reason) => {
                warn(
                    Domain::Feed,
                    "subscription_rejected",
                    obj(&[("pipeline", v_str(&self.label)), ("reason", v_str(&reason))]),
                );
                Step::Continue
            }
            Frame::Closed => Step::Lost("closed by peer".to_string()),
        }
    }

    /// Connect and subscribe; the session ends in Streaming on success.
    async fn open_session(&mut self) -> Result<()> {
        self.adapter.connect().await?;
        self.advance(SessionEvent::Connected, "transport open");
        self.adapter.subscribe().await?;
        let evidence = format!("{} channels", self.adapter.subscriptions().len());
        self.advance(SessionEvent::Subscribed, &evidence);
        Ok(())
    }

    async fn stream(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<Step> {
        loop {
            let frame = tokio::select! {
                _ = shutdown_requested(shutdown) => return Ok(Step::Stop),
                frame = self.adapter.receive() => frame,
            };
            match frame {
                Ok(frame) => match self.handle_frame(frame).await {
                    Step::Continue => continue,
                    other => return Ok(other),
                },
                Err(e) if e.is_transient() => return Ok(Step::Lost(e.to_string())),
                Err(e) => return Err(e),
            }
        }
    }

    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return Ok(()),
            prepared = self.adapter.prepare() => prepared?,
        }
        self.advance(SessionEvent::Connect, "start");

        loop {
            let opened = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                opened = self.open_session() => opened,
            };
            let step = match opened {
                Ok(()) => {
                    info(
                        Domain::Pipeline,
                        "streaming",
                        obj(&[
                            ("pipeline", v_str(&self.label)),
                            ("reconnects", v_num(self.session.reconnects() as f64)),
                        ]),
                    );
                    self.stream(&mut shutdown).await?
                }
                Err(e) if e.is_transient() => Step::Lost(e.to_string()),
                Err(e) => return Err(e),
            };

            let reason = match step {
                Step::Stop => return Ok(()),
                Step::Continue => continue,
                Step::Lost(reason) => reason,
            };

            self.adapter.disconnect().await;
            self.advance(SessionEvent::ConnectionLost, &reason);
            agg_increment("reconnect");
            let delay = self.session.backoff_delay();
            warn(
                Domain::Pipeline,
                "connection_lost",
                obj(&[
                    ("pipeline", v_str(&self.label)),
                    ("reason", v_str(&reason)),
                    ("attempt", v_num(self.session.attempt() as f64)),
                    ("delay_ms", v_num(delay.as_millis() as f64)),
                ]),
            );
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                _ = sleep(delay) => {}
            }
            self.advance(SessionEvent::BackoffElapsed, "backoff elapsed");
        }
    }
}

/// Run one pipeline until shutdown is signalled.
///
/// Connection problems are retried forever with backoff. Discovery and
/// configuration failures end the pipeline with an error.
pub async fn run_pipeline(
    adapter: Box<dyn FeedAdapter>,
    router: Arc<SinkRouter>,
    reconnect: RetryConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<PipelineReport> {
    let exchange = adapter.exchange();
    let market = adapter.market();
    let label = format!("{}/{}", exchange, market);
    let mut runner = Runner {
        adapter,
        normalizer: Normalizer::new(exchange, market),
        router,
        session: StreamSession::new(reconnect),
        label: label.clone(),
        report: PipelineReport {
            exchange,
            market,
            events: 0,
            dropped: 0,
            reconnects: 0,
            sink_failures: 0,
        },
    };

    let result = runner.run(shutdown).await;
    runner.adapter.disconnect().await;
    runner.advance(SessionEvent::Shutdown, "stop requested");
    runner.advance(SessionEvent::Stopped, "adapter released");
    runner.report.reconnects = runner.session.reconnects();

    match result {
        Ok(()) => {
            info(
                Domain::Pipeline,
                "pipeline_stopped",
                obj(&[
                    ("pipeline", v_str(&label)),
                    ("events", v_num(runner.report.events as f64)),
                    ("dropped", v_num(runner.report.dropped as f64)),
                    ("reconnects", v_num(runner.report.reconnects as f64)),
                ]),
            );
            Ok(runner.report)
        }
        Err(e) => {
            error(
                Domain::Pipeline,
                "pipeline_failed",
                obj(&[
                    ("pipeline", v_str(&label)),
                    ("kind", v_str(e.kind())),
                    ("error", v_str(&e.to_string())),
                ]),
            );
            Err(e)
        }
    }
}
