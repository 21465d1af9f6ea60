//! Pipeline lifecycle: resolve the requested pairs, start one task per pair,
//! propagate shutdown and close the shared sinks once every pipeline is done.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::{interval, Duration};

use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::event::{Exchange, Market};
use crate::feed::{build_adapter, Connector};
use crate::logging::{error, info, obj, tick_aggregator, v_num, v_str, Domain};
use crate::pipeline::{run_pipeline, shutdown_requested, PipelineReport};
use crate::retry::RetryConfig;
use crate::sink::{BatchPolicy, BatchSink, ConsoleSink, FileSink, Sink, SinkRouter};
use crate::storage::LiquidationStore;

/// The three mutually exclusive ways of choosing pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Streams(Vec<(Exchange, Market)>),
    Single(Exchange, Market),
}

/// Parse `exchange:market`, rejecting pairs the exchange does not list.
pub fn parse_pair(item: &str) -> Result<(Exchange, Market)> {
    let (ex, mk) = item
        .trim()
        .split_once(':')
        .ok_or_else(|| IngestError::Configuration(format!("expected exchange:market, got '{}'", item)))?;
    validate_pair(ex.parse()?, mk.parse()?)
}

fn validate_pair(exchange: Exchange, market: Market) -> Result<(Exchange, Market)> {
    if !exchange.supports(market) {
        return Err(IngestError::Configuration(format!(
            "{} does not offer a {} market",
            exchange, market
        )));
    }
    Ok((exchange, market))
}

impl Selection {
    pub fn from_flags(
        all: bool,
        streams: Option<&str>,
        exchange: Option<&str>,
        market: Option<&str>,
    ) -> Result<Self> {
        let single = exchange.is_some() || market.is_some();
        let modes = [all, streams.is_some(), single].iter().filter(|m| **m).count();
        if modes > 1 {
            return Err(IngestError::Configuration(
                "--all, --streams and --exchange/--market are mutually exclusive".to_string(),
            ));
        }
        if all {
            return Ok(Selection::All);
        }
        if let Some(list) = streams {
            let mut pairs = Vec::new();
            for item in list.split(',').filter(|s| !s.trim().is_empty()) {
                let pair = parse_pair(item)?;
                if !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
            if pairs.is_empty() {
                return Err(IngestError::Configuration("--streams is empty".to_string()));
            }
            return Ok(Selection::Streams(pairs));
        }
        match (exchange, market) {
            (Some(ex), Some(mk)) => {
                let (ex, mk) = validate_pair(ex.parse()?, mk.parse()?)?;
                Ok(Selection::Single(ex, mk))
            }
            (Some(ex), None) => {
                // A single-market exchange needs no --market.
                let ex: Exchange = ex.parse()?;
                match ex.markets() {
                    [only] => Ok(Selection::Single(ex, *only)),
                    _ => Err(IngestError::Configuration(format!("--market is required for {}", ex))),
                }
            }
            (None, Some(_)) => Err(IngestError::Configuration("--market needs --exchange".to_string())),
            (None, None) => Err(IngestError::Configuration(
                "choose --all, --streams or --exchange/--market".to_string(),
            )),
        }
    }

    /// Pairs to run. The log source joins `All` only when its root was given explicitly.
    pub fn resolve(&self, include_log_source: bool) -> Vec<(Exchange, Market)> {
        match self {
            Selection::All => Exchange::ALL
                .iter()
                .filter(|ex| include_log_source || !ex.is_log_source())
                .flat_map(|ex| ex.markets().iter().map(move |mk| (*ex, *mk)))
                .collect(),
            Selection::Streams(pairs) => pairs.clone(),
            Selection::Single(ex, mk) => vec![(*ex, *mk)],
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, Selection::Single(..))
    }
}

/// Build the shared sink set. Observe-only mode keeps just the console.
pub fn build_router(cfg: &Config) -> Result<SinkRouter> {
    let mut sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(ConsoleSink::new(cfg.color))];
    if !cfg.no_write {
        if cfg.sink.wants_files() {
            let mut files = FileSink::new(&cfg.out_dir_root, cfg.raw_format);
            if let Some(dir) = &cfg.out_dir {
                files = files.with_fixed_dir(dir);
            }
            sinks.push(Arc::new(files));
        }
        if cfg.sink.wants_store() {
            let mut store = LiquidationStore::new(&cfg.sqlite_path, &cfg.store_table)
                .map_err(|e| IngestError::sink("store", e))?;
            store.init().map_err(|e| IngestError::sink("store", e))?;
            sinks.push(Arc::new(BatchSink::spawn(
                store,
                BatchPolicy {
                    max_size: cfg.batch_size,
                    interval: cfg.batch_interval(),
                },
                cfg.flush_retry(),
                cfg.batch_queue_capacity,
            )));
        }
    }
    Ok(SinkRouter::new(sinks))
}

/// Outcome of one pipeline task.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub exchange: Exchange,
    pub market: Market,
    pub result: Result<PipelineReport>,
}

pub struct Orchestrator {
    cfg: Config,
    connector: Arc<dyn Connector>,
    reconnect: RetryConfig,
}

impl Orchestrator {
    pub fn new(cfg: Config, connector: Arc<dyn Connector>) -> Self {
        let reconnect = cfg.reconnect.clone();
        Self {
            cfg,
            connector,
            reconnect,
        }
    }

    /// Run every pair until `shutdown` fires, then close the router.
    ///
    /// A pipeline that fails to start is reported in its outcome; siblings keep running.
    pub async fn run(
        &self,
        pairs: &[(Exchange, Market)],
        router: Arc<SinkRouter>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<PipelineOutcome> {
        info(
            Domain::System,
            "orchestrator_start",
            obj(&[
                ("pipelines", v_num(pairs.len() as f64)),
                ("sinks", v_str(&router.sink_names().join(","))),
            ]),
        );

        let mut outcomes = Vec::new();
        let mut handles = Vec::new();
        for &(exchange, market) in pairs {
            let adapter = match build_adapter(exchange, market, &self.cfg, self.connector.clone()) {
                Ok(a) => a,
                Err(e) => {
                    error(
                        Domain::Pipeline,
                        "pipeline_not_started",
                        obj(&[
                            ("exchange", v_str(exchange.as_str())),
                            ("market", v_str(market.as_str())),
                            ("error", v_str(&e.to_string())),
                        ]),
                    );
                    outcomes.push(PipelineOutcome {
                        exchange,
                        market,
                        result: Err(e),
                    });
                    continue;
                }
            };
            let handle = tokio::spawn(run_pipeline(
                adapter,
                router.clone(),
                self.reconnect.clone(),
                shutdown.clone(),
            ));
            handles.push((exchange, market, handle));
        }

        let ticker = tokio::spawn(aggregator_ticker(shutdown.clone()));

        let results = join_all(handles.into_iter().map(|(exchange, market, handle)| async move {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => Err(IngestError::Connection(format!("pipeline task failed: {}", e))),
            };
            PipelineOutcome {
                exchange,
                market,
                result,
            }
        }))
        .await;
        outcomes.extend(results);

        router.close().await;
        ticker.abort();
        tick_aggregator();

        for o in &outcomes {
            if let Ok(r) = &o.result {
                info(
                    Domain::System,
                    "pipeline_report",
                    obj(&[
                        ("exchange", v_str(r.exchange.as_str())),
                        ("market", v_str(r.market.as_str())),
                        ("events", v_num(r.events as f64)),
                        ("dropped", v_num(r.dropped as f64)),
                        ("reconnects", v_num(r.reconnects as f64)),
                        ("sink_failures", v_num(r.sink_failures as f64)),
                    ]),
                );
            }
        }
        outcomes
    }
}

async fn aggregator_ticker(mut shutdown: watch::Receiver<bool>) {
    let mut every = interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return,
            _ = every.tick() => tick_aggregator(),
        }
    }
}
