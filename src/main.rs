use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;

use liqstream::config::{Config, SinkSelection};
use liqstream::feed::TungsteniteConnector;
use liqstream::logging::{error, info, obj, v_num, v_str, warn, Domain};
use liqstream::orchestrator::{build_router, Orchestrator, Selection};

/// Stream liquidation events from crypto derivatives venues.
#[derive(Parser, Debug)]
#[command(name = "liqstream")]
struct Cli {
    /// Run every known exchange:market pair
    #[arg(long)]
    all: bool,

    /// Comma-separated exchange:market pairs, e.g. binance:usdt,okx:coin
    #[arg(long)]
    streams: Option<String>,

    /// Single pair mode: exchange
    #[arg(long)]
    exchange: Option<String>,

    /// Single pair mode: market (usdt, coin, usdc)
    #[arg(long)]
    market: Option<String>,

    /// Exact output directory (single pair mode only)
    #[arg(long)]
    outdir: Option<PathBuf>,

    /// Root directory for per-pair CSV folders
    #[arg(long)]
    outdir_root: Option<PathBuf>,

    /// Print events only, write nothing
    #[arg(long)]
    no_write: bool,

    #[arg(long)]
    no_color: bool,

    /// Symbols per subscription request for per-symbol venues
    #[arg(long)]
    subscribe_chunk: Option<usize>,

    /// csv, store or both
    #[arg(long)]
    sink: Option<SinkSelection>,

    /// SQLite file for the batch store
    #[arg(long)]
    store_path: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    batch_interval_ms: Option<u64>,

    /// Hyperliquid hourly fill log root
    #[arg(long)]
    hl_root: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, cfg: &mut Config) {
        if let Some(root) = &self.outdir_root {
            cfg.out_dir_root = root.clone();
        }
        cfg.out_dir = self.outdir.clone();
        cfg.no_write = self.no_write;
        cfg.color = !self.no_color;
        if let Some(n) = self.subscribe_chunk {
            cfg.subscribe_chunk = n.max(1);
        }
        if let Some(sink) = self.sink {
            cfg.sink = sink;
        }
        if let Some(path) = &self.store_path {
            cfg.sqlite_path = path.clone();
        }
        if let Some(n) = self.batch_size {
            cfg.batch_size = n.max(1);
        }
        if let Some(ms) = self.batch_interval_ms {
            cfg.batch_interval_ms = ms.max(50);
        }
        if let Some(root) = &self.hl_root {
            cfg.hl_root = root.clone();
            cfg.hl_root_explicit = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = Config::from_env();
    cli.apply(&mut cfg);
    cfg.validate()?;

    let selection = Selection::from_flags(
        cli.all,
        cli.streams.as_deref(),
        cli.exchange.as_deref(),
        cli.market.as_deref(),
    )?;
    if cfg.out_dir.is_some() && !selection.is_single() {
        warn(
            Domain::System,
            "outdir_ignored",
            obj(&[("reason", v_str("--outdir applies to single pair mode only"))]),
        );
        cfg.out_dir = None;
    }
    let pairs = selection.resolve(cfg.hl_root_explicit);

    let router = Arc::new(build_router(&cfg)?);
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info(Domain::System, "shutdown_requested", obj(&[]));
        }
        let _ = stop_tx.send(true);
    });

    let orchestrator = Orchestrator::new(cfg, Arc::new(TungsteniteConnector::default()));
    let outcomes = orchestrator.run(&pairs, router, stop_rx).await;

    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    for o in &outcomes {
        if let Err(e) = &o.result {
            error(
                Domain::System,
                "pipeline_error",
                obj(&[
                    ("exchange", v_str(o.exchange.as_str())),
                    ("market", v_str(o.market.as_str())),
                    ("kind", v_str(e.kind())),
                    ("error", v_str(&e.to_string())),
                ]),
            );
        }
    }
    info(
        Domain::System,
        "exit",
        obj(&[
            ("pipelines", v_num(outcomes.len() as f64)),
            ("failed", v_num(failed as f64)),
        ]),
    );
    Ok(())
}
