//! Exchange adapters.
//!
//! Live venues share one WebSocket adapter driven by a per-exchange
//! [`ws::Dialect`]; the log source has its own tailing adapter. Both sit
//! behind [`FeedAdapter`] so the pipeline loop does not care which it runs.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::event::{Exchange, Market, RawRecord};

pub mod binance;
pub mod bybit;
pub mod discovery;
pub mod hyperliquid;
pub mod okx;
pub mod session;
pub mod transport;
pub mod ws;

pub use session::{SessionEvent, SessionState, StreamSession};
pub use transport::{Connector, Inbound, Transport, TungsteniteConnector};

/// One unit of adapter output.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Zero or more liquidation records, in arrival order
    Records(Vec<RawRecord>),
    /// Subscription acknowledgement
    Ack,
    /// Subscription refused by the venue
    Rejected(String),
    /// Heartbeats, pongs, other channels
    Control,
    /// Connection ended; the session goes to Backoff
    Closed,
}

/// Channels currently requested from the venue. Replayed whole on every reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    channels: Vec<String>,
}

impl SubscriptionSet {
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::default();
        for c in channels {
            set.insert(c.into());
        }
        set
    }

    /// Insertion order is kept; duplicates are ignored.
    pub fn insert(&mut self, channel: String) -> bool {
        if self.channels.contains(&channel) {
            return false;
        }
        self.channels.push(channel);
        true
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn chunks(&self, size: usize) -> impl Iterator<Item = &[String]> {
        self.channels.chunks(size.max(1))
    }
}

/// Capability set every adapter variant implements.
///
/// `prepare` runs once per pipeline (symbol discovery); its failure is fatal
/// for that pipeline. `connect`, `subscribe` and `receive` run once per
/// session and fail with `Connection` errors that lead to a reconnect.
#[async_trait]
pub trait FeedAdapter: Send {
    fn exchange(&self) -> Exchange;
    fn market(&self) -> Market;

    async fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    async fn connect(&mut self) -> Result<()>;
    async fn subscribe(&mut self) -> Result<()>;
    async fn receive(&mut self) -> Result<Frame>;
    async fn disconnect(&mut self);

    fn subscriptions(&self) -> &SubscriptionSet;
}

/// Build the adapter for one (exchange, market) pair.
pub fn build_adapter(
    exchange: Exchange,
    market: Market,
    cfg: &Config,
    connector: Arc<dyn Connector>,
) -> Result<Box<dyn FeedAdapter>> {
    if !exchange.supports(market) {
        return Err(IngestError::Configuration(format!(
            "{} has no {} market",
            exchange, market
        )));
    }
    let settings = ws::WsSettings::from_config(cfg);
    let adapter: Box<dyn FeedAdapter> = match exchange {
        Exchange::Binance => Box::new(ws::WsAdapter::new(
            Box::new(binance::BinanceDialect::binance()),
            market,
            connector,
            settings,
        )),
        Exchange::Aster => Box::new(ws::WsAdapter::new(
            Box::new(binance::BinanceDialect::aster()),
            market,
            connector,
            settings,
        )),
        Exchange::Okx => Box::new(ws::WsAdapter::new(
            Box::new(okx::OkxDialect),
            market,
            connector,
            settings,
        )),
        Exchange::Bybit => Box::new(
            ws::WsAdapter::new(Box::new(bybit::BybitDialect), market, connector, settings)
                .with_discovery(Box::new(discovery::BybitInstruments::new(
                    &cfg.bybit_rest_base,
                )?)),
        ),
        Exchange::Hyperliquid => Box::new(hyperliquid::LogTailAdapter::new(
            hyperliquid::TailSettings::from_config(cfg),
        )),
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_set_dedups_and_chunks() {
        let set = SubscriptionSet::new(["a", "b", "a", "c"]);
        assert_eq!(set.len(), 3);
        let chunks: Vec<_> = set.chunks(2).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], ["a".to_string(), "b".to_string()]);
        assert_eq!(chunks[1], ["c".to_string()]);
    }

    #[test]
    fn unsupported_pair_is_configuration_error() {
        let cfg = Config::from_env();
        let connector: Arc<dyn Connector> = Arc::new(TungsteniteConnector::default());
        let err = build_adapter(Exchange::Aster, Market::Coin, &cfg, connector)
            .err()
            .unwrap();
        assert!(matches!(err, IngestError::Configuration(_)));
    }

    #[test]
    fn builds_every_supported_pair() {
        let cfg = Config::from_env();
        let connector: Arc<dyn Connector> = Arc::new(TungsteniteConnector::default());
        for ex in Exchange::ALL {
            for mk in ex.markets() {
                let a = build_adapter(ex, *mk, &cfg, connector.clone()).unwrap();
                assert_eq!(a.exchange(), ex);
                assert_eq!(a.market(), *mk);
            }
        }
    }
}
