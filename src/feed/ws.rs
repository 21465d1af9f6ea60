use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{sleep, timeout, Duration, Instant};

use super::discovery::SymbolSource;
use super::transport::{Connector, Inbound, Transport};
use super::{FeedAdapter, Frame, SubscriptionSet};
use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::event::{Exchange, Market};
use crate::logging::{debug, info, obj, v_num, v_str, warn, Domain};

/// How a live venue keeps a quiet connection open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keepalive {
    /// Application-level text ping
    Text(&'static str),
    /// WebSocket protocol ping frame
    Frame,
}

/// Wire dialect of one live venue.
pub trait Dialect: Send + Sync {
    fn exchange(&self) -> Exchange;
    fn endpoint(&self, market: Market) -> String;

    /// Channels for venues with one all-symbols feed. Empty for discovery venues.
    fn fixed_channels(&self, _market: Market) -> Vec<String> {
        Vec::new()
    }

    /// Channel name for one discovered symbol.
    fn symbol_channel(&self, symbol: &str) -> String {
        symbol.to_string()
    }

    /// One subscription request per chunk of channels.
    fn subscribe_request(&self, channels: &[String], request_id: u64) -> String;

    fn classify(&self, text: &str, market: Market) -> Frame;

    fn keepalive(&self) -> Keepalive {
        Keepalive::Frame
    }
}

#[derive(Debug, Clone)]
pub struct WsSettings {
    pub chunk_size: usize,
    pub chunk_pause: Duration,
    pub ack_timeout: Duration,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
}

impl WsSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            chunk_size: cfg.subscribe_chunk.max(1),
            chunk_pause: Duration::from_millis(cfg.subscribe_pause_ms),
            ack_timeout: Duration::from_millis(cfg.ack_timeout_ms),
            keepalive_interval: Duration::from_secs(cfg.keepalive_secs.max(1)),
            idle_timeout: Duration::from_secs(cfg.idle_timeout_secs.max(1)),
        }
    }
}

/// WebSocket adapter shared by every live venue.
pub struct WsAdapter {
    dialect: Box<dyn Dialect>,
    market: Market,
    connector: Arc<dyn Connector>,
    discovery: Option<Box<dyn SymbolSource>>,
    subscriptions: SubscriptionSet,
    settings: WsSettings,
    transport: Option<Box<dyn Transport>>,
    next_request_id: u64,
    label: String,
}

impl WsAdapter {
    pub fn new(
        dialect: Box<dyn Dialect>,
        market: Market,
        connector: Arc<dyn Connector>,
        settings: WsSettings,
    ) -> Self {
        let label = format!("{}/{}", dialect.exchange(), market);
        let subscriptions = SubscriptionSet::new(dialect.fixed_channels(market));
        Self {
            dialect,
            market,
            connector,
            discovery: None,
            subscriptions,
            settings,
            transport: None,
            next_request_id: 1,
            label,
        }
    }

    pub fn with_discovery(mut self, source: Box<dyn SymbolSource>) -> Self {
        self.discovery = Some(source);
        self
    }

    /// Enumerate active instruments. An empty listing is a `Discovery` error.
    pub async fn discover_symbols(&mut self) -> Result<Vec<String>> {
        let source = match &self.discovery {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        let symbols = source.fetch(self.market).await?;
        if symbols.is_empty() {
            return Err(IngestError::Discovery(format!(
                "{}: instrument listing returned no symbols",
                self.label
            )));
        }
        Ok(symbols)
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>> {
        let label = &self.label;
        self.transport
            .as_mut()
            .ok_or_else(|| IngestError::Connection(format!("{}: not connected", label)))
    }

    /// Wait for the venue to acknowledge the last request. Silence past the
    /// deadline is tolerated; a rejection fails the session so it resubscribes
    /// after backoff. Data frames before Streaming are discarded.
    async fn await_ack(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.settings.ack_timeout;
        let market = self.market;
        let mut discarded = 0u64;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug(
                    Domain::Feed,
                    "ack_timeout",
                    obj(&[("pipeline", v_str(&self.label)), ("discarded", v_num(discarded as f64))]),
                );
                return Ok(());
            }
            let t = self.transport()?;
            let inbound = match timeout(remaining, t.next_message()).await {
                Err(_) => continue,
                Ok(r) => r?,
            };
            let text = match inbound {
                Inbound::Closed => {
                    return Err(IngestError::Connection(format!(
                        "{}: closed while subscribing",
                        self.label
                    )))
                }
                Inbound::Heartbeat => continue,
                Inbound::Text(text) => text,
            };
            if text.trim() == "ping" {
                t.send_text("pong".to_string()).await?;
                continue;
            }
            match self.dialect.classify(&text, market) {
                Frame::Ack => return Ok(()),
                Frame::Rejected(reason) => {
                    warn(
                        Domain::Feed,
                        "subscribe_rejected",
                        obj(&[("pipeline", v_str(&self.label)), ("reason", v_str(&reason))]),
                    );
                    return Err(IngestError::Connection(format!(
                        "{}: subscription rejected: {}",
                        self.label, reason
                    )));
                }
                Frame::Closed => {
                    return Err(IngestError::Connection(format!(
                        "{}: closed while subscribing",
                        self.label
                    )))
                }
                Frame::Records(_) => discarded += 1,
                Frame::Control => {}
            }
        }
    }
}

#[async_trait]
impl FeedAdapter for WsAdapter {
    fn exchange(&self) -> Exchange {
        self.dialect.exchange()
    }

    fn market(&self) -> Market {
        self.market
    }

    async fn prepare(&mut self) -> Result<()> {
        if self.discovery.is_none() {
            return Ok(());
        }
        let symbols = self.discover_symbols().await?;
        let channels: Vec<String> = symbols.iter().map(|s| self.dialect.symbol_channel(s)).collect();
        self.subscriptions = SubscriptionSet::new(channels);
        info(
            Domain::Feed,
            "symbols_discovered",
            obj(&[
                ("pipeline", v_str(&self.label)),
                ("count", v_num(self.subscriptions.len() as f64)),
            ]),
        );
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        self.disconnect().await;
        let url = self.dialect.endpoint(self.market);
        let transport = self.connector.open(&url).await?;
        self.transport = Some(transport);
        info(
            Domain::Feed,
            "connected",
            obj(&[("pipeline", v_str(&self.label)), ("url", v_str(&url))]),
        );
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<()> {
        if self.subscriptions.is_empty() {
            return Err(IngestError::Connection(format!(
                "{}: nothing to subscribe",
                self.label
            )));
        }
        let requests: Vec<String> = self
            .subscriptions
            .chunks(self.settings.chunk_size)
            .enumerate()
            .map(|(i, chunk)| self.dialect.subscribe_request(chunk, self.next_request_id + i as u64))
            .collect();
        self.next_request_id += requests.len() as u64;

        let total = requests.len();
        for (i, request) in requests.into_iter().enumerate() {
            self.transport()?.send_text(request).await?;
            self.await_ack().await?;
            if i + 1 < total && !self.settings.chunk_pause.is_zero() {
                sleep(self.settings.chunk_pause).await;
            }
        }
        info(
            Domain::Feed,
            "subscribed",
            obj(&[
                ("pipeline", v_str(&self.label)),
                ("channels", v_num(self.subscriptions.len() as f64)),
                ("requests", v_num(total as f64)),
            ]),
        );
        Ok(())
    }

    async fn receive(&mut self) -> Result<Frame> {
        let keepalive = self.dialect.keepalive();
        let interval = self.settings.keepalive_interval.min(self.settings.idle_timeout);
        let idle_timeout = self.settings.idle_timeout;
        let market = self.market;
        let mut quiet = Duration::ZERO;
        loop {
            let t = self.transport()?;
            match timeout(interval, t.next_message()).await {
                Ok(Ok(Inbound::Text(text))) => {
                    if text.trim() == "ping" {
                        t.send_text("pong".to_string()).await?;
                        return Ok(Frame::Control);
                    }
                    return Ok(self.dialect.classify(&text, market));
                }
                Ok(Ok(Inbound::Heartbeat)) => return Ok(Frame::Control),
                Ok(Ok(Inbound::Closed)) => return Ok(Frame::Closed),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    quiet += interval;
                    if quiet >= idle_timeout {
                        return Err(IngestError::Connection(format!(
                            "{}: idle for {}s",
                            self.label,
                            quiet.as_secs()
                        )));
                    }
                    match keepalive {
                        Keepalive::Text(ping) => t.send_text(ping.to_string()).await?,
                        Keepalive::Frame => t.send_ping().await?,
                    }
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut t) = self.transport.take() {
            t.close().await;
        }
    }

    fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }
}
