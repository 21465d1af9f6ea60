use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::IngestError;

/// Column order shared by every sink.
pub const SCHEMA_COLUMNS: [&str; 10] = [
    "exchange",
    "market",
    "symbol",
    "side",
    "qty",
    "price",
    "notional",
    "ts_exch_ms",
    "ts_ingest_ms",
    "raw",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Okx,
    Aster,
    Hyperliquid,
}

impl Exchange {
    pub const ALL: [Exchange; 5] = [
        Exchange::Binance,
        Exchange::Bybit,
        Exchange::Okx,
        Exchange::Aster,
        Exchange::Hyperliquid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Okx => "okx",
            Exchange::Aster => "aster",
            Exchange::Hyperliquid => "hyperliquid",
        }
    }

    pub fn markets(&self) -> &'static [Market] {
        match self {
            Exchange::Binance | Exchange::Bybit | Exchange::Okx => &[Market::Usdt, Market::Coin],
            Exchange::Aster => &[Market::Usdt],
            Exchange::Hyperliquid => &[Market::Usdc],
        }
    }

    pub fn supports(&self, market: Market) -> bool {
        self.markets().contains(&market)
    }

    /// True for sources read from local files rather than a live feed.
    pub fn is_log_source(&self) -> bool {
        matches!(self, Exchange::Hyperliquid)
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "bybit" => Ok(Exchange::Bybit),
            "okx" => Ok(Exchange::Okx),
            "aster" => Ok(Exchange::Aster),
            "hyperliquid" | "hl" => Ok(Exchange::Hyperliquid),
            other => Err(IngestError::Configuration(format!("unknown exchange '{}'", other))),
        }
    }
}

/// Margin category of a derivatives market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Usdt,
    Coin,
    Usdc,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Usdt => "usdt",
            Market::Coin => "coin",
            Market::Usdc => "usdc",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Market {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "usdt" | "usdtm" | "linear" => Ok(Market::Usdt),
            "coin" | "coinm" | "inverse" => Ok(Market::Coin),
            "usdc" => Ok(Market::Usdc),
            other => Err(IngestError::Configuration(format!("unknown market '{}'", other))),
        }
    }
}

/// Which position was forcibly closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawFormat {
    #[default]
    Compact,
    Pretty,
}

impl RawFormat {
    pub fn render(&self, raw: &Value) -> String {
        let rendered = match self {
            RawFormat::Compact => serde_json::to_string(raw),
            RawFormat::Pretty => serde_json::to_string_pretty(raw),
        };
        rendered.unwrap_or_else(|_| "{}".to_string())
    }
}

impl FromStr for RawFormat {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compact" => Ok(RawFormat::Compact),
            "pretty" => Ok(RawFormat::Pretty),
            other => Err(IngestError::Configuration(format!("unknown raw format '{}'", other))),
        }
    }
}

/// Context an adapter attaches to a record when the wire format keeps it
/// outside the record itself (parent instrument id, envelope timestamp).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordContext {
    pub symbol: Option<String>,
    pub ts_ms: Option<i64>,
}

/// One exchange-native liquidation record, still in wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub payload: Value,
    pub context: RecordContext,
}

impl RawRecord {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            context: RecordContext::default(),
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.context.symbol = Some(symbol.into());
        self
    }

    pub fn with_ts(mut self, ts_ms: Option<i64>) -> Self {
        self.context.ts_ms = ts_ms;
        self
    }
}

/// Unified liquidation event. Fields are private so `notional` can only come
/// from `price * qty`.
#[derive(Debug, Clone, PartialEq)]
pub struct LiquidationEvent {
    exchange: Exchange,
    market: Market,
    symbol: String,
    side: Side,
    qty: f64,
    price: f64,
    notional: f64,
    ts_exch_ms: i64,
    ts_ingest_ms: i64,
    raw: Value,
}

impl LiquidationEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Exchange,
        market: Market,
        symbol: String,
        side: Side,
        qty: f64,
        price: f64,
        ts_exch_ms: i64,
        ts_ingest_ms: i64,
        raw: Value,
    ) -> Self {
        Self {
            exchange,
            market,
            symbol,
            side,
            qty,
            price,
            notional: price * qty,
            ts_exch_ms,
            ts_ingest_ms,
            raw,
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn market(&self) -> Market {
        self.market
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn qty(&self) -> f64 {
        self.qty
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn notional(&self) -> f64 {
        self.notional
    }

    pub fn ts_exch_ms(&self) -> i64 {
        self.ts_exch_ms
    }

    pub fn ts_ingest_ms(&self) -> i64 {
        self.ts_ingest_ms
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Row in `SCHEMA_COLUMNS` order.
    pub fn to_row(&self, raw_format: RawFormat) -> [String; 10] {
        [
            self.exchange.as_str().to_string(),
            self.market.as_str().to_string(),
            self.symbol.clone(),
            self.side.as_str().to_string(),
            self.qty.to_string(),
            self.price.to_string(),
            self.notional.to_string(),
            self.ts_exch_ms.to_string(),
            self.ts_ingest_ms.to_string(),
            raw_format.render(&self.raw),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_exchange_and_market() {
        assert_eq!("Binance".parse::<Exchange>().unwrap(), Exchange::Binance);
        assert_eq!("coinm".parse::<Market>().unwrap(), Market::Coin);
        assert!(matches!(
            "kraken".parse::<Exchange>(),
            Err(IngestError::Configuration(_))
        ));
        assert!(matches!("eur".parse::<Market>(), Err(IngestError::Configuration(_))));
    }

    #[test]
    fn test_supported_markets() {
        assert!(Exchange::Aster.supports(Market::Usdt));
        assert!(!Exchange::Aster.supports(Market::Coin));
        assert!(Exchange::Hyperliquid.supports(Market::Usdc));
        assert!(!Exchange::Okx.supports(Market::Usdc));
    }

    #[test]
    fn test_notional_is_computed() {
        let ev = LiquidationEvent::new(
            Exchange::Okx,
            Market::Usdt,
            "BTC-USDT-SWAP".to_string(),
            Side::Short,
            3.0,
            0.1,
            1,
            2,
            json!({}),
        );
        assert_eq!(ev.notional(), 0.1 * 3.0);
    }

    #[test]
    fn test_row_keeps_column_order_and_raw_key_order() {
        let ev = LiquidationEvent::new(
            Exchange::Binance,
            Market::Coin,
            "BTCUSD_PERP".to_string(),
            Side::Long,
            2.0,
            100.0,
            10,
            20,
            json!({"z": 1, "a": 2}),
        );
        let row = ev.to_row(RawFormat::Compact);
        assert_eq!(row[0], "binance");
        assert_eq!(row[1], "coin");
        assert_eq!(row[3], "long");
        assert_eq!(row[6], "200");
        assert_eq!(row[9], r#"{"z":1,"a":2}"#);
    }
}
