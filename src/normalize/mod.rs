//! Maps exchange-native liquidation records onto `LiquidationEvent`.

use serde_json::Value;

use crate::error::{IngestError, Result};
use crate::event::{Exchange, LiquidationEvent, Market, RawRecord};
use crate::logging::ts_epoch_ms;

pub mod side;

/// Wall clock for `ts_ingest_ms` that never runs backwards within one pipeline.
#[derive(Debug, Default)]
pub struct IngestClock {
    last_ms: i64,
}

impl IngestClock {
    pub fn stamp(&mut self) -> i64 {
        self.observe(ts_epoch_ms())
    }

    fn observe(&mut self, now_ms: i64) -> i64 {
        if now_ms > self.last_ms {
            self.last_ms = now_ms;
        }
        self.last_ms
    }
}

/// Per-pipeline normalizer: fixed exchange/market tag plus the ingest clock.
#[derive(Debug)]
pub struct Normalizer {
    exchange: Exchange,
    market: Market,
    clock: IngestClock,
}

impl Normalizer {
    pub fn new(exchange: Exchange, market: Market) -> Self {
        Self {
            exchange,
            market,
            clock: IngestClock::default(),
        }
    }

    /// `Ok(None)` means the record is not a liquidation and is discarded.
    pub fn normalize(&mut self, record: &RawRecord) -> Result<Option<LiquidationEvent>> {
        let ts_ingest_ms = self.clock.stamp();
        map_record(self.exchange, self.market, record, ts_ingest_ms)
    }
}

/// Pure mapping of one record with a caller-supplied ingest time.
pub fn map_record(
    exchange: Exchange,
    market: Market,
    record: &RawRecord,
    ts_ingest_ms: i64,
) -> Result<Option<LiquidationEvent>> {
    let fields = match extract(exchange, record)? {
        Some(f) => f,
        None => return Ok(None),
    };
    let side = side::resolve(exchange, fields.side_source)
        .map_err(|v| IngestError::schema(format!("unrecognized side {}", v)))?;

    if !fields.price.is_finite() || fields.price <= 0.0 {
        return Err(IngestError::schema(format!("non-positive price {}", fields.price)));
    }
    if !fields.qty.is_finite() || fields.qty < 0.0 {
        return Err(IngestError::schema(format!("invalid qty {}", fields.qty)));
    }
    if fields.symbol.is_empty() {
        return Err(IngestError::schema("missing symbol"));
    }

    Ok(Some(LiquidationEvent::new(
        exchange,
        market,
        fields.symbol,
        side,
        fields.qty,
        fields.price,
        fields.ts_exch_ms,
        ts_ingest_ms,
        record.payload.clone(),
    )))
}

struct Fields<'a> {
    symbol: String,
    price: f64,
    qty: f64,
    ts_exch_ms: i64,
    side_source: &'a Value,
}

fn extract(exchange: Exchange, record: &RawRecord) -> Result<Option<Fields<'_>>> {
    let payload = &record.payload;
    match exchange {
        Exchange::Binance | Exchange::Aster => {
            let order = match payload.get("o") {
                Some(o) if o.is_object() => o,
                _ => return Ok(None),
            };
            let ts = int_field(payload, "E")
                .or_else(|| int_field(order, "T"))
                .or(record.context.ts_ms)
                .ok_or_else(|| IngestError::schema("missing event time"))?;
            Ok(Some(Fields {
                symbol: symbol_of(order.get("s").and_then(Value::as_str)),
                price: first_positive(order, &["ap", "p"]).unwrap_or(0.0),
                qty: required_qty(order, &["l", "z", "q"])?,
                ts_exch_ms: ts,
                side_source: order,
            }))
        }
        Exchange::Bybit => {
            let ts = int_field(payload, "updatedTimeE6")
                .map(|us| us / 1000)
                .or_else(|| int_field(payload, "updatedTime"))
                .or_else(|| int_field(payload, "ts"))
                .or_else(|| int_field(payload, "time"))
                .or(record.context.ts_ms)
                .ok_or_else(|| IngestError::schema("missing event time"))?;
            Ok(Some(Fields {
                symbol: symbol_of(payload.get("symbol").and_then(Value::as_str)),
                price: first_positive(payload, &["price"]).unwrap_or(0.0),
                qty: required_qty(payload, &["size"])?,
                ts_exch_ms: ts,
                side_source: payload,
            }))
        }
        Exchange::Okx => {
            let ts = int_field(payload, "ts")
                .or(record.context.ts_ms)
                .ok_or_else(|| IngestError::schema("missing event time"))?;
            Ok(Some(Fields {
                symbol: symbol_of(record.context.symbol.as_deref()),
                price: first_positive(payload, &["fillPx", "bkPx"]).unwrap_or(0.0),
                qty: required_qty(payload, &["sz"])?,
                ts_exch_ms: ts,
                side_source: payload,
            }))
        }
        Exchange::Hyperliquid => {
            if !payload.get("liquidation").map(Value::is_object).unwrap_or(false) {
                return Ok(None);
            }
            let ts = record
                .context
                .ts_ms
                .or_else(|| int_field(payload, "time"))
                .ok_or_else(|| IngestError::schema("missing event time"))?;
            let coin = payload.get("coin").and_then(Value::as_str).unwrap_or_default().trim();
            let qty = number(payload.get("sz"))
                .map(f64::abs)
                .ok_or_else(|| IngestError::schema("missing sz"))?;
            Ok(Some(Fields {
                symbol: if coin.is_empty() {
                    String::new()
                } else {
                    format!("{}USDC", coin.to_uppercase())
                },
                price: number(payload.get("px")).unwrap_or(0.0),
                qty,
                ts_exch_ms: ts,
                side_source: payload,
            }))
        }
    }
}

fn symbol_of(raw: Option<&str>) -> String {
    raw.map(|s| s.trim().to_uppercase()).unwrap_or_default()
}

/// Numbers arrive as JSON strings on most feeds.
pub(crate) fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub(crate) fn int_field(obj: &Value, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

fn first_positive(obj: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|k| number(obj.get(*k)))
        .find(|v| *v > 0.0)
}

fn required_qty(obj: &Value, keys: &[&str]) -> Result<f64> {
    if let Some(q) = first_positive(obj, keys) {
        return Ok(q);
    }
    keys.iter()
        .find_map(|k| number(obj.get(*k)))
        .ok_or_else(|| IngestError::schema(format!("missing quantity ({})", keys.join("/"))))
}
