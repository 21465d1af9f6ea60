use serde_json::{json, Value};

use super::ws::Dialect;
use super::Frame;
use crate::event::{Exchange, Market, RawRecord};

pub const FORCE_ORDER_CHANNEL: &str = "!forceOrder@arr";

/// Binance-compatible force-order feed. Aster speaks the same wire format.
pub struct BinanceDialect {
    exchange: Exchange,
    usdt_endpoint: &'static str,
    coin_endpoint: Option<&'static str>,
}

impl BinanceDialect {
    pub fn binance() -> Self {
        Self {
            exchange: Exchange::Binance,
            usdt_endpoint: "wss://fstream.binance.com/ws",
            coin_endpoint: Some("wss://dstream.binance.com/ws"),
        }
    }

    pub fn aster() -> Self {
        Self {
            exchange: Exchange::Aster,
            usdt_endpoint: "wss://fstream.asterdex.com/ws",
            coin_endpoint: None,
        }
    }
}

fn is_force_order(v: &Value) -> bool {
    v.get("e").and_then(Value::as_str) == Some("forceOrder") || v.get("o").map(Value::is_object).unwrap_or(false)
}

impl Dialect for BinanceDialect {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    fn endpoint(&self, market: Market) -> String {
        match market {
            Market::Coin => self.coin_endpoint.unwrap_or(self.usdt_endpoint).to_string(),
            _ => self.usdt_endpoint.to_string(),
        }
    }

    fn fixed_channels(&self, _market: Market) -> Vec<String> {
        vec![FORCE_ORDER_CHANNEL.to_string()]
    }

    fn subscribe_request(&self, channels: &[String], request_id: u64) -> String {
        json!({"method": "SUBSCRIBE", "params": channels, "id": request_id}).to_string()
    }

    fn classify(&self, text: &str, _market: Market) -> Frame {
        let v: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return Frame::Control,
        };
        // {"result":null,"id":1} acknowledges a SUBSCRIBE
        if v.get("id").is_some() && v.get("result").is_some() {
            return Frame::Ack;
        }
        if let Some(err) = v.get("error") {
            return Frame::Rejected(err.to_string());
        }
        // Combined-stream envelopes wrap the event in "data"
        let body = v.get("data").cloned().unwrap_or(v);
        let events: Vec<Value> = match body {
            Value::Array(items) => items,
            other => vec![other],
        };
        let records: Vec<RawRecord> = events
            .into_iter()
            .filter(is_force_order)
            .map(RawRecord::new)
            .collect();
        if records.is_empty() {
            Frame::Control
        } else {
            Frame::Records(records)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_per_market() {
        let b = BinanceDialect::binance();
        assert_eq!(b.endpoint(Market::Usdt), "wss://fstream.binance.com/ws");
        assert_eq!(b.endpoint(Market::Coin), "wss://dstream.binance.com/ws");
        assert_eq!(BinanceDialect::aster().endpoint(Market::Usdt), "wss://fstream.asterdex.com/ws");
    }

    #[test]
    fn subscribe_request_names_the_channel() {
        let b = BinanceDialect::binance();
        let req: Value = serde_json::from_str(&b.subscribe_request(&b.fixed_channels(Market::Usdt), 7)).unwrap();
        assert_eq!(req["method"], "SUBSCRIBE");
        assert_eq!(req["params"][0], FORCE_ORDER_CHANNEL);
        assert_eq!(req["id"], 7);
    }

    #[test]
    fn classifies_force_order_and_ack() {
        let b = BinanceDialect::binance();
        assert_eq!(b.classify(r#"{"result":null,"id":1}"#, Market::Usdt), Frame::Ack);
        let msg = r#"{"e":"forceOrder","E":1,"o":{"s":"BTCUSDT","S":"SELL","q":"1","p":"2"}}"#;
        match b.classify(msg, Market::Usdt) {
            Frame::Records(r) => {
                assert_eq!(r.len(), 1);
                assert_eq!(r[0].payload["o"]["s"], "BTCUSDT");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(b.classify(r#"{"e":"markPriceUpdate"}"#, Market::Usdt), Frame::Control);
        assert_eq!(b.classify("not json", Market::Usdt), Frame::Control);
    }
}
