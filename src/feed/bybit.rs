use serde::Deserialize;
use serde_json::{json, Value};

use super::ws::{Dialect, Keepalive};
use super::Frame;
use crate::event::{Exchange, Market, RawRecord};

pub const TOPIC_PREFIX: &str = "liquidation.";

/// Per-symbol liquidation topics; symbols come from REST discovery.
pub struct BybitDialect;

#[derive(Debug, Deserialize)]
struct Envelope {
    op: Option<String>,
    success: Option<bool>,
    ret_msg: Option<String>,
    topic: Option<String>,
    ts: Option<i64>,
    data: Option<Value>,
}

pub fn category(market: Market) -> &'static str {
    match market {
        Market::Coin => "inverse",
        _ => "linear",
    }
}

impl Dialect for BybitDialect {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn endpoint(&self, market: Market) -> String {
        format!("wss://stream.bybit.com/v5/public/{}", category(market))
    }

    fn symbol_channel(&self, symbol: &str) -> String {
        format!("{}{}", TOPIC_PREFIX, symbol)
    }

    fn subscribe_request(&self, channels: &[String], request_id: u64) -> String {
        json!({"op": "subscribe", "req_id": request_id.to_string(), "args": channels}).to_string()
    }

    fn classify(&self, text: &str, _market: Market) -> Frame {
        let env: Envelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(_) => return Frame::Control,
        };
        match env.op.as_deref() {
            Some("subscribe") => {
                return if env.success.unwrap_or(false) {
                    Frame::Ack
                } else {
                    Frame::Rejected(env.ret_msg.unwrap_or_default())
                }
            }
            Some(_) => return Frame::Control,
            None => {}
        }
        let topic = env.topic.unwrap_or_default();
        if !topic.starts_with(TOPIC_PREFIX) {
            return Frame::Control;
        }
        let topic_symbol = topic[TOPIC_PREFIX.len()..].to_string();
        let items = match env.data {
            Some(Value::Array(items)) => items,
            Some(obj @ Value::Object(_)) => vec![obj],
            _ => return Frame::Control,
        };
        let records: Vec<RawRecord> = items
            .into_iter()
            .map(|mut item| {
                if item.get("symbol").is_none() {
                    if let Value::Object(map) = &mut item {
                        map.insert("symbol".to_string(), Value::String(topic_symbol.clone()));
                    }
                }
                RawRecord::new(item).with_ts(env.ts)
            })
            .collect();
        if records.is_empty() {
            Frame::Control
        } else {
            Frame::Records(records)
        }
    }

    fn keepalive(&self) -> Keepalive {
        Keepalive::Text(r#"{"op":"ping"}"#)
    }
}
