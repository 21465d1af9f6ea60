use serde::Deserialize;
use serde_json::{json, Value};

use super::ws::{Dialect, Keepalive};
use super::Frame;
use crate::event::{Exchange, Market, RawRecord};
use crate::normalize::int_field;

pub const ENDPOINT: &str = "wss://ws.okx.com:8443/ws/v5/public";
pub const LIQUIDATION_CHANNEL: &str = "liquidation-orders";

/// One all-instruments swap liquidation channel, split by settlement suffix.
pub struct OkxDialect;

#[derive(Debug, Deserialize)]
struct Envelope {
    event: Option<String>,
    msg: Option<String>,
    #[serde(default)]
    data: Vec<Value>,
}

/// USDT- and USDC-settled swaps are linear; `-USD-SWAP` is coin margined.
pub fn matches_market(inst_id: &str, market: Market) -> bool {
    let id = inst_id.to_uppercase();
    match market {
        Market::Usdt => id.ends_with("-USDT-SWAP") || id.ends_with("-USDC-SWAP"),
        Market::Coin => id.ends_with("-USD-SWAP"),
        Market::Usdc => false,
    }
}

impl Dialect for OkxDialect {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    fn endpoint(&self, _market: Market) -> String {
        ENDPOINT.to_string()
    }

    fn fixed_channels(&self, _market: Market) -> Vec<String> {
        vec![LIQUIDATION_CHANNEL.to_string()]
    }

    fn subscribe_request(&self, channels: &[String], _request_id: u64) -> String {
        let args: Vec<Value> = channels
            .iter()
            .map(|c| json!({"channel": c, "instType": "SWAP"}))
            .collect();
        json!({"op": "subscribe", "args": args}).to_string()
    }

    fn classify(&self, text: &str, market: Market) -> Frame {
        if text.trim() == "pong" {
            return Frame::Control;
        }
        let env: Envelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(_) => return Frame::Control,
        };
        match env.event.as_deref() {
            Some("subscribe") => return Frame::Ack,
            Some("error") => return Frame::Rejected(env.msg.unwrap_or_default()),
            Some(_) => return Frame::Control,
            None => {}
        }
        let mut records = Vec::new();
        for row in env.data {
            let inst_id = match row.get("instId").and_then(Value::as_str) {
                Some(id) if matches_market(id, market) => id.to_string(),
                _ => continue,
            };
            let parent_ts = int_field(&row, "ts");
            if let Some(Value::Array(details)) = row.get("details") {
                for d in details {
                    records.push(
                        RawRecord::new(d.clone())
                            .with_symbol(inst_id.clone())
                            .with_ts(parent_ts),
                    );
                }
            }
        }
        if records.is_empty() {
            Frame::Control
        } else {
            Frame::Records(records)
        }
    }

    fn keepalive(&self) -> Keepalive {
        Keepalive::Text("ping")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_filter_separates_margin_categories() {
        assert!(matches_market("BTC-USDT-SWAP", Market::Usdt));
        assert!(matches_market("ETH-USDC-SWAP", Market::Usdt));
        assert!(!matches_market("BTC-USD-SWAP", Market::Usdt));
        assert!(matches_market("BTC-USD-SWAP", Market::Coin));
        assert!(!matches_market("BTC-USDT-SWAP", Market::Coin));
    }

    #[test]
    fn details_become_records_with_parent_instrument() {
        let msg = json!({
            "arg": {"channel": "liquidation-orders", "instType": "SWAP"},
            "data": [
                {"instId": "BTC-USDT-SWAP", "details": [
                    {"bkPx": "60000", "posSide": "long", "side": "sell", "sz": "2", "ts": "1710000000000"},
                    {"bkPx": "60010", "posSide": "short", "side": "buy", "sz": "1", "ts": "1710000000001"}
                ]},
                {"instId": "BTC-USD-SWAP", "details": [
                    {"bkPx": "60000", "posSide": "long", "side": "sell", "sz": "5", "ts": "1710000000002"}
                ]}
            ]
        })
        .to_string();
        match OkxDialect.classify(&msg, Market::Usdt) {
            Frame::Records(r) => {
                assert_eq!(r.len(), 2);
                assert_eq!(r[0].context.symbol.as_deref(), Some("BTC-USDT-SWAP"));
                assert_eq!(r[1].payload["sz"], "1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn events_and_pong() {
        assert_eq!(OkxDialect.classify("pong", Market::Usdt), Frame::Control);
        assert_eq!(
            OkxDialect.classify(r#"{"event":"subscribe","arg":{"channel":"liquidation-orders"}}"#, Market::Usdt),
            Frame::Ack
        );
        assert!(matches!(
            OkxDialect.classify(r#"{"event":"error","msg":"bad","code":"60012"}"#, Market::Usdt),
            Frame::Rejected(_)
        ));
    }
}
