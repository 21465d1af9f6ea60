use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::Duration;

use super::bybit::category;
use crate::error::{IngestError, Result};
use crate::event::Market;
use crate::logging::{debug, obj, v_num, v_str, Domain};
use crate::retry::{is_retryable_http_error, is_retryable_network_error, retry_async, Permanent, RetryConfig};

/// Source of the symbol list for per-symbol venues.
#[async_trait]
pub trait SymbolSource: Send + Sync {
    async fn fetch(&self, market: Market) -> Result<Vec<String>>;
}

/// Fixed symbol list, for pinned deployments and tests.
pub struct StaticSymbols(pub Vec<String>);

#[async_trait]
impl SymbolSource for StaticSymbols {
    async fn fetch(&self, _market: Market) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InstrumentsResponse {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<InstrumentsResult>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InstrumentsResult {
    #[serde(default)]
    list: Vec<Instrument>,
    #[serde(default)]
    next_page_cursor: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Instrument {
    symbol: String,
    #[serde(default)]
    status: Option<String>,
}

/// Parse one page of `/v5/market/instruments-info`: trading symbols plus the next cursor.
pub fn parse_instruments_page(body: &str) -> anyhow::Result<(Vec<String>, Option<String>)> {
    let resp: InstrumentsResponse = serde_json::from_str(body)?;
    if resp.ret_code != 0 {
        return Err(anyhow!("retCode {}: {}", resp.ret_code, resp.ret_msg));
    }
    let result = resp.result.ok_or_else(|| anyhow!("missing result"))?;
    let symbols = result
        .list
        .into_iter()
        .filter(|i| i.status.as_deref().map(|s| s == "Trading").unwrap_or(true))
        .map(|i| i.symbol)
        .filter(|s| !s.is_empty())
        .collect();
    let cursor = result.next_page_cursor.filter(|c| !c.is_empty());
    Ok((symbols, cursor))
}

/// Non-2xx responses: throttling and server errors are retried, the rest are permanent.
pub fn check_status(status: u16) -> anyhow::Result<()> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    if is_retryable_http_error(status) {
        return Err(anyhow!("instruments-info HTTP {}", status));
    }
    Err(Permanent(format!("instruments-info HTTP {}", status)).into())
}

/// Bybit instrument listing over REST, following `nextPageCursor`.
pub struct BybitInstruments {
    client: Client,
    base: String,
    retry: RetryConfig,
}

const PAGE_LIMIT: u32 = 1000;
const MAX_PAGES: usize = 50;

impl BybitInstruments {
    pub fn new(base: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| IngestError::Configuration(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            retry: RetryConfig::default(),
        })
    }

    async fn fetch_page(&self, category: &str, cursor: Option<&str>) -> anyhow::Result<(Vec<String>, Option<String>)> {
        let url = format!("{}/v5/market/instruments-info", self.base);
        let limit = PAGE_LIMIT.to_string();
        let mut query: Vec<(&str, &str)> = vec![("category", category), ("limit", limit.as_str())];
        if let Some(c) = cursor {
            query.push(("cursor", c));
        }
        let resp = self.client.get(&url).query(&query).send().await.map_err(|e| {
            if is_retryable_network_error(&e) {
                anyhow!("instruments-info request: {}", e)
            } else {
                Permanent(format!("instruments-info request: {}", e)).into()
            }
        })?;
        check_status(resp.status().as_u16())?;
        let body = resp.text().await?;
        parse_instruments_page(&body)
    }
}

#[async_trait]
impl SymbolSource for BybitInstruments {
    async fn fetch(&self, market: Market) -> Result<Vec<String>> {
        let category = category(market);
        let mut symbols = Vec::new();
        let mut cursor: Option<String> = None;
        for page in 0..MAX_PAGES {
            let (batch, next) = retry_async(&self.retry, "bybit_instruments", || {
                self.fetch_page(category, cursor.as_deref())
            })
            .await
            .map_err(|e| IngestError::Discovery(format!("bybit {}: {}", category, e)))?;
            debug(
                Domain::Feed,
                "instruments_page",
                obj(&[
                    ("exchange", v_str("bybit")),
                    ("category", v_str(category)),
                    ("page", v_num(page as f64)),
                    ("count", v_num(batch.len() as f64)),
                ]),
            );
            symbols.extend(batch);
            match next {
                Some(c) if Some(&c) != cursor.as_ref() => cursor = Some(c),
                _ => break,
            }
        }
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_trading_symbols_and_cursor() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"category":"linear","list":[
            {"symbol":"BTCUSDT","status":"Trading"},
            {"symbol":"XYZUSDT","status":"PreLaunch"},
            {"symbol":"ETHUSDT","status":"Trading"}
        ],"nextPageCursor":"abc"}}"#;
        let (symbols, cursor) = parse_instruments_page(body).unwrap();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cursor.as_deref(), Some("abc"));
    }

    #[test]
    fn empty_cursor_ends_pagination() {
        let body = r#"{"retCode":0,"result":{"list":[],"nextPageCursor":""}}"#;
        let (symbols, cursor) = parse_instruments_page(body).unwrap();
        assert!(symbols.is_empty());
        assert!(cursor.is_none());
    }

    #[test]
    fn error_code_is_reported() {
        let body = r#"{"retCode":10001,"retMsg":"params error","result":null}"#;
        assert!(parse_instruments_page(body).is_err());
    }

    async fn attempts_for_status(status: u16) -> (bool, u32) {
        let retry = RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_factor: 0.0,
        };
        let mut attempts = 0u32;
        let result = retry_async(&retry, "instruments", || {
            attempts += 1;
            futures_util::future::ready(check_status(status))
        })
        .await;
        (result.is_ok(), attempts)
    }

    #[tokio::test]
    async fn client_errors_fail_after_one_attempt() {
        assert_eq!(attempts_for_status(404).await, (false, 1));
        assert_eq!(attempts_for_status(403).await, (false, 1));
    }

    #[tokio::test]
    async fn throttling_and_server_errors_are_retried() {
        assert_eq!(attempts_for_status(429).await, (false, 4));
        assert_eq!(attempts_for_status(503).await, (false, 4));
        assert_eq!(attempts_for_status(200).await, (true, 1));
    }

    #[tokio::test]
    async fn static_symbols_pass_through() {
        let src = StaticSymbols(vec!["A".into(), "B".into()]);
        assert_eq!(src.fetch(Market::Usdt).await.unwrap().len(), 2);
    }
}
