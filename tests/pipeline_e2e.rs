mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{fast_reconnect, wait_for, RecordingSink, ScriptedConnector, Step};
use liqstream::event::{Market, Side};
use liqstream::feed::binance::BinanceDialect;
use liqstream::feed::bybit::BybitDialect;
use liqstream::feed::discovery::StaticSymbols;
use liqstream::feed::ws::{WsAdapter, WsSettings};
use liqstream::feed::Connector;
use liqstream::logging::ts_epoch_ms;
use liqstream::pipeline::run_pipeline;
use liqstream::sink::{Sink, SinkRouter};
use tokio::sync::watch;

const BYBIT_ACK: &str = r#"{"success":true,"ret_msg":"","op":"subscribe"}"#;
const BINANCE_ACK: &str = r#"{"result":null,"id":1}"#;

fn settings(chunk: usize) -> WsSettings {
    WsSettings {
        chunk_size: chunk,
        chunk_pause: Duration::ZERO,
        ack_timeout: Duration::from_millis(500),
        keepalive_interval: Duration::from_secs(20),
        idle_timeout: Duration::from_secs(60),
    }
}

fn bybit_liquidation(symbol: &str, side: &str) -> String {
    format!(
        r#"{{"topic":"liquidation.{s}","type":"snapshot","ts":1710000000000,"data":{{"updatedTime":1710000000000,"symbol":"{s}","side":"{side}","size":"3","price":"2"}}}}"#,
        s = symbol,
        side = side
    )
}

#[tokio::test]
async fn resubscribes_every_symbol_before_events_after_a_drop() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let connector: Arc<dyn Connector> = Arc::new(ScriptedConnector::new(
        vec![
            vec![Step::Send(bybit_liquidation("AUSDT", "Sell")), Step::Close],
            vec![Step::Send(bybit_liquidation("CUSDT", "Buy"))],
        ],
        BYBIT_ACK,
        journal.clone(),
    ));
    let adapter = WsAdapter::new(Box::new(BybitDialect), Market::Usdt, connector, settings(2)).with_discovery(
        Box::new(StaticSymbols(vec!["AUSDT".into(), "BUSDT".into(), "CUSDT".into()])),
    );
    let recorder = Arc::new(RecordingSink::new(journal.clone()));
    let router = Arc::new(SinkRouter::new(vec![recorder.clone() as Arc<dyn Sink>]));
    let (stop_tx, stop_rx) = watch::channel(false);

    let handle = tokio::spawn(run_pipeline(Box::new(adapter), router, fast_reconnect(), stop_rx));
    assert!(wait_for(|| recorder.count() == 2).await, "both events routed");
    stop_tx.send(true).unwrap();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.events, 2);
    assert_eq!(report.reconnects, 1);

    let journal = journal.lock().unwrap().clone();
    let connects: Vec<usize> = journal
        .iter()
        .enumerate()
        .filter(|(_, l)| l.starts_with("connect "))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(connects.len(), 2, "journal: {:?}", journal);

    // Each session subscribes all three symbols, in chunks of at most two,
    // before the session's first event.
    for (n, &start) in connects.iter().enumerate() {
        let end = connects.get(n + 1).copied().unwrap_or(journal.len());
        let session = &journal[start + 1..end];
        let first_event = session
            .iter()
            .position(|l| l.starts_with("event "))
            .expect("event in session");
        let mut subscribed = Vec::new();
        for line in &session[..first_event] {
            if let Some(channels) = line.strip_prefix("subscribe ") {
                let chunk: Vec<&str> = channels.split(',').collect();
                assert!(chunk.len() <= 2, "chunk too large: {}", line);
                subscribed.extend(chunk.into_iter().map(String::from));
            }
        }
        subscribed.sort();
        assert_eq!(
            subscribed,
            vec!["liquidation.AUSDT", "liquidation.BUSDT", "liquidation.CUSDT"]
        );
    }

    let events = recorder.events.lock().unwrap();
    assert_eq!(events[0].side(), Side::Long);
    assert_eq!(events[1].side(), Side::Short);
}

#[tokio::test]
async fn forced_sell_becomes_long_with_local_ingest_time() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let force_order = r#"{"e":"forceOrder","E":1600000000000,"o":{"s":"BTCUSDT","S":"SELL","o":"LIMIT","q":"0.25","p":"40000","ap":"40100","l":"0.25","z":"0.25","T":1600000000000}}"#;
    let connector: Arc<dyn Connector> = Arc::new(ScriptedConnector::new(
        vec![vec![Step::Send(force_order.to_string())]],
        BINANCE_ACK,
        journal.clone(),
    ));
    let adapter = WsAdapter::new(Box::new(BinanceDialect::binance()), Market::Usdt, connector, settings(100));
    let recorder = Arc::new(RecordingSink::new(journal.clone()));
    let router = Arc::new(SinkRouter::new(vec![recorder.clone() as Arc<dyn Sink>]));
    let (stop_tx, stop_rx) = watch::channel(false);

    let before = ts_epoch_ms();
    let handle = tokio::spawn(run_pipeline(Box::new(adapter), router, fast_reconnect(), stop_rx));
    assert!(wait_for(|| recorder.count() == 1).await);
    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let events = recorder.events.lock().unwrap();
    let e = &events[0];
    assert_eq!(e.side(), Side::Long);
    assert_eq!(e.price(), 40100.0);
    assert_eq!(e.qty(), 0.25);
    assert_eq!(e.notional(), e.price() * e.qty());
    assert_eq!(e.ts_exch_ms(), 1_600_000_000_000);
    assert!(e.ts_ingest_ms() >= before);
    assert!(e.ts_ingest_ms() <= ts_epoch_ms());
}

#[tokio::test]
async fn malformed_records_are_dropped_not_fatal() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let bad_side = bybit_liquidation("AUSDT", "Hold");
    let connector: Arc<dyn Connector> = Arc::new(ScriptedConnector::new(
        vec![vec![
            Step::Send(bad_side),
            Step::Send("not json at all".to_string()),
            Step::Send(bybit_liquidation("AUSDT", "Sell")),
        ]],
        BYBIT_ACK,
        journal.clone(),
    ));
    let adapter = WsAdapter::new(Box::new(BybitDialect), Market::Usdt, connector, settings(10))
        .with_discovery(Box::new(StaticSymbols(vec!["AUSDT".into()])));
    let recorder = Arc::new(RecordingSink::new(journal.clone()));
    let router = Arc::new(SinkRouter::new(vec![recorder.clone() as Arc<dyn Sink>]));
    let (stop_tx, stop_rx) = watch::channel(false);

    let handle = tokio::spawn(run_pipeline(Box::new(adapter), router, fast_reconnect(), stop_rx));
    assert!(wait_for(|| recorder.count() == 1).await);
    stop_tx.send(true).unwrap();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.events, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.reconnects, 0);
}

#[tokio::test]
async fn empty_discovery_fails_only_that_pipeline() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let connector: Arc<dyn Connector> = Arc::new(ScriptedConnector::new(vec![], BYBIT_ACK, journal.clone()));
    let adapter = WsAdapter::new(Box::new(BybitDialect), Market::Coin, connector, settings(10))
        .with_discovery(Box::new(StaticSymbols(Vec::new())));
    let router = Arc::new(SinkRouter::new(Vec::new()));
    let (_stop_tx, stop_rx) = watch::channel(false);

    let err = run_pipeline(Box::new(adapter), router, fast_reconnect(), stop_rx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "discovery");
    assert!(journal.lock().unwrap().is_empty(), "never connected");
}

#[tokio::test]
async fn quiet_connection_is_dropped_and_reopened() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let connector: Arc<dyn Connector> = Arc::new(ScriptedConnector::new(
        vec![vec![], vec![Step::Send(bybit_liquidation("AUSDT", "Sell"))]],
        BYBIT_ACK,
        journal.clone(),
    ));
    let quiet = WsSettings {
        keepalive_interval: Duration::from_millis(50),
        idle_timeout: Duration::from_millis(200),
        ..settings(10)
    };
    let adapter = WsAdapter::new(Box::new(BybitDialect), Market::Usdt, connector, quiet)
        .with_discovery(Box::new(StaticSymbols(vec!["AUSDT".into()])));
    let recorder = Arc::new(RecordingSink::new(journal.clone()));
    let router = Arc::new(SinkRouter::new(vec![recorder.clone() as Arc<dyn Sink>]));
    let (stop_tx, stop_rx) = watch::channel(false);

    let handle = tokio::spawn(run_pipeline(Box::new(adapter), router, fast_reconnect(), stop_rx));
    assert!(wait_for(|| recorder.count() == 1).await, "event from the second session");
    stop_tx.send(true).unwrap();
    let report = handle.await.unwrap().unwrap();
    assert!(report.reconnects >= 1);
    assert_eq!(report.events, 1);

    let journal = journal.lock().unwrap().clone();
    let connects = journal.iter().filter(|l| l.starts_with("connect ")).count();
    assert!(connects >= 2, "journal: {:?}", journal);
}

#[tokio::test]
async fn rejected_subscription_backs_off_and_resubscribes() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let connector: Arc<dyn Connector> = Arc::new(ScriptedConnector::new(
        vec![vec![Step::Send(bybit_liquidation("AUSDT", "Sell"))]],
        r#"{"success":false,"ret_msg":"error:handler not found","op":"subscribe"}"#,
        journal.clone(),
    ));
    let adapter = WsAdapter::new(Box::new(BybitDialect), Market::Usdt, connector, settings(10))
        .with_discovery(Box::new(StaticSymbols(vec!["AUSDT".into()])));
    let recorder = Arc::new(RecordingSink::new(journal.clone()));
    let router = Arc::new(SinkRouter::new(vec![recorder.clone() as Arc<dyn Sink>]));
    let (stop_tx, stop_rx) = watch::channel(false);

    let handle = tokio::spawn(run_pipeline(Box::new(adapter), router, fast_reconnect(), stop_rx));
    let seen = journal.clone();
    assert!(
        wait_for(|| {
            seen.lock()
                .unwrap()
                .iter()
                .filter(|l| l.starts_with("subscribe "))
                .count()
                >= 2
        })
        .await
    );
    stop_tx.send(true).unwrap();
    let report = handle.await.unwrap().unwrap();
    assert!(report.reconnects >= 1);
    assert_eq!(report.events, 0, "nothing streams on a rejected subscription");
}
