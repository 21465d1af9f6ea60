#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use liqstream::error::Result;
use liqstream::event::LiquidationEvent;
use liqstream::feed::transport::{Connector, Inbound, Transport};
use liqstream::retry::RetryConfig;
use liqstream::sink::Sink;

pub type Journal = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Clone)]
pub enum Step {
    Send(String),
    Close,
}

/// Connector whose sessions replay fixed scripts. Every subscribe request is
/// acknowledged immediately; once a script runs out the session goes quiet.
pub struct ScriptedConnector {
    sessions: Mutex<VecDeque<Vec<Step>>>,
    ack: String,
    journal: Journal,
}

impl ScriptedConnector {
    pub fn new(sessions: Vec<Vec<Step>>, ack: &str, journal: Journal) -> Self {
        Self {
            sessions: Mutex::new(sessions.into_iter().collect()),
            ack: ack.to_string(),
            journal,
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn Transport>> {
        let script = self.sessions.lock().unwrap().pop_front().unwrap_or_default();
        self.journal.lock().unwrap().push(format!("connect {}", url));
        Ok(Box::new(ScriptedTransport {
            acks: VecDeque::new(),
            script: script.into_iter().collect(),
            ack: self.ack.clone(),
            journal: self.journal.clone(),
        }))
    }
}

struct ScriptedTransport {
    acks: VecDeque<String>,
    script: VecDeque<Step>,
    ack: String,
    journal: Journal,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if text.contains("ubscribe") || text.contains("SUBSCRIBE") {
            let v: serde_json::Value = serde_json::from_str(&text).unwrap();
            let channels = v
                .get("args")
                .or_else(|| v.get("params"))
                .and_then(|a| a.as_array())
                .map(|a| {
                    a.iter()
                        .map(|c| c.as_str().map(String::from).unwrap_or_else(|| c.to_string()))
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default();
            self.journal.lock().unwrap().push(format!("subscribe {}", channels));
            self.acks.push_back(self.ack.clone());
        }
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Inbound> {
        if let Some(ack) = self.acks.pop_front() {
            return Ok(Inbound::Text(ack));
        }
        match self.script.pop_front() {
            Some(Step::Send(text)) => Ok(Inbound::Text(text)),
            Some(Step::Close) => Ok(Inbound::Closed),
            None => futures_util::future::pending().await,
        }
    }

    async fn close(&mut self) {}
}

/// Sink that records every event it sees and logs it to the journal.
pub struct RecordingSink {
    pub events: Mutex<Vec<LiquidationEvent>>,
    journal: Journal,
}

impl RecordingSink {
    pub fn new(journal: Journal) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            journal,
        }
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn write(&self, event: Arc<LiquidationEvent>) -> Result<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("event {}", event.symbol()));
        self.events.lock().unwrap().push((*event).clone());
        Ok(())
    }
}

pub fn fast_reconnect() -> RetryConfig {
    RetryConfig {
        max_retries: u32::MAX,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter_factor: 0.0,
    }
}

/// Poll `cond` every 10ms for up to 5s.
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
