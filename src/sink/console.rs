use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use colored::Colorize;

use super::Sink;
use crate::error::Result;
use crate::event::{LiquidationEvent, Side};

/// One human-readable line per event on stdout. Never fails.
pub struct ConsoleSink {
    color: bool,
}

impl ConsoleSink {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    pub fn format_line(&self, event: &LiquidationEvent) -> String {
        let side = event.side().as_str();
        let notional = format!("notional={}", event.notional());
        let (side, notional) = if self.color {
            let side = match event.side() {
                Side::Long => side.red().to_string(),
                Side::Short => side.green().to_string(),
            };
            (side, notional.dimmed().to_string())
        } else {
            (side.to_string(), notional)
        };
        format!(
            "[{}/{}] {} | {} | qty={} @ {} ({})",
            event.exchange(),
            event.market(),
            event.symbol(),
            side,
            event.qty(),
            event.price(),
            notional
        )
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn write(&self, event: Arc<LiquidationEvent>) -> Result<()> {
        let line = self.format_line(&event);
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", line);
        Ok(())
    }
}
