use std::sync::Arc;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};

use crate::event::{LiquidationEvent, RawFormat};

/// SQLite-backed liquidation table, written in batches.
pub struct LiquidationStore {
    conn: Connection,
    table: String,
}

fn check_table_name(table: &str) -> Result<()> {
    if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(anyhow!("invalid table name '{}'", table));
    }
    Ok(())
}

impl LiquidationStore {
    pub fn new(path: &str, table: &str) -> Result<Self> {
        check_table_name(table)?;
        Ok(Self {
            conn: Connection::open(path)?,
            table: table.to_string(),
        })
    }

    pub fn in_memory(table: &str) -> Result<Self> {
        check_table_name(table)?;
        Ok(Self {
            conn: Connection::open_in_memory()?,
            table: table.to_string(),
        })
    }

    pub fn init(&mut self) -> Result<()> {
        let t = &self.table;
        self.conn.execute_batch(&format!(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS {t} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange TEXT NOT NULL,
                market TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty REAL NOT NULL,
                price REAL NOT NULL,
                notional REAL NOT NULL,
                ts_exch_ms INTEGER NOT NULL,
                ts_ingest_ms INTEGER NOT NULL,
                raw TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {t}_ts_exch_idx ON {t} (ts_exch_ms);
            CREATE INDEX IF NOT EXISTS {t}_pair_idx ON {t} (exchange, market, symbol, ts_exch_ms);
            COMMIT;",
        ))?;
        Ok(())
    }

    /// Insert all events in one transaction; nothing is written on error.
    pub fn insert_batch(&mut self, events: &[Arc<LiquidationEvent>]) -> Result<usize> {
        let sql = format!(
            "INSERT INTO {} (exchange, market, symbol, side, qty, price, notional, ts_exch_ms, ts_ingest_ms, raw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, json(?10))",
            self.table
        );
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for e in events {
                stmt.execute(params![
                    e.exchange().as_str(),
                    e.market().as_str(),
                    e.symbol(),
                    e.side().as_str(),
                    e.qty(),
                    e.price(),
                    e.notional(),
                    e.ts_exch_ms(),
                    e.ts_ingest_ms(),
                    RawFormat::Compact.render(e.raw()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(events.len())
    }

    pub fn count(&self) -> Result<i64> {
        let n = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |r| r.get(0))?;
        Ok(n)
    }

    /// Symbols in insertion order, for inspection.
    pub fn symbols(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT symbol FROM {} ORDER BY id", self.table))?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Exchange, Market, Side};
    use serde_json::json;

    fn event(symbol: &str) -> Arc<LiquidationEvent> {
        Arc::new(LiquidationEvent::new(
            Exchange::Bybit,
            Market::Usdt,
            symbol.to_string(),
            Side::Short,
            2.0,
            10.0,
            1_000,
            2_000,
            json!({"symbol": symbol, "side": "Buy"}),
        ))
    }

    #[test]
    fn init_is_idempotent_and_batches_insert() {
        let mut store = LiquidationStore::in_memory("liquidations").unwrap();
        store.init().unwrap();
        store.init().unwrap();
        let n = store.insert_batch(&[event("BTCUSDT"), event("ETHUSDT")]).unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.symbols().unwrap(), vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn raw_is_stored_as_json() {
        let mut store = LiquidationStore::in_memory("liq").unwrap();
        store.init().unwrap();
        store.insert_batch(&[event("SOLUSDT")]).unwrap();
        let side: String = store
            .conn
            .query_row("SELECT json_extract(raw, '$.side') FROM liq", [], |r| r.get(0))
            .unwrap();
        assert_eq!(side, "Buy");
    }

    #[test]
    fn rejects_unsafe_table_name() {
        assert!(LiquidationStore::in_memory("x; DROP TABLE y").is_err());
    }
}
