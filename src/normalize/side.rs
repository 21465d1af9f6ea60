//! Per-exchange side vocabularies.
//!
//! Each table maps the exchange's own word for the liquidation order (or the
//! liquidated position) to the side of the position that was closed. Lookups
//! are case-insensitive; anything outside a table is unrecognized.

use serde_json::Value;

use crate::event::{Exchange, Side};

pub struct SideTable {
    pub field: &'static str,
    pub entries: &'static [(&'static str, Side)],
}

impl SideTable {
    pub fn lookup(&self, value: &str) -> Option<Side> {
        let value = value.trim();
        self.entries
            .iter()
            .find(|(word, _)| word.eq_ignore_ascii_case(value))
            .map(|(_, side)| *side)
    }
}

// Forced SELL closes a long, forced BUY closes a short.
pub const BINANCE_ORDER_SIDE: SideTable = SideTable {
    field: "S",
    entries: &[("SELL", Side::Long), ("BUY", Side::Short)],
};

pub const BYBIT_SIDE: SideTable = SideTable {
    field: "side",
    entries: &[("Sell", Side::Long), ("Buy", Side::Short)],
};

pub const OKX_POS_SIDE: SideTable = SideTable {
    field: "posSide",
    entries: &[("long", Side::Long), ("short", Side::Short)],
};

// Net-mode positions carry no posSide; fall back to the order direction.
pub const OKX_NET_SIDE: SideTable = SideTable {
    field: "side",
    entries: &[("sell", Side::Long), ("buy", Side::Short)],
};

// A = ask (sell) closes a long, B = bid (buy) closes a short.
pub const HYPERLIQUID_SIDE: SideTable = SideTable {
    field: "side",
    entries: &[("A", Side::Long), ("B", Side::Short)],
};

fn field_str<'a>(record: &'a Value, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

/// Resolve the liquidated side of a record, or return the offending wire value.
///
/// `record` is the object that carries the side field: the `o` order for
/// Binance-style feeds, the detail row for OKX, the fill for Hyperliquid.
pub fn resolve(exchange: Exchange, record: &Value) -> Result<Side, String> {
    match exchange {
        Exchange::Binance | Exchange::Aster => lookup_field(&BINANCE_ORDER_SIDE, record),
        Exchange::Bybit => lookup_field(&BYBIT_SIDE, record),
        Exchange::Okx => match field_str(record, OKX_POS_SIDE.field) {
            Some(pos) if !pos.eq_ignore_ascii_case("net") && !pos.is_empty() => {
                OKX_POS_SIDE.lookup(pos).ok_or_else(|| format!("posSide={}", pos))
            }
            _ => lookup_field(&OKX_NET_SIDE, record),
        },
        Exchange::Hyperliquid => {
            let dir = field_str(record, "dir").unwrap_or_default().to_lowercase();
            if dir.contains("close long") {
                Ok(Side::Long)
            } else if dir.contains("close short") {
                Ok(Side::Short)
            } else {
                lookup_field(&HYPERLIQUID_SIDE, record)
            }
        }
    }
}

fn lookup_field(table: &SideTable, record: &Value) -> Result<Side, String> {
    match field_str(record, table.field) {
        Some(value) => table
            .lookup(value)
            .ok_or_else(|| format!("{}={}", table.field, value)),
        None => Err(format!("{} missing", table.field)),
    }
}
