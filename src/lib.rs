//! Multi-exchange liquidation ingestion.
//!
//! Each (exchange, market) pair runs as its own pipeline: an adapter reads
//! the venue's feed, the normalizer maps records onto [`event::LiquidationEvent`],
//! and a shared [`sink::SinkRouter`] fans events out to files, a batch store
//! and the console.

pub mod config;
pub mod error;
pub mod event;
pub mod feed;
pub mod logging;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod storage;

pub use error::{IngestError, Result};
