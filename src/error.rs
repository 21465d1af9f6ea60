use thiserror::Error;

/// Failure kinds surfaced by the ingestion pipeline.
///
/// Only `Connection` is transient; every other kind is handled at the level
/// where it is raised (record, pipeline startup, sink, or process startup).
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("symbol discovery failed: {0}")]
    Discovery(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("sink {sink} write failed: {reason}")]
    SinkWrite { sink: &'static str, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl IngestError {
    pub fn connection(err: impl std::fmt::Display) -> Self {
        IngestError::Connection(err.to_string())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        IngestError::Schema(msg.into())
    }

    pub fn sink(sink: &'static str, err: impl std::fmt::Display) -> Self {
        IngestError::SinkWrite {
            sink,
            reason: err.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Connection(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Connection(_) => "connection",
            IngestError::Discovery(_) => "discovery",
            IngestError::Schema(_) => "schema",
            IngestError::SinkWrite { .. } => "sink_write",
            IngestError::Configuration(_) => "configuration",
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
