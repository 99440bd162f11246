//! Error taxonomy for the ingestion side of the pipeline.
//!
//! Store errors carry the driver error unmodified; callers decide whether
//! to retry at file granularity (ingestion) or per query (prediction).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// A log line failed to parse as JSON or is missing a structurally
    /// required field (userId, eventId, time).
    #[error("malformed record at {file}:{line}: {source}")]
    MalformedRecord {
        file: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// A publish-time string did not match the expected
    /// ISO-8601-with-milliseconds format. Fatal for the containing file.
    #[error("unparseable publish time {value:?}: {source}")]
    TimestampFormat {
        value: String,
        #[source]
        source: chrono::format::ParseError,
    },

    #[error("graph store unavailable: {0}")]
    Store(#[from] neo4rs::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
