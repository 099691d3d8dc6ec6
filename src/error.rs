//! Error taxonomy for the ingestion pipeline.
//!
//! Per-line and per-chunk failures are typed so they can be contained and
//! summarised in the run report. Startup failures are plain
//! [`anyhow::Error`]s and abort the run before any chunk work begins.

use thiserror::Error;

use crate::models::ChunkRange;

/// A line that does not fit the access-log grammar. Never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed log line: {line:?}")]
pub struct MalformedLine {
    pub line: String,
}

/// A configured rule whose pattern failed to compile. The rule is dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid rule #{index} {pattern:?}: {reason}")]
pub struct InvalidRule {
    /// Position of the entry in the rule document.
    pub index: usize,
    pub pattern: String,
    pub reason: String,
}

/// Geo lookup failure. Absorbed by [`GeoResolver::resolve`](crate::geo::GeoResolver::resolve).
#[derive(Debug, Error)]
pub enum GeoLookupError {
    #[error("not an IP address: {0:?}")]
    InvalidIp(String),

    #[error("geo database error: {0}")]
    Database(String),
}

/// A chunk's batch could not be committed. No automatic retry.
#[derive(Debug, Error)]
#[error("commit failed for chunk {chunk}: {source}")]
pub struct PersistenceError {
    pub chunk: ChunkRange,
    #[source]
    pub source: sqlx::Error,
}

/// Failure of one chunk. Siblings keep running.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("reading chunk {chunk} failed: {source}")]
    Io {
        chunk: ChunkRange,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("worker for chunk {chunk} panicked: {message}")]
    Panicked { chunk: ChunkRange, message: String },
}
