//! Error taxonomy for the ingestion pipeline
//!
//! Transport and protocol failures are handled inside the feed and never reach
//! callers. Persistence failures drop the affected record. Configuration and
//! query failures are returned to the embedding caller as structured values.

use thiserror::Error;

/// Failures observed on a single symbol's live feed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    /// Socket-level failure: refused connect, reset, handshake timeout,
    /// liveness timeout, stream ended without a close frame.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message that could not be decoded. The connection stays open.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A durable-store write or read failed.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Invalid configuration passed to `start()` or loaded from disk.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("no symbols configured")]
    NoSymbols,

    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("invalid timeframe: {0:?}")]
    InvalidTimeframe(String),

    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("failed to load config file {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Failures of the aggregation query layer.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The requested timeframe cannot be derived from what was stored:
    /// it is finer than (or not a multiple of) every stored granularity and
    /// no raw trades cover the range.
    #[error("no data at a granularity compatible with {requested_ms}ms (stored: {stored_ms:?})")]
    GranularityUnavailable {
        requested_ms: i64,
        stored_ms: Vec<i64>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the pipeline control surface.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("pipeline already running")]
    AlreadyRunning,

    #[error("query failed: {0}")]
    Query(#[from] QueryError),

    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
