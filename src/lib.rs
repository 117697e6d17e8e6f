//! Tapeflow Backend Library
//!
//! Real-time market volume ingestion:
//! - `feed`: per-symbol WebSocket sessions with backoff and liveness checks
//! - `ingest`: time-bucketed buy/sell accumulation and periodic flush
//! - `storage`: durable SQLite store for buckets, raw trades, connection log
//! - `query`: re-aggregation to any compatible timeframe
//! - `pipeline`: the start/stop/status/query control surface

pub mod config;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod status;
pub mod storage;

pub use config::PipelineConfig;
pub use error::{ConfigError, FeedError, PipelineError, QueryError, StoreError};
pub use models::{Timeframe, VolumeBucket, VolumePoint};
pub use pipeline::VolumePipeline;
