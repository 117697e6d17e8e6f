//! Durable storage for volume buckets, raw trades and the connection log.
//!
//! Writes are synchronous: every call reports success or failure for the
//! record (or batch) it was given. Callers on the async runtime move store
//! work onto the blocking pool.

pub mod sqlite;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StoreResult;
use crate::models::{ConnectionLogEntry, RawTrade, Timeframe, VolumeBucket};

pub use sqlite::SqliteStore;

/// Aggregate view over the bucket table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_entries: u64,
    pub entries_by_symbol: BTreeMap<String, u64>,
    pub oldest_entry: Option<i64>,
    pub newest_entry: Option<i64>,
    pub raw_trades: u64,
    pub connection_events: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub buckets_deleted: usize,
    pub raw_trades_deleted: usize,
}

/// Storage sink used by the flush scheduler, supervisor and query layer.
pub trait VolumeStore: Send + Sync {
    /// Persist one bucket. A bucket already stored under the same
    /// `(symbol, timeframe, bucket_start)` is merged additively.
    fn save_bucket(&self, bucket: &VolumeBucket) -> StoreResult<i64>;

    fn save_raw_trade(&self, trade: &RawTrade) -> StoreResult<i64>;

    /// Insert a batch in a single transaction. All or nothing.
    fn save_raw_trades(&self, trades: &[RawTrade]) -> StoreResult<usize>;

    fn log_connection_event(&self, entry: &ConnectionLogEntry) -> StoreResult<i64>;

    /// Buckets with `start_time <= bucket_start <= end_time`, ascending.
    fn query_buckets(
        &self,
        symbol: &str,
        start_time: i64,
        end_time: i64,
        timeframe: Option<Timeframe>,
    ) -> StoreResult<Vec<VolumeBucket>>;

    /// Raw trades ascending by timestamp, then insertion order.
    fn query_raw_trades(
        &self,
        pair: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> StoreResult<Vec<RawTrade>>;

    /// Distinct granularities stored for `symbol` within the range, ascending.
    fn stored_timeframes(
        &self,
        symbol: &str,
        start_time: i64,
        end_time: i64,
    ) -> StoreResult<Vec<Timeframe>>;

    fn count_raw_trades(&self, pair: &str, start_time: i64, end_time: i64) -> StoreResult<u64>;

    fn get_stats(&self) -> StoreResult<StoreStats>;

    /// Most recent audit entries first.
    fn connection_log(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<ConnectionLogEntry>>;

    /// Delete buckets and raw trades older than `cutoff_ms`.
    fn prune_before(&self, cutoff_ms: i64) -> StoreResult<PruneReport>;
}
