//! SQLite-backed volume store
//!
//! - WAL mode so queries run while the flush scheduler writes
//! - Additive upsert keyed on (symbol, timeframe, timestamp)
//! - Batched raw-trade inserts in one transaction
//! - Prepared statement caching

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::{path::Path, sync::Arc};
use tracing::{debug, info, warn};

use super::{PruneReport, StoreStats, VolumeStore};
use crate::error::StoreResult;
use crate::models::{ConnectionEventKind, ConnectionLogEntry, RawTrade, Timeframe, VolumeBucket};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS volume_buckets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    timeframe INTEGER NOT NULL,
    buy_volume REAL NOT NULL,
    sell_volume REAL NOT NULL,
    event_time INTEGER,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

-- One row per bucket identity; also the range-scan index
CREATE UNIQUE INDEX IF NOT EXISTS idx_volume_buckets_identity
    ON volume_buckets(symbol, timeframe, timestamp);

CREATE INDEX IF NOT EXISTS idx_volume_buckets_symbol_ts
    ON volume_buckets(symbol, timestamp);

CREATE TABLE IF NOT EXISTS connection_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    event TEXT NOT NULL,
    details TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_connection_log_symbol_ts
    ON connection_log(symbol, timestamp DESC);

CREATE TABLE IF NOT EXISTS raw_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    pair TEXT NOT NULL,
    price REAL NOT NULL,
    quantity REAL NOT NULL,
    is_buyer_maker INTEGER NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_raw_trades_pair_ts
    ON raw_trades(pair, timestamp, id);
"#;

const UPSERT_BUCKET_SQL: &str = "
    INSERT INTO volume_buckets (symbol, timestamp, timeframe, buy_volume, sell_volume, event_time)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT(symbol, timeframe, timestamp) DO UPDATE SET
        buy_volume = buy_volume + excluded.buy_volume,
        sell_volume = sell_volume + excluded.sell_volume,
        event_time = MAX(COALESCE(event_time, excluded.event_time), excluded.event_time)
    RETURNING id";

const INSERT_RAW_TRADE_SQL: &str = "
    INSERT INTO raw_trades (timestamp, pair, price, quantity, is_buyer_maker)
    VALUES (?1, ?2, ?3, ?4, ?5)";

/// SQLite implementation of [`VolumeStore`]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `db_path`.
    pub fn open(db_path: &str) -> StoreResult<Self> {
        if db_path == ":memory:" {
            return Self::open_memory();
        }

        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!(journal_mode = %journal_mode, "WAL mode not active");
        }

        let buckets: i64 = conn
            .query_row("SELECT COUNT(*) FROM volume_buckets", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = %db_path, existing_buckets = buckets, "volume store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store (tests, dry runs).
    pub fn open_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `PRAGMA optimize` and truncate the WAL.
    pub fn optimize(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "PRAGMA optimize;
             PRAGMA wal_checkpoint(TRUNCATE);",
        )?;
        info!("volume store optimized");
        Ok(())
    }

    fn row_to_bucket(row: &rusqlite::Row) -> rusqlite::Result<VolumeBucket> {
        let timeframe_ms: i64 = row.get(2)?;
        let timeframe = Timeframe::from_millis(timeframe_ms).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Integer,
                Box::new(e),
            )
        })?;
        let bucket_start: i64 = row.get(1)?;
        Ok(VolumeBucket {
            symbol: row.get(0)?,
            bucket_start,
            timeframe,
            buy_volume: row.get(3)?,
            sell_volume: row.get(4)?,
            last_event_time: row.get::<_, Option<i64>>(5)?.unwrap_or(bucket_start),
        })
    }

    fn row_to_raw_trade(row: &rusqlite::Row) -> rusqlite::Result<RawTrade> {
        Ok(RawTrade {
            timestamp: row.get(0)?,
            pair: row.get(1)?,
            price: row.get(2)?,
            quantity: row.get(3)?,
            is_buyer_maker: row.get::<_, i64>(4)? != 0,
        })
    }
}

impl VolumeStore for SqliteStore {
    fn save_bucket(&self, bucket: &VolumeBucket) -> StoreResult<i64> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(UPSERT_BUCKET_SQL)?;
        let id = stmt.query_row(
            params![
                &bucket.symbol,
                bucket.bucket_start,
                bucket.timeframe.as_millis(),
                bucket.buy_volume,
                bucket.sell_volume,
                bucket.last_event_time,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn save_raw_trade(&self, trade: &RawTrade) -> StoreResult<i64> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(INSERT_RAW_TRADE_SQL)?;
        stmt.execute(params![
            trade.timestamp,
            &trade.pair,
            trade.price,
            trade.quantity,
            trade.is_buyer_maker as i64,
        ])?;
        Ok(conn.last_insert_rowid())
    }

    fn save_raw_trades(&self, trades: &[RawTrade]) -> StoreResult<usize> {
        if trades.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(INSERT_RAW_TRADE_SQL)?;
            for trade in trades {
                inserted += stmt.execute(params![
                    trade.timestamp,
                    &trade.pair,
                    trade.price,
                    trade.quantity,
                    trade.is_buyer_maker as i64,
                ])?;
            }
        }
        tx.commit()?;

        debug!(inserted, "raw trade batch inserted");
        Ok(inserted)
    }

    fn log_connection_event(&self, entry: &ConnectionLogEntry) -> StoreResult<i64> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO connection_log (timestamp, symbol, event, details)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![
            entry.timestamp,
            &entry.symbol,
            entry.event.as_str(),
            &entry.details,
        ])?;
        Ok(conn.last_insert_rowid())
    }

    fn query_buckets(
        &self,
        symbol: &str,
        start_time: i64,
        end_time: i64,
        timeframe: Option<Timeframe>,
    ) -> StoreResult<Vec<VolumeBucket>> {
        let conn = self.conn.lock();

        let buckets = match timeframe {
            Some(tf) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT symbol, timestamp, timeframe, buy_volume, sell_volume, event_time
                     FROM volume_buckets
                     WHERE symbol = ?1 AND timeframe = ?2 AND timestamp >= ?3 AND timestamp <= ?4
                     ORDER BY timestamp ASC",
                )?;
                let rows = stmt.query_map(
                    params![symbol, tf.as_millis(), start_time, end_time],
                    Self::row_to_bucket,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT symbol, timestamp, timeframe, buy_volume, sell_volume, event_time
                     FROM volume_buckets
                     WHERE symbol = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                     ORDER BY timestamp ASC, timeframe ASC",
                )?;
                let rows =
                    stmt.query_map(params![symbol, start_time, end_time], Self::row_to_bucket)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        Ok(buckets)
    }

    fn query_raw_trades(
        &self,
        pair: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> StoreResult<Vec<RawTrade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, pair, price, quantity, is_buyer_maker
             FROM raw_trades
             WHERE pair = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(
            params![
                pair,
                start_time.unwrap_or(i64::MIN),
                end_time.unwrap_or(i64::MAX)
            ],
            Self::row_to_raw_trade,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn stored_timeframes(
        &self,
        symbol: &str,
        start_time: i64,
        end_time: i64,
    ) -> StoreResult<Vec<Timeframe>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT timeframe FROM volume_buckets
             WHERE symbol = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timeframe ASC",
        )?;
        let rows = stmt.query_map(params![symbol, start_time, end_time], |row| {
            row.get::<_, i64>(0)
        })?;

        let mut out = Vec::new();
        for ms in rows {
            match Timeframe::from_millis(ms?) {
                Ok(tf) => out.push(tf),
                Err(e) => warn!(error = %e, symbol, "skipping corrupt timeframe row"),
            }
        }
        Ok(out)
    }

    fn count_raw_trades(&self, pair: &str, start_time: i64, end_time: i64) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM raw_trades WHERE pair = ?1 AND timestamp >= ?2 AND timestamp <= ?3",
            params![pair, start_time, end_time],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn get_stats(&self) -> StoreResult<StoreStats> {
        let conn = self.conn.lock();

        let (total, oldest, newest): (i64, Option<i64>, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM volume_buckets",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let entries_by_symbol = {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, COUNT(*) FROM volume_buckets GROUP BY symbol ORDER BY symbol",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let raw_trades: i64 =
            conn.query_row("SELECT COUNT(*) FROM raw_trades", [], |row| row.get(0))?;
        let connection_events: i64 =
            conn.query_row("SELECT COUNT(*) FROM connection_log", [], |row| row.get(0))?;

        Ok(StoreStats {
            total_entries: total as u64,
            entries_by_symbol,
            oldest_entry: oldest,
            newest_entry: newest,
            raw_trades: raw_trades as u64,
            connection_events: connection_events as u64,
        })
    }

    fn connection_log(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<ConnectionLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, symbol, event, details FROM connection_log
             WHERE ?1 IS NULL OR symbol = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![symbol, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (timestamp, symbol, event, details) = row?;
            let Some(event) = ConnectionEventKind::parse(&event) else {
                warn!(event = %event, "unknown connection event kind");
                continue;
            };
            out.push(ConnectionLogEntry {
                timestamp,
                symbol,
                event,
                details,
            });
        }
        Ok(out)
    }

    fn prune_before(&self, cutoff_ms: i64) -> StoreResult<PruneReport> {
        let conn = self.conn.lock();
        let buckets_deleted = conn.execute(
            "DELETE FROM volume_buckets WHERE timestamp < ?1",
            params![cutoff_ms],
        )?;
        let raw_trades_deleted =
            conn.execute("DELETE FROM raw_trades WHERE timestamp < ?1", params![cutoff_ms])?;
        info!(cutoff_ms, buckets_deleted, raw_trades_deleted, "volume store pruned");
        Ok(PruneReport {
            buckets_deleted,
            raw_trades_deleted,
        })
    }
}

/// Look up a single bucket row; used by diagnostics and tests.
impl SqliteStore {
    pub fn get_bucket(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bucket_start: i64,
    ) -> StoreResult<Option<VolumeBucket>> {
        let conn = self.conn.lock();
        let bucket = conn
            .query_row(
                "SELECT symbol, timestamp, timeframe, buy_volume, sell_volume, event_time
                 FROM volume_buckets
                 WHERE symbol = ?1 AND timeframe = ?2 AND timestamp = ?3",
                params![symbol, timeframe.as_millis(), bucket_start],
                Self::row_to_bucket,
            )
            .optional()?;
        Ok(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(symbol: &str, start: i64, buy: f64, sell: f64) -> VolumeBucket {
        VolumeBucket {
            symbol: symbol.to_string(),
            timeframe: Timeframe::ONE_SECOND,
            bucket_start: start,
            buy_volume: buy,
            sell_volume: sell,
            last_event_time: start + 10,
        }
    }

    fn trade(ts: i64, price: f64, qty: f64, maker: bool) -> RawTrade {
        RawTrade {
            timestamp: ts,
            pair: "btcusdt".to_string(),
            price,
            quantity: qty,
            is_buyer_maker: maker,
        }
    }

    #[test]
    fn test_store_open_memory() {
        let store = SqliteStore::open(":memory:").expect("Failed to open store");
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_entries, 0);
        assert!(stats.oldest_entry.is_none());
    }

    #[test]
    fn test_save_and_query_buckets_ascending() {
        let store = SqliteStore::open_memory().unwrap();
        store.save_bucket(&bucket("btcusdt", 3000, 1.0, 0.0)).unwrap();
        store.save_bucket(&bucket("btcusdt", 1000, 2.0, 1.0)).unwrap();
        store.save_bucket(&bucket("ethusdt", 2000, 5.0, 5.0)).unwrap();

        let rows = store.query_buckets("btcusdt", 0, 10_000, None).unwrap();
        let starts: Vec<i64> = rows.iter().map(|b| b.bucket_start).collect();
        assert_eq!(starts, vec![1000, 3000]);

        let rows = store
            .query_buckets("btcusdt", 1000, 2999, Some(Timeframe::ONE_SECOND))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].buy_volume, 2.0);
    }

    #[test]
    fn test_save_bucket_merges_same_identity() {
        let store = SqliteStore::open_memory().unwrap();
        let id1 = store.save_bucket(&bucket("btcusdt", 1000, 10.0, 0.0)).unwrap();
        let mut second = bucket("btcusdt", 1000, 0.0, 4.0);
        second.last_event_time = 1500;
        let id2 = store.save_bucket(&second).unwrap();
        assert_eq!(id1, id2);

        let row = store
            .get_bucket("btcusdt", Timeframe::ONE_SECOND, 1000)
            .unwrap()
            .unwrap();
        assert_eq!(row.buy_volume, 10.0);
        assert_eq!(row.sell_volume, 4.0);
        assert_eq!(row.last_event_time, 1500);
        assert_eq!(store.get_stats().unwrap().total_entries, 1);
    }

    #[test]
    fn test_raw_trade_batch_and_range() {
        let store = SqliteStore::open_memory().unwrap();
        let trades: Vec<_> = (0..100)
            .map(|i| trade(1000 + i * 10, 100.0 + i as f64, 1.0, i % 2 == 0))
            .collect();
        assert_eq!(store.save_raw_trades(&trades).unwrap(), 100);
        assert_eq!(store.save_raw_trades(&[]).unwrap(), 0);

        let all = store.query_raw_trades("btcusdt", None, None).unwrap();
        assert_eq!(all.len(), 100);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let some = store
            .query_raw_trades("btcusdt", Some(1100), Some(1190))
            .unwrap();
        assert_eq!(some.len(), 10);
        assert!(some[0].is_buyer_maker);
        assert_eq!(store.count_raw_trades("btcusdt", 1100, 1190).unwrap(), 10);
        assert_eq!(store.count_raw_trades("ethusdt", 0, i64::MAX).unwrap(), 0);
    }

    #[test]
    fn test_single_raw_trade_ids_increase() {
        let store = SqliteStore::open_memory().unwrap();
        let a = store.save_raw_trade(&trade(1, 1.0, 1.0, false)).unwrap();
        let b = store.save_raw_trade(&trade(2, 1.0, 1.0, false)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_connection_log_roundtrip() {
        let store = SqliteStore::open_memory().unwrap();
        for (ts, kind) in [
            (1, ConnectionEventKind::Connect),
            (2, ConnectionEventKind::Disconnect),
            (3, ConnectionEventKind::ReconnectAttempt),
        ] {
            store
                .log_connection_event(&ConnectionLogEntry {
                    timestamp: ts,
                    symbol: "ethusdt".to_string(),
                    event: kind,
                    details: format!("event {}", ts),
                })
                .unwrap();
        }

        let log = store.connection_log(Some("ethusdt"), 10).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].event, ConnectionEventKind::ReconnectAttempt);
        assert!(store.connection_log(Some("btcusdt"), 10).unwrap().is_empty());
        assert_eq!(store.connection_log(None, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_stats_and_timeframes() {
        let store = SqliteStore::open_memory().unwrap();
        store.save_bucket(&bucket("btcusdt", 1000, 1.0, 1.0)).unwrap();
        store.save_bucket(&bucket("btcusdt", 2000, 1.0, 1.0)).unwrap();
        store.save_bucket(&bucket("ethusdt", 5000, 1.0, 1.0)).unwrap();
        let mut minute = bucket("btcusdt", 0, 1.0, 1.0);
        minute.timeframe = Timeframe::ONE_MINUTE;
        store.save_bucket(&minute).unwrap();

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_entries, 4);
        assert_eq!(stats.entries_by_symbol.get("btcusdt"), Some(&3));
        assert_eq!(stats.entries_by_symbol.get("ethusdt"), Some(&1));
        assert_eq!(stats.oldest_entry, Some(0));
        assert_eq!(stats.newest_entry, Some(5000));

        let tfs = store.stored_timeframes("btcusdt", 0, 10_000).unwrap();
        assert_eq!(tfs, vec![Timeframe::ONE_SECOND, Timeframe::ONE_MINUTE]);
    }

    #[test]
    fn test_prune_before() {
        let store = SqliteStore::open_memory().unwrap();
        store.save_bucket(&bucket("btcusdt", 1000, 1.0, 1.0)).unwrap();
        store.save_bucket(&bucket("btcusdt", 9000, 1.0, 1.0)).unwrap();
        store.save_raw_trade(&trade(500, 1.0, 1.0, true)).unwrap();

        let report = store.prune_before(5000).unwrap();
        assert_eq!(report.buckets_deleted, 1);
        assert_eq!(report.raw_trades_deleted, 1);
        assert_eq!(store.get_stats().unwrap().total_entries, 1);
    }

    #[test]
    fn test_open_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("volume.db");
        let path = path.to_string_lossy().to_string();

        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_bucket(&bucket("btcusdt", 1000, 3.0, 0.0)).unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        let rows = reopened.query_buckets("btcusdt", 0, 5000, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].buy_volume, 3.0);
    }
}
