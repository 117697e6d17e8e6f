//! Volume queries at a caller-chosen timeframe
//!
//! `query_volume(symbol, start, end, F)` reads every stored bucket in range
//! and folds each granularity that divides F into F-buckets, coarsest first.
//! A finer row is skipped where a coarser row already covers its span, so a
//! period stored at two granularities is counted once. Periods stored only at
//! a granularity that does not divide F are answered from raw trades when
//! those exist there, and fail with `GranularityUnavailable` otherwise. With
//! no buckets at all, raw trades answer the whole range.
//!
//! The output covers every F-bucket that intersects `[start, end]`. Replayed
//! trades after a reconnect are not deduplicated.

use std::{collections::BTreeMap, sync::Arc};

use tracing::debug;

use crate::error::QueryError;
use crate::models::{Candle, RawTrade, Timeframe, VolumeBucket, VolumePoint};
use crate::storage::VolumeStore;

/// Which stored data answered a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySource {
    Exact,
    Rebucketed { from: Timeframe },
    RawTrades,
    /// Buckets where they divide F, raw trades for the rest
    Mixed,
    Empty,
}

#[derive(Clone)]
pub struct AggregationQuery {
    store: Arc<dyn VolumeStore>,
}

impl AggregationQuery {
    pub fn new(store: Arc<dyn VolumeStore>) -> Self {
        Self { store }
    }

    pub fn query_volume(
        &self,
        symbol: &str,
        start: i64,
        end: i64,
        timeframe: Timeframe,
    ) -> Result<Vec<VolumePoint>, QueryError> {
        self.query_volume_with_source(symbol, start, end, timeframe)
            .map(|(points, _)| points)
    }

    pub fn query_volume_with_source(
        &self,
        symbol: &str,
        start: i64,
        end: i64,
        timeframe: Timeframe,
    ) -> Result<(Vec<VolumePoint>, QuerySource), QueryError> {
        if start > end {
            return Ok((Vec::new(), QuerySource::Empty));
        }
        let (lo, hi) = aligned_range(start, end, timeframe);

        let rows = self.store.query_buckets(symbol, lo, hi, None)?;
        if rows.is_empty() {
            if self.store.count_raw_trades(symbol, lo, hi)? > 0 {
                let trades = self.store.query_raw_trades(symbol, Some(lo), Some(hi))?;
                return Ok((aggregate_trades(&trades, timeframe), QuerySource::RawTrades));
            }
            return Ok((Vec::new(), QuerySource::Empty));
        }

        let merged = merge_granularities(&rows, timeframe);
        let mut points: BTreeMap<i64, VolumePoint> =
            merged.points.into_iter().map(|p| (p.time, p)).collect();

        let mut source = match merged.used.as_slice() {
            [] => QuerySource::Empty,
            [only] if *only == timeframe => QuerySource::Exact,
            used => QuerySource::Rebucketed { from: used[0] },
        };

        if !merged.orphans.is_empty() {
            // F-aligned spans that can only be answered from raw trades
            let mut affected = Coverage::default();
            for &(orphan_start, orphan_end) in &merged.orphans {
                let last = orphan_end.saturating_sub(1);
                if self.store.count_raw_trades(symbol, orphan_start, last)? == 0 {
                    let stored = self.store.stored_timeframes(symbol, lo, hi)?;
                    return Err(QueryError::GranularityUnavailable {
                        requested_ms: timeframe.as_millis(),
                        stored_ms: stored.iter().map(|t| t.as_millis()).collect(),
                    });
                }
                affected.add(
                    timeframe.bucket_start(orphan_start),
                    timeframe
                        .bucket_start(last)
                        .saturating_add(timeframe.as_millis()),
                );
            }

            points.retain(|time, _| !affected.contains_point(*time));

            let trades: Vec<RawTrade> = self
                .store
                .query_raw_trades(symbol, Some(lo), Some(hi))?
                .into_iter()
                .filter(|t| affected.contains_point(t.timestamp))
                .collect();
            debug!(
                symbol,
                orphans = merged.orphans.len(),
                trades = trades.len(),
                "raw_trade_fill"
            );
            for point in aggregate_trades(&trades, timeframe) {
                points.insert(point.time, point);
            }

            let raw_only = merged.used.is_empty()
                || points.values().all(|p| affected.contains_point(p.time));
            source = if raw_only {
                QuerySource::RawTrades
            } else {
                QuerySource::Mixed
            };
        }

        if !merged.used.is_empty() {
            debug!(
                symbol,
                to = %timeframe,
                granularities = merged.used.len(),
                rows = rows.len(),
                "bucket_query"
            );
        }

        let points = points
            .into_values()
            .filter(|p| p.time >= lo && p.time <= hi)
            .collect();
        Ok((points, source))
    }

    /// OHLC candles from raw trades. Empty when no raw trades are stored.
    pub fn query_candles(
        &self,
        symbol: &str,
        start: i64,
        end: i64,
        timeframe: Timeframe,
    ) -> Result<Vec<Candle>, QueryError> {
        if start > end {
            return Ok(Vec::new());
        }
        let (lo, hi) = aligned_range(start, end, timeframe);
        let trades = self.store.query_raw_trades(symbol, Some(lo), Some(hi))?;
        Ok(build_candles(&trades, timeframe))
    }
}

/// `[bucket_start(start), bucket_start(end) + F - 1]`
fn aligned_range(start: i64, end: i64, timeframe: Timeframe) -> (i64, i64) {
    let lo = timeframe.bucket_start(start);
    let hi = timeframe
        .bucket_start(end)
        .saturating_add(timeframe.as_millis() - 1);
    (lo, hi)
}

/// Result of folding stored rows into F-buckets.
#[derive(Debug, Default, PartialEq)]
pub struct MergedBuckets {
    pub points: Vec<VolumePoint>,
    /// Granularities that contributed at least one row, finest first
    pub used: Vec<Timeframe>,
    /// `[start, end)` spans of rows whose granularity does not divide F and
    /// that no compatible row covers
    pub orphans: Vec<(i64, i64)>,
}

/// Fold rows of any granularity into `timeframe` buckets.
///
/// Granularities dividing `timeframe` are taken coarsest first; a row whose
/// span overlaps one already taken is skipped. Rows at other granularities
/// are reported as orphans unless fully covered.
pub fn merge_granularities(rows: &[VolumeBucket], timeframe: Timeframe) -> MergedBuckets {
    let mut tiers: BTreeMap<Timeframe, Vec<&VolumeBucket>> = BTreeMap::new();
    for row in rows {
        tiers.entry(row.timeframe).or_default().push(row);
    }

    let mut covered = Coverage::default();
    let mut acc: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    let mut used = Vec::new();

    for (tier, tier_rows) in tiers.iter().rev() {
        if !timeframe.is_multiple_of(*tier) {
            continue;
        }
        let mut contributed = false;
        let mut taken = Vec::new();
        for row in tier_rows {
            let (s, e) = row_span(row);
            if covered.overlaps(s, e) {
                continue;
            }
            taken.push((s, e));
            let entry = acc
                .entry(timeframe.bucket_start(row.bucket_start))
                .or_insert((0.0, 0.0));
            entry.0 += row.buy_volume;
            entry.1 += row.sell_volume;
            contributed = true;
        }
        // Same-tier rows never overlap each other
        for (s, e) in taken {
            covered.add(s, e);
        }
        if contributed {
            used.push(*tier);
        }
    }
    used.reverse();

    let orphans = tiers
        .iter()
        .filter(|(tier, _)| !timeframe.is_multiple_of(**tier))
        .flat_map(|(_, tier_rows)| tier_rows.iter().map(|row| row_span(row)))
        .filter(|&(s, e)| !covered.contains(s, e))
        .collect();

    MergedBuckets {
        points: acc
            .into_iter()
            .map(|(time, (buy_volume, sell_volume))| VolumePoint {
                time,
                buy_volume,
                sell_volume,
            })
            .collect(),
        used,
        orphans,
    }
}

fn row_span(row: &VolumeBucket) -> (i64, i64) {
    (
        row.bucket_start,
        row.bucket_start.saturating_add(row.timeframe.as_millis()),
    )
}

/// Disjoint half-open `[start, end)` spans keyed by start.
#[derive(Debug, Default)]
struct Coverage {
    spans: BTreeMap<i64, i64>,
}

impl Coverage {
    /// Insert a span, absorbing every span it overlaps or touches.
    fn add(&mut self, mut start: i64, mut end: i64) {
        let absorbed: Vec<i64> = self
            .spans
            .range(..=end)
            .rev()
            .take_while(|(_, e)| **e >= start)
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            if let Some(e) = self.spans.remove(&s) {
                start = start.min(s);
                end = end.max(e);
            }
        }
        self.spans.insert(start, end);
    }

    fn overlaps(&self, start: i64, end: i64) -> bool {
        self.spans
            .range(..end)
            .next_back()
            .map_or(false, |(_, &e)| e > start)
    }

    fn contains(&self, start: i64, end: i64) -> bool {
        self.spans
            .range(..=start)
            .next_back()
            .map_or(false, |(_, &e)| e >= end)
    }

    fn contains_point(&self, t: i64) -> bool {
        self.spans
            .range(..=t)
            .next_back()
            .map_or(false, |(_, &e)| e > t)
    }
}

/// Sum rows into `timeframe` buckets, ascending. Rows must be at a
/// granularity that divides `timeframe`.
pub fn rebucket(rows: &[VolumeBucket], timeframe: Timeframe) -> Vec<VolumePoint> {
    let mut acc: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for row in rows {
        let entry = acc
            .entry(timeframe.bucket_start(row.bucket_start))
            .or_insert((0.0, 0.0));
        entry.0 += row.buy_volume;
        entry.1 += row.sell_volume;
    }
    acc.into_iter()
        .map(|(time, (buy_volume, sell_volume))| VolumePoint {
            time,
            buy_volume,
            sell_volume,
        })
        .collect()
}

/// Buy/sell notional per `timeframe` bucket from raw trades, ascending.
pub fn aggregate_trades(trades: &[RawTrade], timeframe: Timeframe) -> Vec<VolumePoint> {
    build_candles(trades, timeframe)
        .into_iter()
        .map(|c| VolumePoint {
            time: c.time,
            buy_volume: c.buy_volume,
            sell_volume: c.sell_volume,
        })
        .collect()
}

/// Trades must be ascending by timestamp; open is the first trade in the
/// bucket and close the last.
pub fn build_candles(trades: &[RawTrade], timeframe: Timeframe) -> Vec<Candle> {
    let mut candles: BTreeMap<i64, Candle> = BTreeMap::new();

    for trade in trades {
        let time = timeframe.bucket_start(trade.timestamp);
        let notional = trade.price * trade.quantity;
        let (buy, sell) = if trade.is_buyer_maker {
            (0.0, notional)
        } else {
            (notional, 0.0)
        };

        candles
            .entry(time)
            .and_modify(|c| {
                c.high = c.high.max(trade.price);
                c.low = c.low.min(trade.price);
                c.close = trade.price;
                c.buy_volume += buy;
                c.sell_volume += sell;
                c.trades += 1;
            })
            .or_insert(Candle {
                time,
                open: trade.price,
                high: trade.price,
                low: trade.price,
                close: trade.price,
                buy_volume: buy,
                sell_volume: sell,
                trades: 1,
            });
    }

    candles.into_values().collect()
}
