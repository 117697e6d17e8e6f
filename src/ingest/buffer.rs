//! In-memory bucket accumulator
//!
//! One `SymbolBuffer` per symbol, each with its own bucket map. The symbol's
//! feed task is the only writer; the flush scheduler drains by swapping the
//! whole map for an empty one under the lock (`mem::take`), so an ingest
//! either lands before the swap (and is in the snapshot) or after it (and is
//! in the fresh map). The lock is held for one map insert or one pointer swap,
//! never across store I/O.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use super::delta::{event_delta, VolumeDelta};
use super::EventSink;
use crate::config::DepthHeuristicConfig;
use crate::models::{MarketEvent, RawTrade, Timeframe, VolumeBucket};

// =============================================================================
// PER-SYMBOL BUFFER
// =============================================================================

#[derive(Debug)]
pub struct SymbolBuffer {
    symbol: String,
    timeframe: Timeframe,
    buckets: Mutex<HashMap<i64, VolumeBucket>>,
    raw_trades: Mutex<Vec<RawTrade>>,
    events: AtomicU64,
}

impl SymbolBuffer {
    fn new(symbol: &str, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            buckets: Mutex::new(HashMap::new()),
            raw_trades: Mutex::new(Vec::new()),
            events: AtomicU64::new(0),
        }
    }

    fn add(&self, event_time: i64, delta: VolumeDelta) {
        let start = self.timeframe.bucket_start(event_time);
        {
            let mut buckets = self.buckets.lock();
            buckets
                .entry(start)
                .and_modify(|b| {
                    b.buy_volume += delta.buy;
                    b.sell_volume += delta.sell;
                    b.last_event_time = b.last_event_time.max(event_time);
                })
                .or_insert_with(|| VolumeBucket {
                    symbol: self.symbol.clone(),
                    timeframe: self.timeframe,
                    bucket_start: start,
                    buy_volume: delta.buy,
                    sell_volume: delta.sell,
                    last_event_time: event_time,
                });
        }
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    fn push_raw_trade(&self, trade: RawTrade) {
        self.raw_trades.lock().push(trade);
    }

    /// Swap out the live map. Buckets come back ascending by start.
    fn take_buckets(&self) -> Vec<VolumeBucket> {
        let snapshot = std::mem::take(&mut *self.buckets.lock());
        let mut buckets: Vec<VolumeBucket> = snapshot.into_values().collect();
        buckets.sort_by_key(|b| b.bucket_start);
        buckets
    }

    fn take_raw_trades(&self) -> Vec<RawTrade> {
        std::mem::take(&mut *self.raw_trades.lock())
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn live_buckets(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn pending_raw_trades(&self) -> usize {
        self.raw_trades.lock().len()
    }

    /// Copy of the live buckets, ascending. Does not drain.
    pub fn peek(&self) -> Vec<VolumeBucket> {
        let mut buckets: Vec<VolumeBucket> = self.buckets.lock().values().cloned().collect();
        buckets.sort_by_key(|b| b.bucket_start);
        buckets
    }
}

// =============================================================================
// INGEST BUFFER
// =============================================================================

/// Everything drained from one symbol in a flush cycle.
#[derive(Debug, Default)]
pub struct FlushBatch {
    pub symbol: String,
    pub buckets: Vec<VolumeBucket>,
    pub raw_trades: Vec<RawTrade>,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.raw_trades.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SymbolOccupancy {
    pub live_buckets: usize,
    pub pending_raw_trades: usize,
    pub events_ingested: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BufferStatus {
    pub timeframe: String,
    pub live_buckets: usize,
    pub pending_raw_trades: usize,
    pub events_ingested: u64,
    pub events_rejected: u64,
    pub per_symbol: BTreeMap<String, SymbolOccupancy>,
}

pub struct IngestBuffer {
    timeframe: Timeframe,
    record_raw_trades: bool,
    depth: DepthHeuristicConfig,
    symbols: ArcSwap<HashMap<String, Arc<SymbolBuffer>>>,
    events_ingested: AtomicU64,
    events_rejected: AtomicU64,
}

impl IngestBuffer {
    pub fn new(timeframe: Timeframe, record_raw_trades: bool, depth: DepthHeuristicConfig) -> Self {
        Self {
            timeframe,
            record_raw_trades,
            depth,
            symbols: ArcSwap::from_pointee(HashMap::new()),
            events_ingested: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Buffer for `symbol`, created on first use.
    pub fn symbol_buffer(&self, symbol: &str) -> Arc<SymbolBuffer> {
        let timeframe = self.timeframe;
        loop {
            if let Some(buffer) = self.symbols.load().get(symbol) {
                return buffer.clone();
            }

            // Entries are never removed, so the next load finds it
            self.symbols.rcu(|current| {
                let mut next = HashMap::clone(current);
                next.entry(symbol.to_string())
                    .or_insert_with(|| Arc::new(SymbolBuffer::new(symbol, timeframe)));
                next
            });
            debug!(symbol, timeframe = %timeframe, "symbol_buffer_created");
        }
    }

    pub fn register(&self, symbols: &[String]) {
        for symbol in symbols {
            self.symbol_buffer(symbol);
        }
    }

    /// Add `buy`/`sell` to the bucket containing `event_time`.
    ///
    /// Non-finite or negative deltas are counted and discarded.
    pub fn ingest(&self, symbol: &str, event_time: i64, buy: f64, sell: f64) {
        let delta = VolumeDelta { buy, sell };
        if !delta.is_valid() {
            self.events_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(symbol, event_time, buy, sell, "rejected_invalid_delta");
            return;
        }
        self.symbol_buffer(symbol).add(event_time, delta);
        self.events_ingested.fetch_add(1, Ordering::Relaxed);
        trace!(symbol, event_time, buy, sell, "ingested");
    }

    /// Derive the delta for a decoded event and ingest it. Trades are also
    /// staged for raw persistence when enabled.
    pub fn ingest_event(&self, event: &MarketEvent) {
        let delta = event_delta(event, &self.depth);
        self.ingest(event.symbol(), event.event_time(), delta.buy, delta.sell);

        if self.record_raw_trades && delta.is_valid() {
            if let MarketEvent::Trade(trade) = event {
                self.symbol_buffer(&trade.symbol)
                    .push_raw_trade(RawTrade::from(trade));
            }
        }
    }

    /// Swap every symbol's live state for empty state and hand back what
    /// was swapped out. Symbols with nothing pending are omitted.
    pub fn drain(&self) -> Vec<FlushBatch> {
        let symbols = self.symbols.load_full();
        let mut names: Vec<&String> = symbols.keys().collect();
        names.sort();

        names
            .into_iter()
            .filter_map(|name| {
                let buffer = &symbols[name];
                let batch = FlushBatch {
                    symbol: name.clone(),
                    buckets: buffer.take_buckets(),
                    raw_trades: buffer.take_raw_trades(),
                };
                (!batch.is_empty()).then_some(batch)
            })
            .collect()
    }

    /// Live (unflushed) buy/sell totals for `symbol`.
    pub fn live_totals(&self, symbol: &str) -> (f64, f64) {
        match self.symbols.load().get(symbol) {
            Some(buffer) => buffer
                .peek()
                .iter()
                .fold((0.0, 0.0), |(b, s), bucket| {
                    (b + bucket.buy_volume, s + bucket.sell_volume)
                }),
            None => (0.0, 0.0),
        }
    }

    pub fn peek(&self, symbol: &str) -> Vec<VolumeBucket> {
        self.symbols
            .load()
            .get(symbol)
            .map(|b| b.peek())
            .unwrap_or_default()
    }

    pub fn events_ingested(&self) -> u64 {
        self.events_ingested.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> BufferStatus {
        let symbols = self.symbols.load();
        let mut status = BufferStatus {
            timeframe: self.timeframe.to_string(),
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            ..BufferStatus::default()
        };

        for (symbol, buffer) in symbols.iter() {
            let occupancy = SymbolOccupancy {
                live_buckets: buffer.live_buckets(),
                pending_raw_trades: buffer.pending_raw_trades(),
                events_ingested: buffer.events.load(Ordering::Relaxed),
            };
            status.live_buckets += occupancy.live_buckets;
            status.pending_raw_trades += occupancy.pending_raw_trades;
            status.per_symbol.insert(symbol.clone(), occupancy);
        }
        status
    }
}

impl EventSink for IngestBuffer {
    fn on_event(&self, event: &MarketEvent) {
        self.ingest_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DepthUpdate, TradeEvent};

    fn buffer() -> IngestBuffer {
        IngestBuffer::new(Timeframe::ONE_SECOND, false, DepthHeuristicConfig::default())
    }

    #[test]
    fn test_trades_land_in_expected_buckets() {
        let buffer = buffer();
        buffer.ingest("btcusdt", 1000, 10.0, 0.0);
        buffer.ingest("btcusdt", 1500, 0.0, 4.0);
        buffer.ingest("btcusdt", 2200, 3.0, 0.0);

        let buckets = buffer.peek("btcusdt");
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, 1000);
        assert_eq!(buckets[0].buy_volume, 10.0);
        assert_eq!(buckets[0].sell_volume, 4.0);
        assert_eq!(buckets[0].last_event_time, 1500);
        assert_eq!(buckets[1].bucket_start, 2000);
        assert_eq!(buckets[1].buy_volume, 3.0);
        assert_eq!(buckets[1].sell_volume, 0.0);
    }

    #[test]
    fn test_symbols_are_independent() {
        let buffer = buffer();
        buffer.ingest("btcusdt", 1000, 1.0, 0.0);
        buffer.ingest("ethusdt", 1000, 0.0, 2.0);
        assert_eq!(buffer.live_totals("btcusdt"), (1.0, 0.0));
        assert_eq!(buffer.live_totals("ethusdt"), (0.0, 2.0));
        assert_eq!(buffer.live_totals("solusdt"), (0.0, 0.0));
    }

    #[test]
    fn test_drain_swaps_out_live_map() {
        let buffer = buffer();
        buffer.register(&["btcusdt".to_string(), "idleusdt".to_string()]);
        buffer.ingest("btcusdt", 1000, 1.0, 1.0);

        let batches = buffer.drain();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].symbol, "btcusdt");
        assert_eq!(batches[0].buckets.len(), 1);
        assert!(buffer.peek("btcusdt").is_empty());

        // Same bucket again after the swap starts a fresh entry
        buffer.ingest("btcusdt", 1200, 2.0, 0.0);
        let batches = buffer.drain();
        assert_eq!(batches[0].buckets[0].buy_volume, 2.0);
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_invalid_deltas_rejected() {
        let buffer = buffer();
        buffer.ingest("btcusdt", 1000, f64::NAN, 0.0);
        buffer.ingest("btcusdt", 1000, -1.0, 0.0);
        let status = buffer.status();
        assert_eq!(status.events_rejected, 2);
        assert_eq!(status.events_ingested, 0);
        assert!(buffer.peek("btcusdt").is_empty());
    }

    #[test]
    fn test_raw_trades_staged_when_enabled() {
        let buffer = IngestBuffer::new(Timeframe::ONE_SECOND, true, DepthHeuristicConfig::default());
        buffer.ingest_event(&MarketEvent::Trade(TradeEvent {
            symbol: "btcusdt".into(),
            event_time: 1234,
            price: 10.0,
            quantity: 2.0,
            is_buyer_maker: true,
        }));

        let status = buffer.status();
        assert_eq!(status.pending_raw_trades, 1);
        assert_eq!(status.per_symbol["btcusdt"].live_buckets, 1);

        let batches = buffer.drain();
        assert_eq!(batches[0].raw_trades.len(), 1);
        assert_eq!(batches[0].raw_trades[0].timestamp, 1234);
        assert_eq!(batches[0].buckets[0].sell_volume, 20.0);
    }

    #[test]
    fn test_depth_event_ingested_as_heuristic_volume() {
        let depth = DepthHeuristicConfig {
            top_levels: 2,
            volume_scale: 0.5,
        };
        let buffer = IngestBuffer::new(Timeframe::ONE_SECOND, true, depth);
        buffer.ingest_event(&MarketEvent::Depth(DepthUpdate {
            symbol: "btcusdt".into(),
            event_time: 1_500,
            bids: vec![(100.0, 2.0), (99.0, 1.0), (98.0, 5.0)],
            asks: vec![(101.0, 1.0), (102.0, 0.0)],
        }));

        let buckets = buffer.peek("btcusdt");
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].bucket_start, 1_000);
        assert_eq!(buckets[0].buy_volume, 149.5);
        assert_eq!(buckets[0].sell_volume, 50.5);

        // Book updates are never staged as raw trades
        let status = buffer.status();
        assert_eq!(status.pending_raw_trades, 0);
        assert_eq!(status.events_ingested, 1);
    }

    #[test]
    fn test_extreme_event_times_do_not_panic() {
        let buffer = buffer();
        buffer.ingest("btcusdt", i64::MIN, 1.0, 0.0);
        buffer.ingest("btcusdt", i64::MAX, 2.0, 0.0);

        let buckets = buffer.peek("btcusdt");
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, i64::MIN);
        assert_eq!(buckets[1].bucket_start, i64::MAX - i64::MAX % 1_000);
    }

    #[test]
    fn test_symbol_buffer_is_registered_once() {
        let buffer = buffer();
        let a = buffer.symbol_buffer("btcusdt");
        let b = buffer.symbol_buffer("btcusdt");
        assert!(Arc::ptr_eq(&a, &b));

        // Writes through the handle are visible to drain
        a.add(1_000, VolumeDelta { buy: 1.0, sell: 0.0 });
        assert_eq!(buffer.drain().len(), 1);
    }

    #[test]
    fn test_concurrent_ingest_and_drain_loses_nothing() {
        let buffer = Arc::new(buffer());
        let writers: Vec<_> = ["btcusdt", "ethusdt"]
            .into_iter()
            .map(|symbol| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for i in 0..10_000i64 {
                        buffer.ingest(symbol, i % 3_000, 1.0, 0.5);
                    }
                })
            })
            .collect();

        let mut flushed = (0.0, 0.0);
        for _ in 0..200 {
            for batch in buffer.drain() {
                for b in batch.buckets {
                    flushed.0 += b.buy_volume;
                    flushed.1 += b.sell_volume;
                }
            }
        }
        for w in writers {
            w.join().unwrap();
        }
        for batch in buffer.drain() {
            for b in batch.buckets {
                flushed.0 += b.buy_volume;
                flushed.1 += b.sell_volume;
            }
        }

        assert_eq!(flushed.0, 20_000.0);
        assert_eq!(flushed.1, 10_000.0);
    }
}
