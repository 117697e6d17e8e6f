//! Periodic buffer flush to the volume store
//!
//! Each tick drains the ingest buffer (per-symbol map swap) and writes the
//! snapshot on the blocking pool. A bucket whose write fails is logged and
//! dropped; a raw-trade batch whose transaction fails is dropped as a whole.
//! One failed cycle never blocks the next.

use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::buffer::{FlushBatch, IngestBuffer};
use crate::models::now_ms;
use crate::storage::VolumeStore;

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub buckets_written: u64,
    pub buckets_dropped: u64,
    pub raw_trades_written: u64,
    pub raw_trades_dropped: u64,
}

impl FlushReport {
    fn merge(&mut self, other: FlushReport) {
        self.buckets_written += other.buckets_written;
        self.buckets_dropped += other.buckets_dropped;
        self.raw_trades_written += other.raw_trades_written;
        self.raw_trades_dropped += other.raw_trades_dropped;
    }
}

#[derive(Debug, Default)]
pub struct FlushStats {
    cycles: AtomicU64,
    buckets_written: AtomicU64,
    buckets_dropped: AtomicU64,
    raw_trades_written: AtomicU64,
    raw_trades_dropped: AtomicU64,
    last_flush_ms: AtomicI64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushStatsSnapshot {
    pub cycles: u64,
    pub buckets_written: u64,
    pub buckets_dropped: u64,
    pub raw_trades_written: u64,
    pub raw_trades_dropped: u64,
    pub last_flush: Option<i64>,
}

impl FlushStats {
    fn record(&self, report: &FlushReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.buckets_written
            .fetch_add(report.buckets_written, Ordering::Relaxed);
        self.buckets_dropped
            .fetch_add(report.buckets_dropped, Ordering::Relaxed);
        self.raw_trades_written
            .fetch_add(report.raw_trades_written, Ordering::Relaxed);
        self.raw_trades_dropped
            .fetch_add(report.raw_trades_dropped, Ordering::Relaxed);
        self.last_flush_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FlushStatsSnapshot {
        let last = self.last_flush_ms.load(Ordering::Relaxed);
        FlushStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            buckets_written: self.buckets_written.load(Ordering::Relaxed),
            buckets_dropped: self.buckets_dropped.load(Ordering::Relaxed),
            raw_trades_written: self.raw_trades_written.load(Ordering::Relaxed),
            raw_trades_dropped: self.raw_trades_dropped.load(Ordering::Relaxed),
            last_flush: (last > 0).then_some(last),
        }
    }
}

/// Moves buffered buckets into the store on a fixed interval.
#[derive(Clone)]
pub struct FlushScheduler {
    buffer: Arc<IngestBuffer>,
    store: Arc<dyn VolumeStore>,
    interval: Duration,
    batch_size: usize,
    stats: Arc<FlushStats>,
}

impl FlushScheduler {
    pub fn new(
        buffer: Arc<IngestBuffer>,
        store: Arc<dyn VolumeStore>,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            buffer,
            store,
            interval,
            batch_size: batch_size.max(1),
            stats: Arc::new(FlushStats::default()),
        }
    }

    pub fn stats(&self) -> FlushStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drain the buffer and persist synchronously on the calling thread.
    pub fn flush_once(&self) -> FlushReport {
        let started = Instant::now();
        let batches = self.buffer.drain();

        let mut report = FlushReport::default();
        for batch in batches {
            report.merge(self.persist(batch));
        }
        self.stats.record(&report);

        if report.buckets_dropped > 0 || report.raw_trades_dropped > 0 {
            warn!(
                buckets_written = report.buckets_written,
                buckets_dropped = report.buckets_dropped,
                raw_trades_written = report.raw_trades_written,
                raw_trades_dropped = report.raw_trades_dropped,
                "flush_partial"
            );
        } else if report.buckets_written > 0 || report.raw_trades_written > 0 {
            debug!(
                buckets = report.buckets_written,
                raw_trades = report.raw_trades_written,
                elapsed_us = started.elapsed().as_micros() as u64,
                "flush_complete"
            );
        }
        report
    }

    fn persist(&self, batch: FlushBatch) -> FlushReport {
        let mut report = FlushReport::default();

        for bucket in &batch.buckets {
            match self.store.save_bucket(bucket) {
                Ok(_) => report.buckets_written += 1,
                Err(e) => {
                    report.buckets_dropped += 1;
                    error!(
                        symbol = %bucket.symbol,
                        bucket_start = bucket.bucket_start,
                        error = %e,
                        "bucket_write_failed"
                    );
                }
            }
        }

        for chunk in batch.raw_trades.chunks(self.batch_size) {
            match self.store.save_raw_trades(chunk) {
                Ok(n) => report.raw_trades_written += n as u64,
                Err(e) => {
                    report.raw_trades_dropped += chunk.len() as u64;
                    error!(
                        symbol = %batch.symbol,
                        trades = chunk.len(),
                        error = %e,
                        "raw_trade_batch_failed"
                    );
                }
            }
        }

        report
    }

    /// One flush cycle on the blocking pool.
    pub async fn flush_now(&self) -> FlushReport {
        let scheduler = self.clone();
        match tokio::task::spawn_blocking(move || scheduler.flush_once()).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "flush_task_failed");
                FlushReport::default()
            }
        }
    }

    /// Run until `shutdown` flips to true. The first tick fires one interval
    /// after start. Does not run a final flush.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let period = scheduler.interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(interval_ms = period.as_millis() as u64, "flush_scheduler_started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.flush_now().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!(cycles = scheduler.stats.snapshot().cycles, "flush_scheduler_stopped");
        })
    }
}
