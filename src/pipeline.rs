//! Volume pipeline control surface
//!
//! Owns the store for its whole lifetime and, while running, one ingest
//! buffer, one connection supervisor and one flush scheduler. Construct once
//! and inject; there is no process-wide instance.
//!
//! ```ignore
//! let pipeline = VolumePipeline::new(PipelineConfig::from_env())?;
//! pipeline.start(Some("1m".parse()?))?;
//! // ...
//! let points = pipeline.query_volume("btcusdt", t0, t1, Timeframe::ONE_HOUR).await?;
//! pipeline.stop().await;
//! ```

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, QueryError, StoreError};
use crate::feed::{ConnectionSupervisor, FeedCodec, SupervisorConfig};
use crate::ingest::{FlushReport, FlushScheduler, IngestBuffer};
use crate::models::{now_ms, Candle, Timeframe, VolumePoint};
use crate::query::AggregationQuery;
use crate::status::{PipelineStatus, StatusReporter};
use crate::storage::{SqliteStore, StoreStats, VolumeStore};

/// Components that exist only between `start()` and `stop()`.
struct RunningPipeline {
    started_at: i64,
    buffer: Arc<IngestBuffer>,
    supervisor: Arc<ConnectionSupervisor>,
    flush: FlushScheduler,
    flush_task: JoinHandle<()>,
    flush_shutdown: watch::Sender<bool>,
}

pub struct VolumePipeline {
    config: PipelineConfig,
    store: Arc<dyn VolumeStore>,
    query: AggregationQuery,
    running: Mutex<Option<RunningPipeline>>,
}

impl VolumePipeline {
    /// Validate `config` and open the SQLite store at `config.db_path`.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let store = SqliteStore::open(&config.db_path)?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Use an existing store (tests, alternative backends).
    pub fn with_store(config: PipelineConfig, store: Arc<dyn VolumeStore>) -> Self {
        Self {
            query: AggregationQuery::new(store.clone()),
            config,
            store,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn VolumeStore> {
        self.store.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Begin tracking the configured symbols, bucketing at `timeframe` (or the
    /// configured default). Must be called inside a tokio runtime.
    pub fn start(&self, timeframe: Option<Timeframe>) -> Result<(), PipelineError> {
        self.config.validate()?;
        let timeframe = timeframe.unwrap_or(self.config.default_timeframe);

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let buffer = Arc::new(IngestBuffer::new(
            timeframe,
            self.config.record_raw_trades,
            self.config.depth.clone(),
        ));
        buffer.register(&self.config.symbols);

        let flush = FlushScheduler::new(
            buffer.clone(),
            self.store.clone(),
            Duration::from_millis(self.config.flush_interval_ms),
            self.config.batch_size,
        );
        let (flush_shutdown, flush_rx) = watch::channel(false);
        let flush_task = flush.spawn(flush_rx);

        let supervisor = Arc::new(ConnectionSupervisor::new(
            SupervisorConfig {
                ws_base_url: self.config.ws_base_url.clone(),
                reconnect: self.config.reconnect.clone(),
            },
            FeedCodec::new(self.config.stream_kind, &self.config.depth),
            buffer.clone(),
            Some(self.store.clone()),
        ));
        supervisor.start(&self.config.symbols);

        info!(
            symbols = ?self.config.symbols,
            timeframe = %timeframe,
            flush_interval_ms = self.config.flush_interval_ms,
            stream_kind = ?self.config.stream_kind,
            record_raw_trades = self.config.record_raw_trades,
            "pipeline_started"
        );

        *running = Some(RunningPipeline {
            started_at: now_ms(),
            buffer,
            supervisor,
            flush,
            flush_task,
            flush_shutdown,
        });
        Ok(())
    }

    /// Halt all tracking: close every connection, stop the flush timer, then
    /// run one final flush. Returns that flush's report, or `None` when the
    /// pipeline was not running.
    pub async fn stop(&self) -> Option<FlushReport> {
        let running = self.running.lock().take()?;

        running.supervisor.stop().await;

        let _ = running.flush_shutdown.send(true);
        if let Err(e) = running.flush_task.await {
            error!(error = %e, "flush_task_join_failed");
        }

        let report = running.flush.flush_now().await;
        let stats = running.flush.stats();
        info!(
            final_buckets = report.buckets_written,
            final_raw_trades = report.raw_trades_written,
            cycles = stats.cycles,
            buckets_written = stats.buckets_written,
            buckets_dropped = stats.buckets_dropped,
            events = running.buffer.events_ingested(),
            "pipeline_stopped"
        );
        Some(report)
    }

    pub async fn status(&self) -> PipelineStatus {
        let store_stats = match self.store_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "store_stats_unavailable");
                None
            }
        };

        let running = self.running.lock();
        match running.as_ref() {
            Some(r) => StatusReporter::collect(
                Some(r.started_at),
                Some(r.supervisor.as_ref()),
                Some(r.buffer.as_ref()),
                Some(r.flush.stats()),
                store_stats,
            ),
            None => StatusReporter::collect(None, None, None, None, store_stats),
        }
    }

    pub async fn store_stats(&self) -> Result<StoreStats, StoreError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.get_stats())
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Volume for `symbol` in `[start, end]` at `timeframe`, ascending.
    pub async fn query_volume(
        &self,
        symbol: &str,
        start: i64,
        end: i64,
        timeframe: Timeframe,
    ) -> Result<Vec<VolumePoint>, PipelineError> {
        let query = self.query.clone();
        let symbol = symbol.to_string();
        let points = tokio::task::spawn_blocking(move || {
            query.query_volume(&symbol, start, end, timeframe)
        })
        .await
        .map_err(|e| QueryError::Store(StoreError::Task(e.to_string())))??;
        Ok(points)
    }

    /// OHLC candles from raw trades, ascending.
    pub async fn query_candles(
        &self,
        symbol: &str,
        start: i64,
        end: i64,
        timeframe: Timeframe,
    ) -> Result<Vec<Candle>, PipelineError> {
        let query = self.query.clone();
        let symbol = symbol.to_string();
        let candles = tokio::task::spawn_blocking(move || {
            query.query_candles(&symbol, start, end, timeframe)
        })
        .await
        .map_err(|e| QueryError::Store(StoreError::Task(e.to_string())))??;
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::error::ConfigError;

    fn offline_config() -> PipelineConfig {
        PipelineConfig {
            symbols: vec!["btcusdt".to_string()],
            flush_interval_ms: 50,
            db_path: ":memory:".to_string(),
            // Nothing listens on port 9 locally; the feed just retries
            ws_base_url: "ws://127.0.0.1:9".to_string(),
            reconnect: ReconnectConfig {
                backoff_base_ms: 50,
                backoff_max_ms: 200,
                connect_timeout_ms: 200,
                ..ReconnectConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = offline_config();
        config.symbols.clear();
        assert!(matches!(
            VolumePipeline::new(config),
            Err(PipelineError::Config(ConfigError::NoSymbols))
        ));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let pipeline = VolumePipeline::new(offline_config()).unwrap();
        assert!(!pipeline.is_running());
        assert!(pipeline.stop().await.is_none());

        pipeline.start(Some(Timeframe::ONE_MINUTE)).unwrap();
        assert!(matches!(
            pipeline.start(None),
            Err(PipelineError::AlreadyRunning)
        ));

        let status = pipeline.status().await;
        assert!(status.is_running);
        assert!(status.per_symbol.contains_key("btcusdt"));
        assert_eq!(status.buffer.as_ref().unwrap().timeframe, "1m");

        let report = pipeline.stop().await;
        assert!(report.is_some());
        let status = pipeline.status().await;
        assert!(!status.is_running);
        assert!(status.store.is_some());

        // Restart after stop is allowed
        pipeline.start(None).unwrap();
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_final_flush_on_stop() {
        let mut config = offline_config();
        config.flush_interval_ms = 60_000;
        let pipeline = VolumePipeline::new(config).unwrap();
        pipeline.start(None).unwrap();

        let buffer = pipeline.running.lock().as_ref().unwrap().buffer.clone();
        buffer.ingest("btcusdt", 1_000, 10.0, 0.0);
        buffer.ingest("btcusdt", 1_500, 0.0, 4.0);
        buffer.ingest("btcusdt", 2_200, 3.0, 0.0);

        let report = pipeline.stop().await.unwrap();
        assert_eq!(report.buckets_written, 2);

        let points = pipeline
            .query_volume("btcusdt", 1_000, 2_999, Timeframe::ONE_SECOND)
            .await
            .unwrap();
        assert_eq!(
            points,
            vec![
                VolumePoint {
                    time: 1_000,
                    buy_volume: 10.0,
                    sell_volume: 4.0
                },
                VolumePoint {
                    time: 2_000,
                    buy_volume: 3.0,
                    sell_volume: 0.0
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_query_errors_are_structured() {
        let pipeline = VolumePipeline::new(offline_config()).unwrap();
        pipeline
            .store()
            .save_bucket(&crate::models::VolumeBucket {
                symbol: "btcusdt".into(),
                timeframe: Timeframe::ONE_MINUTE,
                bucket_start: 0,
                buy_volume: 1.0,
                sell_volume: 1.0,
                last_event_time: 0,
            })
            .unwrap();

        let err = pipeline
            .query_volume("btcusdt", 0, 59_999, Timeframe::ONE_SECOND)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Query(QueryError::GranularityUnavailable { .. })
        ));
    }
}
