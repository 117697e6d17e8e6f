//! tapeflow - market volume ingestion
//!
//! Usage:
//!   tapeflow run --symbols btcusdt,ethusdt --timeframe 1s
//!   tapeflow query --symbol btcusdt --start 2024-01-01T00:00:00Z --end 2024-01-01T01:00:00Z --timeframe 1m
//!   tapeflow candles --symbol btcusdt --start 1704067200000 --end 1704070800000 --timeframe 5m
//!   tapeflow stats --log-limit 20
//!   tapeflow prune --before 2024-01-01T00:00:00Z
//!
//! Configuration: `tapeflow.toml` (or `TAPEFLOW_CONFIG_PATH`), then
//! `TAPEFLOW_*` environment variables, then command-line flags.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tapeflow_backend::{
    config::{parse_symbol_list, PipelineConfig, StreamKind},
    models::Timeframe,
    pipeline::VolumePipeline,
    status::PipelineStatus,
    storage::{SqliteStore, VolumeStore},
};

#[derive(Parser, Debug)]
#[command(name = "tapeflow")]
#[command(about = "Ingest exchange trade streams into time-bucketed buy/sell volume")]
struct Cli {
    /// TOML config file (overrides TAPEFLOW_CONFIG_PATH)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// SQLite database path
    #[arg(long, env = "TAPEFLOW_DB_PATH", global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ingestion pipeline until Ctrl-C
    Run {
        /// Comma-separated symbols
        #[arg(long)]
        symbols: Option<String>,

        /// Bucket width (1s, 1m, 1h, ...)
        #[arg(short, long)]
        timeframe: Option<Timeframe>,

        /// Subscribe to depth instead of trades
        #[arg(long)]
        depth: bool,

        /// Also persist every raw trade
        #[arg(long)]
        record_raw_trades: bool,

        /// Log a status line every N seconds (0 = never)
        #[arg(long, default_value = "30")]
        status_interval_secs: u64,
    },

    /// Print volume points as JSON
    Query {
        #[arg(short, long)]
        symbol: String,

        /// Start time (epoch ms or RFC 3339)
        #[arg(long)]
        start: String,

        /// End time (epoch ms or RFC 3339)
        #[arg(long)]
        end: String,

        #[arg(short, long, default_value = "1m")]
        timeframe: Timeframe,
    },

    /// Print OHLC candles built from raw trades as JSON
    Candles {
        #[arg(short, long)]
        symbol: String,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        #[arg(short, long, default_value = "1m")]
        timeframe: Timeframe,
    },

    /// Print store statistics and recent connection events
    Stats {
        /// Connection log entries to show
        #[arg(long, default_value = "10")]
        log_limit: usize,

        /// Restrict the connection log to one symbol
        #[arg(short, long)]
        symbol: Option<String>,
    },

    /// Delete buckets and raw trades older than a cutoff
    Prune {
        /// Cutoff (epoch ms or RFC 3339)
        #[arg(long)]
        before: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = PipelineConfig::load(path)
                .with_context(|| format!("Failed to load config: {}", path))?;
            config.apply_env_overrides();
            config
        }
        None => PipelineConfig::from_env(),
    };
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }

    match cli.command {
        Commands::Run {
            symbols,
            timeframe,
            depth,
            record_raw_trades,
            status_interval_secs,
        } => {
            if let Some(symbols) = symbols {
                config.symbols = parse_symbol_list(&symbols);
            }
            if depth {
                config.stream_kind = StreamKind::Depth;
            }
            config.record_raw_trades |= record_raw_trades;
            run(config, timeframe, status_interval_secs).await
        }
        Commands::Query {
            symbol,
            start,
            end,
            timeframe,
        } => {
            let pipeline = open_pipeline(config)?;
            let points = pipeline
                .query_volume(&symbol.to_ascii_lowercase(), parse_time(&start)?, parse_time(&end)?, timeframe)
                .await
                .context("Volume query failed")?;
            println!("{}", serde_json::to_string_pretty(&points)?);
            Ok(())
        }
        Commands::Candles {
            symbol,
            start,
            end,
            timeframe,
        } => {
            let pipeline = open_pipeline(config)?;
            let candles = pipeline
                .query_candles(&symbol.to_ascii_lowercase(), parse_time(&start)?, parse_time(&end)?, timeframe)
                .await
                .context("Candle query failed")?;
            println!("{}", serde_json::to_string_pretty(&candles)?);
            Ok(())
        }
        Commands::Stats { log_limit, symbol } => {
            let store = SqliteStore::open(&config.db_path)
                .with_context(|| format!("Failed to open database: {}", config.db_path))?;
            let stats = store.get_stats().context("Failed to read stats")?;
            let log = store
                .connection_log(symbol.as_deref(), log_limit)
                .context("Failed to read connection log")?;
            let out = serde_json::json!({ "stats": stats, "connection_log": log });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Commands::Prune { before } => {
            let cutoff = parse_time(&before)?;
            let store = SqliteStore::open(&config.db_path)
                .with_context(|| format!("Failed to open database: {}", config.db_path))?;
            let report = store.prune_before(cutoff).context("Prune failed")?;
            store.optimize().context("Optimize failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn open_pipeline(config: PipelineConfig) -> Result<VolumePipeline> {
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("Failed to open database: {}", config.db_path))?;
    Ok(VolumePipeline::with_store(config, Arc::new(store)))
}

async fn run(config: PipelineConfig, timeframe: Option<Timeframe>, status_interval_secs: u64) -> Result<()> {
    let pipeline = VolumePipeline::new(config).context("Failed to create pipeline")?;
    pipeline
        .start(timeframe)
        .context("Failed to start pipeline")?;

    info!(
        db_path = %pipeline.config().db_path,
        symbols = ?pipeline.config().symbols,
        "tapeflow running, Ctrl-C to stop"
    );

    let period = Duration::from_secs(status_interval_secs.max(1));
    let mut status_tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = status_tick.tick(), if status_interval_secs > 0 => {
                log_status(&pipeline.status().await);
            }
        }
    }

    if let Some(report) = pipeline.stop().await {
        info!(
            buckets = report.buckets_written,
            raw_trades = report.raw_trades_written,
            "final flush complete"
        );
    }
    Ok(())
}

fn log_status(status: &PipelineStatus) {
    let buffer = status.buffer.clone().unwrap_or_default();
    let flush = status.flush.clone().unwrap_or_default();
    info!(
        connected = status.connected_symbols(),
        symbols = status.per_symbol.len(),
        live_buckets = buffer.live_buckets,
        events = buffer.events_ingested,
        flush_cycles = flush.cycles,
        buckets_written = flush.buckets_written,
        buckets_dropped = flush.buckets_dropped,
        "status"
    );
    for (symbol, s) in &status.per_symbol {
        if let Some(err) = &s.last_error {
            warn!(symbol = %symbol, state = %s.state, reconnects = s.reconnect_count, error = %err, "symbol_degraded");
        }
    }
}

/// Epoch milliseconds or an RFC 3339 timestamp.
fn parse_time(raw: &str) -> Result<i64> {
    if let Ok(ms) = raw.trim().parse::<i64>() {
        return Ok(ms);
    }
    let dt = DateTime::parse_from_rfc3339(raw.trim())
        .with_context(|| format!("Invalid time {:?}: expected epoch ms or RFC 3339", raw))?;
    Ok(dt.timestamp_millis())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tapeflow_backend=info,tapeflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also try the package's own .env when launched from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapeflow_backend::feed::{ConnectionState, SymbolStatus};

    #[test]
    fn test_parse_time_accepts_ms_and_rfc3339() {
        assert_eq!(parse_time("1704067200000").unwrap(), 1_704_067_200_000);
        assert_eq!(parse_time(" -5 ").unwrap(), -5);
        assert_eq!(
            parse_time("2024-01-01T00:00:00Z").unwrap(),
            1_704_067_200_000
        );
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn test_log_status_leaves_status_usable() {
        let mut status = PipelineStatus::default();
        status.per_symbol.insert(
            "btcusdt".to_string(),
            SymbolStatus {
                state: ConnectionState::Error,
                reconnect_count: 2,
                last_connected: None,
                last_disconnected: Some(1),
                last_error: Some("connect failed".to_string()),
                total_reconnects: 2,
                messages_received: 0,
                malformed_messages: 0,
            },
        );

        log_status(&status);
        log_status(&PipelineStatus::default());
        assert_eq!(status.connected_symbols(), 0);
        assert!(status.buffer.is_none());
    }
}
