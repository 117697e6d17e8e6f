//! Pipeline configuration
//!
//! Loaded from a TOML file with per-field defaults, then overridden by
//! `TAPEFLOW_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::models::Timeframe;

/// Which upstream stream each symbol subscribes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// `<symbol>@trade`: exact taker-side volume.
    #[default]
    Trade,
    /// `<symbol>@depth<N>@100ms`: heuristic volume from book levels.
    Depth,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Symbols to track, lowercase exchange form (`btcusdt`)
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Bucket width used when `start()` is called without one
    #[serde(default)]
    pub default_timeframe: Timeframe,

    /// FlushScheduler tick interval
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Raw trades per insert transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// SQLite database path (`:memory:` allowed)
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Persist every decoded trade in addition to buckets
    #[serde(default)]
    pub record_raw_trades: bool,

    #[serde(default)]
    pub stream_kind: StreamKind,

    /// Base WebSocket URL; the stream name is appended as a path segment
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub depth: DepthHeuristicConfig,
}

fn default_symbols() -> Vec<String> {
    vec!["btcusdt".to_string(), "ethusdt".to_string()]
}
fn default_flush_interval_ms() -> u64 {
    5_000
}
fn default_batch_size() -> usize {
    500
}
fn default_db_path() -> String {
    "tapeflow.db".to_string()
}
fn default_ws_base_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            default_timeframe: Timeframe::default(),
            flush_interval_ms: default_flush_interval_ms(),
            batch_size: default_batch_size(),
            db_path: default_db_path(),
            record_raw_trades: false,
            stream_kind: StreamKind::default(),
            ws_base_url: default_ws_base_url(),
            reconnect: ReconnectConfig::default(),
            depth: DepthHeuristicConfig::default(),
        }
    }
}

/// Reconnect policy and connection health parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Fractional ±jitter applied to each delay; non-zero breaks monotonicity
    #[serde(default)]
    pub jitter_factor: f64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Force a reconnect when connected but silent this long (0 = off)
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    /// Reconnect after a close frame with code 1000
    #[serde(default)]
    pub reconnect_on_normal_close: bool,
}

fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_liveness_timeout_ms() -> u64 {
    60_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: 0.0,
            connect_timeout_ms: default_connect_timeout_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            reconnect_on_normal_close: false,
        }
    }
}

/// Depth-to-volume approximation parameters.
///
/// Resting book liquidity is not traded volume. The depth stream only yields
/// an estimate: the notional of the best `top_levels` on each side, scaled by
/// `volume_scale`. Treat the output as a proxy, never as a measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthHeuristicConfig {
    #[serde(default = "default_depth_top_levels")]
    pub top_levels: usize,
    #[serde(default = "default_depth_volume_scale")]
    pub volume_scale: f64,
}

fn default_depth_top_levels() -> usize {
    10
}
fn default_depth_volume_scale() -> f64 {
    0.1
}

impl Default for DepthHeuristicConfig {
    fn default() -> Self {
        Self {
            top_levels: default_depth_top_levels(),
            volume_scale: default_depth_volume_scale(),
        }
    }
}

impl PipelineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let load_err = |reason: String| ConfigError::Load {
            path: path.display().to_string(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        toml::from_str(&contents).map_err(|e| load_err(e.to_string()))
    }

    /// Load `TAPEFLOW_CONFIG_PATH` (or `tapeflow.toml`) if present, then apply
    /// environment overrides.
    pub fn from_env() -> Self {
        let path =
            std::env::var("TAPEFLOW_CONFIG_PATH").unwrap_or_else(|_| "tapeflow.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default pipeline config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TAPEFLOW_SYMBOLS") {
            self.symbols = parse_symbol_list(&v);
        }
        if let Ok(v) = std::env::var("TAPEFLOW_TIMEFRAME") {
            match v.parse() {
                Ok(tf) => self.default_timeframe = tf,
                Err(e) => tracing::warn!(value = %v, error = %e, "ignoring TAPEFLOW_TIMEFRAME"),
            }
        }
        if let Ok(v) = std::env::var("TAPEFLOW_FLUSH_INTERVAL_MS") {
            self.flush_interval_ms = v.parse().unwrap_or(self.flush_interval_ms);
        }
        if let Ok(v) = std::env::var("TAPEFLOW_BATCH_SIZE") {
            self.batch_size = v.parse().unwrap_or(self.batch_size);
        }
        if let Ok(v) = std::env::var("TAPEFLOW_DB_PATH") {
            if !v.trim().is_empty() {
                self.db_path = v;
            }
        }
        if let Ok(v) = std::env::var("TAPEFLOW_RECORD_RAW_TRADES") {
            self.record_raw_trades = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(v) = std::env::var("TAPEFLOW_WS_BASE_URL") {
            if !v.trim().is_empty() {
                self.ws_base_url = v;
            }
        }
        if let Ok(v) = std::env::var("TAPEFLOW_BACKOFF_BASE_MS") {
            self.reconnect.backoff_base_ms = v.parse().unwrap_or(self.reconnect.backoff_base_ms);
        }
        if let Ok(v) = std::env::var("TAPEFLOW_BACKOFF_MAX_MS") {
            self.reconnect.backoff_max_ms = v.parse().unwrap_or(self.reconnect.backoff_max_ms);
        }
        if let Ok(v) = std::env::var("TAPEFLOW_LIVENESS_TIMEOUT_MS") {
            self.reconnect.liveness_timeout_ms =
                v.parse().unwrap_or(self.reconnect.liveness_timeout_ms);
        }
    }

    /// Reject configurations `start()` cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        for symbol in &self.symbols {
            validate_symbol(symbol)?;
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "flush_interval_ms",
                reason: "must be > 0".into(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "batch_size",
                reason: "must be > 0".into(),
            });
        }
        let r = &self.reconnect;
        if r.backoff_base_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "reconnect.backoff_base_ms",
                reason: "must be > 0".into(),
            });
        }
        if r.backoff_max_ms < r.backoff_base_ms {
            return Err(ConfigError::InvalidSetting {
                field: "reconnect.backoff_max_ms",
                reason: format!("{} is below base {}", r.backoff_max_ms, r.backoff_base_ms),
            });
        }
        if r.backoff_multiplier.is_nan() || r.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidSetting {
                field: "reconnect.backoff_multiplier",
                reason: format!("{} must be >= 1.0", r.backoff_multiplier),
            });
        }
        if !(0.0..1.0).contains(&r.jitter_factor) {
            return Err(ConfigError::InvalidSetting {
                field: "reconnect.jitter_factor",
                reason: format!("{} must be in [0, 1)", r.jitter_factor),
            });
        }
        if self.stream_kind == StreamKind::Depth {
            if self.depth.top_levels == 0 {
                return Err(ConfigError::InvalidSetting {
                    field: "depth.top_levels",
                    reason: "must be > 0".into(),
                });
            }
            if !self.depth.volume_scale.is_finite() || self.depth.volume_scale <= 0.0 {
                return Err(ConfigError::InvalidSetting {
                    field: "depth.volume_scale",
                    reason: format!("{} must be a positive number", self.depth.volume_scale),
                });
            }
        }
        Ok(())
    }
}

/// Symbols are exchange tickers: non-empty ASCII alphanumerics.
pub fn validate_symbol(symbol: &str) -> Result<(), ConfigError> {
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ConfigError::InvalidSymbol(symbol.to_string()));
    }
    Ok(())
}

/// Split a comma-separated symbol list, normalizing to lowercase.
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flush_interval_ms, 5_000);
        assert_eq!(config.default_timeframe, Timeframe::ONE_SECOND);
    }

    #[test]
    fn test_toml_partial_uses_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            symbols = ["solusdt"]
            default_timeframe = "1m"

            [reconnect]
            backoff_base_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.symbols, vec!["solusdt".to_string()]);
        assert_eq!(config.default_timeframe.as_millis(), 60_000);
        assert_eq!(config.reconnect.backoff_base_ms, 500);
        assert_eq!(config.reconnect.backoff_max_ms, 30_000);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.stream_kind, StreamKind::Trade);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = PipelineConfig::default();
        config.symbols.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoSymbols));

        let mut config = PipelineConfig::default();
        config.symbols = vec!["btc/usdt".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSymbol(_))
        ));

        let mut config = PipelineConfig::default();
        config.flush_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.reconnect.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.reconnect.backoff_max_ms = 10;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.stream_kind = StreamKind::Depth;
        config.depth.volume_scale = 0.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.reconnect.backoff_multiplier = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.stream_kind = StreamKind::Depth;
        config.depth.volume_scale = f64::NAN;
        assert!(config.validate().is_err());
        config.depth.volume_scale = f64::INFINITY;
        assert!(config.validate().is_err());
        config.depth.volume_scale = 0.25;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stream_kind_defaults_to_trade() {
        assert_eq!(StreamKind::default(), StreamKind::Trade);
        assert_eq!(PipelineConfig::default().stream_kind, StreamKind::Trade);
    }

    #[test]
    fn test_parse_symbol_list() {
        assert_eq!(
            parse_symbol_list(" BTCUSDT, ethusdt ,,"),
            vec!["btcusdt".to_string(), "ethusdt".to_string()]
        );
    }
}
