use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::ConfigError;

/// Wall-clock milliseconds since the Unix epoch.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// =============================================================================
// TIMEFRAME
// =============================================================================

/// Bucket width, held in milliseconds.
///
/// Parsed from `<n><unit>` where unit is one of `ms`, `s`, `m`, `h`, `d`, `w`
/// (`"1s"`, `"5m"`, `"4h"`). Serialized back to the same short form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timeframe(i64);

impl Timeframe {
    pub const ONE_SECOND: Timeframe = Timeframe(1_000);
    pub const ONE_MINUTE: Timeframe = Timeframe(60_000);
    pub const ONE_HOUR: Timeframe = Timeframe(3_600_000);

    pub fn from_millis(ms: i64) -> Result<Self, ConfigError> {
        if ms <= 0 {
            return Err(ConfigError::InvalidTimeframe(format!("{}ms", ms)));
        }
        Ok(Self(ms))
    }

    #[inline]
    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Start of the bucket containing `ts_ms`: `floor(ts / tf) * tf`.
    ///
    /// Floors toward negative infinity so pre-epoch timestamps still land in
    /// the bucket that contains them. The first bucket below `i64::MIN` is
    /// not representable and is clamped to start at `i64::MIN`.
    #[inline]
    pub fn bucket_start(&self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.0).saturating_mul(self.0)
    }

    /// True if buckets of `finer` tile buckets of `self` exactly.
    #[inline]
    pub fn is_multiple_of(&self, finer: Timeframe) -> bool {
        self.0 % finer.0 == 0
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::ONE_SECOND
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[(i64, &str)] = &[
            (604_800_000, "w"),
            (86_400_000, "d"),
            (3_600_000, "h"),
            (60_000, "m"),
            (1_000, "s"),
        ];
        for &(unit_ms, suffix) in UNITS {
            if self.0 % unit_ms == 0 {
                return write!(f, "{}{}", self.0 / unit_ms, suffix);
            }
        }
        write!(f, "{}ms", self.0)
    }
}

impl FromStr for Timeframe {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        let invalid = || ConfigError::InvalidTimeframe(s.to_string());

        let split = raw
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (digits, unit) = raw.split_at(split);
        let n: i64 = digits.parse().map_err(|_| invalid())?;

        let unit_ms = match unit {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            _ => return Err(invalid()),
        };

        let ms = n.checked_mul(unit_ms).ok_or_else(invalid)?;
        Self::from_millis(ms).map_err(|_| invalid())
    }
}

impl Serialize for Timeframe {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// MARKET EVENTS
// =============================================================================

/// A single executed trade from the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol: String,
    pub event_time: i64,
    pub price: f64,
    pub quantity: f64,
    /// True when the buyer was the resting order, i.e. the taker sold.
    pub is_buyer_maker: bool,
}

/// Order-book depth update: `[price, quantity]` levels, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub symbol: String,
    pub event_time: i64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Trade(TradeEvent),
    Depth(DepthUpdate),
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Trade(t) => &t.symbol,
            MarketEvent::Depth(d) => &d.symbol,
        }
    }

    pub fn event_time(&self) -> i64 {
        match self {
            MarketEvent::Trade(t) => t.event_time,
            MarketEvent::Depth(d) => d.event_time,
        }
    }
}

// =============================================================================
// PERSISTED RECORDS
// =============================================================================

/// Accumulated buy/sell volume for one `(symbol, timeframe, bucket_start)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeBucket {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bucket_start: i64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    /// Latest event time folded into this bucket.
    pub last_event_time: i64,
}

impl VolumeBucket {
    #[inline]
    pub fn total_volume(&self) -> f64 {
        self.buy_volume + self.sell_volume
    }
}

/// Immutable raw trade row, kept for exact re-aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrade {
    pub timestamp: i64,
    pub pair: String,
    pub price: f64,
    pub quantity: f64,
    pub is_buyer_maker: bool,
}

impl From<&TradeEvent> for RawTrade {
    fn from(t: &TradeEvent) -> Self {
        Self {
            timestamp: t.event_time,
            pair: t.symbol.clone(),
            price: t.price,
            quantity: t.quantity,
            is_buyer_maker: t.is_buyer_maker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    Connect,
    Disconnect,
    Error,
    ReconnectAttempt,
}

impl ConnectionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEventKind::Connect => "connect",
            ConnectionEventKind::Disconnect => "disconnect",
            ConnectionEventKind::Error => "error",
            ConnectionEventKind::ReconnectAttempt => "reconnect_attempt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connect" => Some(ConnectionEventKind::Connect),
            "disconnect" => Some(ConnectionEventKind::Disconnect),
            "error" => Some(ConnectionEventKind::Error),
            "reconnect_attempt" => Some(ConnectionEventKind::ReconnectAttempt),
            _ => None,
        }
    }
}

/// Append-only connection audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionLogEntry {
    pub timestamp: i64,
    pub symbol: String,
    pub event: ConnectionEventKind,
    pub details: String,
}

impl ConnectionLogEntry {
    pub fn now(symbol: &str, event: ConnectionEventKind, details: impl Into<String>) -> Self {
        Self {
            timestamp: now_ms(),
            symbol: symbol.to_string(),
            event,
            details: details.into(),
        }
    }
}

// =============================================================================
// QUERY RESULTS
// =============================================================================

/// One point of a `query_volume` answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumePoint {
    pub time: i64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

/// OHLC candle built from raw trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub trades: u64,
}
