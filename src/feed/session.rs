//! Per-symbol stream session
//!
//! - Connection state machine (connecting, connected, disconnected, error)
//! - Exponential backoff, reset on successful open
//! - Liveness monitoring (no inbound frame for N ms while connected)
//! - Reconnect decision on close
//!
//! A `SymbolSession` is mutated only by its own symbol task. Readers
//! (status) take short read locks.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::error::FeedError;
use crate::models::now_ms;

/// Close code sent for a normal, intentional shutdown.
pub const NORMAL_CLOSE_CODE: u16 = 1000;
/// Close code recorded when the stream ends without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Receiving market data
    Connected,
    /// Closed; a reconnect may be pending
    Disconnected,
    /// Transient, always followed by `Disconnected`
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Reason for a state transition (logging only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    BackoffElapsed,
    ConnectSuccess,
    ConnectTimeout,
    NetworkError,
    ServerClose,
    StreamEnded,
    LivenessTimeout,
    ShutdownRequested,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::BackoffElapsed => write!(f, "backoff_elapsed"),
            Self::ConnectSuccess => write!(f, "connect_ok"),
            Self::ConnectTimeout => write!(f, "connect_timeout"),
            Self::NetworkError => write!(f, "network_error"),
            Self::ServerClose => write!(f, "server_close"),
            Self::StreamEnded => write!(f, "stream_ended"),
            Self::LivenessTimeout => write!(f, "liveness_timeout"),
            Self::ShutdownRequested => write!(f, "shutdown"),
        }
    }
}

/// How a single connection ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// `stop()` closed the connection.
    Shutdown,
    /// Peer sent a close frame.
    Closed { code: u16, reason: String },
    /// Transport failure, handshake failure or liveness timeout.
    Failed {
        reason: TransitionReason,
        error: FeedError,
    },
}

impl SessionEnd {
    /// Close code as seen by the reconnect policy.
    pub fn close_code(&self) -> u16 {
        match self {
            SessionEnd::Shutdown => NORMAL_CLOSE_CODE,
            SessionEnd::Closed { code, .. } => *code,
            SessionEnd::Failed { .. } => ABNORMAL_CLOSE_CODE,
        }
    }

    pub fn reason(&self) -> TransitionReason {
        match self {
            SessionEnd::Shutdown => TransitionReason::ShutdownRequested,
            SessionEnd::Closed { .. } => TransitionReason::ServerClose,
            SessionEnd::Failed { reason, .. } => *reason,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SessionEnd::Shutdown => "closed by stop()".to_string(),
            SessionEnd::Closed { code, reason } if reason.is_empty() => {
                format!("close code {}", code)
            }
            SessionEnd::Closed { code, reason } => format!("close code {}: {}", code, reason),
            SessionEnd::Failed { error, .. } => error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Reconnect { delay: Duration, attempt: u32 },
    Stop,
}

// =============================================================================
// EXPONENTIAL BACKOFF
// =============================================================================

/// `min(base * multiplier^attempt, cap)`, with optional ±jitter.
///
/// With `jitter_factor == 0` the sequence is non-decreasing until `reset()`.
#[derive(Debug)]
pub struct BackoffCalculator {
    base_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
    attempt: u32,
    rng_state: u64,
}

impl BackoffCalculator {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(12345)
                | 1,
        }
    }

    /// xorshift64
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    /// Delay for the current attempt, then advance the attempt counter.
    pub fn next_backoff(&mut self) -> Duration {
        let raw = (self.base_ms as f64) * self.multiplier.powi(self.attempt.min(64) as i32);
        let capped = raw.min(self.max_ms as f64);

        let final_ms = if self.jitter_factor > 0.0 {
            let jitter = (self.next_random() * 2.0 - 1.0) * capped * self.jitter_factor;
            (capped + jitter).clamp(self.base_ms as f64, self.max_ms as f64)
        } else {
            capped
        };

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(final_ms as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// =============================================================================
// LIVENESS MONITOR
// =============================================================================

/// Tracks time since the last inbound frame on a connected stream.
#[derive(Debug)]
pub struct LivenessMonitor {
    timeout: Option<Duration>,
    last_received: Instant,
}

impl LivenessMonitor {
    /// `timeout_ms == 0` disables the check.
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            last_received: Instant::now(),
        }
    }

    #[inline]
    pub fn record_received(&mut self) {
        self.last_received = Instant::now();
    }

    pub fn is_stale(&self) -> bool {
        match self.timeout {
            Some(timeout) => self.last_received.elapsed() > timeout,
            None => false,
        }
    }

    /// How often the owner should call `is_stale()`.
    pub fn check_interval(&self) -> Duration {
        match self.timeout {
            Some(timeout) => (timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(5)),
            None => Duration::from_secs(3600),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

// =============================================================================
// SESSION METRICS
// =============================================================================

#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub connections_attempted: AtomicU64,
    pub connections_succeeded: AtomicU64,
    pub disconnects: AtomicU64,
    pub reconnects_scheduled: AtomicU64,
    pub liveness_timeouts: AtomicU64,
    pub messages_received: AtomicU64,
    pub malformed_messages: AtomicU64,
}

impl SessionMetrics {
    #[inline]
    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} disconnects={} reconnects={} liveness_timeouts={} messages={} malformed={}",
            self.connections_succeeded.load(Ordering::Relaxed),
            self.connections_attempted.load(Ordering::Relaxed),
            self.disconnects.load(Ordering::Relaxed),
            self.reconnects_scheduled.load(Ordering::Relaxed),
            self.liveness_timeouts.load(Ordering::Relaxed),
            self.messages_received.load(Ordering::Relaxed),
            self.malformed_messages.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// SYMBOL SESSION
// =============================================================================

/// Point-in-time view of one symbol's stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolStatus {
    pub state: ConnectionState,
    /// Consecutive failed or closed connections since the last successful open
    pub reconnect_count: u32,
    pub last_connected: Option<i64>,
    pub last_disconnected: Option<i64>,
    pub last_error: Option<String>,
    pub total_reconnects: u64,
    pub messages_received: u64,
    pub malformed_messages: u64,
}

#[derive(Debug)]
struct StreamState {
    state: ConnectionState,
    last_connected: Option<i64>,
    last_disconnected: Option<i64>,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct SymbolSession {
    symbol: String,
    reconnect_on_normal_close: bool,
    stream: RwLock<StreamState>,
    backoff: Mutex<BackoffCalculator>,
    metrics: SessionMetrics,
}

impl SymbolSession {
    pub fn new(symbol: impl Into<String>, config: &ReconnectConfig) -> Self {
        Self {
            symbol: symbol.into(),
            reconnect_on_normal_close: config.reconnect_on_normal_close,
            stream: RwLock::new(StreamState {
                state: ConnectionState::Disconnected,
                last_connected: None,
                last_disconnected: None,
                last_error: None,
            }),
            backoff: Mutex::new(BackoffCalculator::new(config)),
            metrics: SessionMetrics::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> ConnectionState {
        self.stream.read().state
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    fn transition(&self, new_state: ConnectionState, reason: TransitionReason) {
        let old_state = {
            let mut stream = self.stream.write();
            let old = stream.state;
            stream.state = new_state;
            old
        };

        info!(
            symbol = %self.symbol,
            from = %old_state,
            to = %new_state,
            reason = %reason,
            "session_transition"
        );
    }

    /// `disconnected -> connecting`
    pub fn on_connecting(&self, reason: TransitionReason) {
        self.metrics
            .connections_attempted
            .fetch_add(1, Ordering::Relaxed);
        self.transition(ConnectionState::Connecting, reason);
    }

    /// Handshake succeeded: reset backoff, record the time.
    pub fn on_open(&self) {
        self.metrics
            .connections_succeeded
            .fetch_add(1, Ordering::Relaxed);
        self.backoff.lock().reset();
        self.stream.write().last_connected = Some(now_ms());
        self.transition(ConnectionState::Connected, TransitionReason::ConnectSuccess);
    }

    /// Record an error without tearing the connection down (protocol errors).
    pub fn record_error(&self, error: &FeedError) {
        self.stream.write().last_error = Some(error.to_string());
    }

    /// Connection ended. Moves through `error` on failures, lands in
    /// `disconnected` and decides whether to reconnect.
    ///
    /// `stopped` must reflect the supervisor's stop flag at call time.
    pub fn on_close(&self, end: &SessionEnd, stopped: bool) -> ReconnectDecision {
        if let SessionEnd::Failed { error, reason } = end {
            self.record_error(error);
            if *reason == TransitionReason::LivenessTimeout {
                self.metrics.liveness_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            self.transition(ConnectionState::Error, *reason);
        }

        self.metrics.disconnects.fetch_add(1, Ordering::Relaxed);
        self.stream.write().last_disconnected = Some(now_ms());
        self.transition(ConnectionState::Disconnected, end.reason());

        if stopped || matches!(end, SessionEnd::Shutdown) {
            return ReconnectDecision::Stop;
        }
        if end.close_code() == NORMAL_CLOSE_CODE && !self.reconnect_on_normal_close {
            debug!(symbol = %self.symbol, "normal_close_no_reconnect");
            return ReconnectDecision::Stop;
        }

        let (delay, attempt) = {
            let mut backoff = self.backoff.lock();
            let delay = backoff.next_backoff();
            (delay, backoff.attempt())
        };
        self.metrics
            .reconnects_scheduled
            .fetch_add(1, Ordering::Relaxed);

        warn!(
            symbol = %self.symbol,
            attempt,
            backoff_ms = delay.as_millis() as u64,
            close_code = end.close_code(),
            "reconnect_backoff"
        );

        ReconnectDecision::Reconnect { delay, attempt }
    }

    pub fn status(&self) -> SymbolStatus {
        let stream = self.stream.read();
        SymbolStatus {
            state: stream.state,
            reconnect_count: self.backoff.lock().attempt(),
            last_connected: stream.last_connected,
            last_disconnected: stream.last_disconnected,
            last_error: stream.last_error.clone(),
            total_reconnects: self.metrics.reconnects_scheduled.load(Ordering::Relaxed),
            messages_received: self.metrics.messages_received.load(Ordering::Relaxed),
            malformed_messages: self.metrics.malformed_messages.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
