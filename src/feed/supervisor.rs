//! Connection supervisor
//!
//! One tokio task per symbol. Each task owns its stream end to end:
//! connect (bounded by a timeout), read frames in order, decode, hand events
//! to the sink, then on close decide whether to reconnect and sleep the
//! backoff. A symbol task is the only pending timer for its symbol, so two
//! live connections for one symbol cannot exist.
//!
//! `stop()` sets the stop flag, signals every task, waits for them to exit
//! and leaves every stream `disconnected`.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::{sync::watch, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, error, info, trace, warn};

use super::codec::FeedCodec;
use super::session::{
    ReconnectDecision, SessionEnd, SymbolSession, SymbolStatus, TransitionReason,
    ABNORMAL_CLOSE_CODE,
};
use crate::config::ReconnectConfig;
use crate::error::FeedError;
use crate::ingest::EventSink;
use crate::models::{ConnectionEventKind, ConnectionLogEntry};
use crate::storage::VolumeStore;

/// Upper bound on sending our own close frame during shutdown.
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Static settings shared by all symbol tasks.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub ws_base_url: String,
    pub reconnect: ReconnectConfig,
}

/// Everything a symbol task needs.
struct SymbolTask {
    session: Arc<SymbolSession>,
    url: String,
    codec: FeedCodec,
    config: SupervisorConfig,
    sink: Arc<dyn EventSink>,
    store: Option<Arc<dyn VolumeStore>>,
    stopped: Arc<AtomicBool>,
}

pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    codec: FeedCodec,
    sink: Arc<dyn EventSink>,
    store: Option<Arc<dyn VolumeStore>>,
    sessions: RwLock<HashMap<String, Arc<SymbolSession>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionSupervisor {
    /// `store` receives the connection audit log when present.
    pub fn new(
        config: SupervisorConfig,
        codec: FeedCodec,
        sink: Arc<dyn EventSink>,
        store: Option<Arc<dyn VolumeStore>>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            codec,
            sink,
            store,
            sessions: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Begin one independent connection per symbol. Symbols already tracked
    /// are skipped. Must be called inside a tokio runtime.
    pub fn start(&self, symbols: &[String]) {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("supervisor_start_after_stop_ignored");
            return;
        }

        let mut sessions = self.sessions.write();
        let mut tasks = self.tasks.lock();

        for symbol in symbols {
            if sessions.contains_key(symbol) {
                debug!(symbol = %symbol, "symbol_already_tracked");
                continue;
            }

            let session = Arc::new(SymbolSession::new(symbol.clone(), &self.config.reconnect));
            sessions.insert(symbol.clone(), session.clone());

            let task = Arc::new(SymbolTask {
                session,
                url: self.codec.stream_url(&self.config.ws_base_url, symbol),
                codec: self.codec.clone(),
                config: self.config.clone(),
                sink: self.sink.clone(),
                store: self.store.clone(),
                stopped: self.stopped.clone(),
            });
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(run_symbol(task, shutdown)));
        }

        info!(symbols = sessions.len(), "supervisor_started");
    }

    /// Close every live connection, cancel every pending reconnect and wait
    /// for all symbol tasks to exit.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "symbol_task_join_failed");
            }
        }

        for session in self.sessions.read().values() {
            info!(symbol = %session.symbol(), metrics = %session.metrics().summary(), "session_summary");
        }
        info!("supervisor_stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> BTreeMap<String, SymbolStatus> {
        self.sessions
            .read()
            .iter()
            .map(|(symbol, session)| (symbol.clone(), session.status()))
            .collect()
    }

    pub fn symbol_status(&self, symbol: &str) -> Option<SymbolStatus> {
        self.sessions.read().get(symbol).map(|s| s.status())
    }
}

// =============================================================================
// SYMBOL TASK
// =============================================================================

async fn run_symbol(task: Arc<SymbolTask>, mut shutdown: watch::Receiver<bool>) {
    let symbol = task.session.symbol().to_string();
    let mut reason = TransitionReason::Started;

    loop {
        if task.stopped.load(Ordering::SeqCst) {
            break;
        }

        task.session.on_connecting(reason);
        let end = run_connection(&task, &mut shutdown).await;

        let kind = match &end {
            SessionEnd::Failed { .. } => ConnectionEventKind::Error,
            _ => ConnectionEventKind::Disconnect,
        };
        task.log_event(kind, end.describe()).await;

        let decision = task
            .session
            .on_close(&end, task.stopped.load(Ordering::SeqCst));

        match decision {
            ReconnectDecision::Stop => break,
            ReconnectDecision::Reconnect { delay, attempt } => {
                task.log_event(
                    ConnectionEventKind::ReconnectAttempt,
                    format!("attempt {} in {}ms", attempt, delay.as_millis()),
                )
                .await;

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }

                // Re-check at fire time: stop() may have raced the timer
                if task.stopped.load(Ordering::SeqCst) {
                    break;
                }
                reason = TransitionReason::BackoffElapsed;
            }
        }
    }

    debug!(symbol = %symbol, "symbol_task_exit");
}

async fn run_connection(task: &SymbolTask, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
    let session = &task.session;
    let connect_timeout = Duration::from_millis(task.config.reconnect.connect_timeout_ms);

    debug!(symbol = %session.symbol(), url = %task.url, "connecting");

    let connect = tokio::select! {
        result = tokio::time::timeout(connect_timeout, connect_async(task.url.as_str())) => result,
        _ = shutdown.changed() => return SessionEnd::Shutdown,
    };

    let ws_stream = match connect {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            return SessionEnd::Failed {
                reason: TransitionReason::NetworkError,
                error: FeedError::Transport(format!("connect failed: {}", e)),
            }
        }
        Err(_) => {
            return SessionEnd::Failed {
                reason: TransitionReason::ConnectTimeout,
                error: FeedError::Transport(format!(
                    "connect timeout after {}ms",
                    connect_timeout.as_millis()
                )),
            }
        }
    };

    session.on_open();
    task.log_event(ConnectionEventKind::Connect, task.url.clone())
        .await;

    let (mut write, mut read) = ws_stream.split();
    let mut liveness = super::session::LivenessMonitor::new(task.config.reconnect.liveness_timeout_ms);
    let mut liveness_check = tokio::time::interval(liveness.check_interval());
    liveness_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "shutdown".into(),
                };
                let _ = tokio::time::timeout(
                    CLOSE_SEND_TIMEOUT,
                    write.send(Message::Close(Some(frame))),
                )
                .await;
                return SessionEnd::Shutdown;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        liveness.record_received();
                        task.handle_payload(text.into_bytes());
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        liveness.record_received();
                        task.handle_payload(bytes);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        liveness.record_received();
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            return SessionEnd::Failed {
                                reason: TransitionReason::NetworkError,
                                error: FeedError::Transport(format!("pong failed: {}", e)),
                            };
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (u16::from(f.code), f.reason.to_string()),
                            None => (ABNORMAL_CLOSE_CODE, String::new()),
                        };
                        info!(symbol = %session.symbol(), code, reason = %reason, "server_close");
                        return SessionEnd::Closed { code, reason };
                    }
                    Some(Ok(_)) => {
                        liveness.record_received();
                    }
                    Some(Err(e)) => {
                        warn!(symbol = %session.symbol(), error = %e, "ws_error");
                        return SessionEnd::Failed {
                            reason: TransitionReason::NetworkError,
                            error: FeedError::Transport(e.to_string()),
                        };
                    }
                    None => {
                        warn!(symbol = %session.symbol(), "stream_ended");
                        return SessionEnd::Failed {
                            reason: TransitionReason::StreamEnded,
                            error: FeedError::Transport("stream ended without close frame".into()),
                        };
                    }
                }
            }

            _ = liveness_check.tick() => {
                if liveness.is_stale() {
                    let timeout_ms = liveness.timeout().map(|t| t.as_millis()).unwrap_or_default();
                    warn!(symbol = %session.symbol(), timeout_ms = timeout_ms as u64, "liveness_timeout");
                    return SessionEnd::Failed {
                        reason: TransitionReason::LivenessTimeout,
                        error: FeedError::Transport(format!("no message for {}ms", timeout_ms)),
                    };
                }
            }
        }
    }
}

impl SymbolTask {
    /// Decode and forward one frame. Malformed frames are counted and
    /// dropped; the connection stays up.
    fn handle_payload(&self, mut raw: Vec<u8>) {
        self.session.metrics().record_message();

        match self.codec.decode(self.session.symbol(), &mut raw) {
            Ok(Some(event)) => {
                trace!(symbol = %self.session.symbol(), event_time = event.event_time(), "event");
                self.sink.on_event(&event);
            }
            Ok(None) => {}
            Err(e) => {
                self.session.metrics().record_malformed();
                let error = FeedError::Protocol(e.to_string());
                debug!(symbol = %self.session.symbol(), error = %error, "malformed_message");
                self.session.record_error(&error);
            }
        }
    }

    /// Append to the connection audit log on the blocking pool. Failures are
    /// logged only.
    async fn log_event(&self, kind: ConnectionEventKind, details: String) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let entry = ConnectionLogEntry::now(self.session.symbol(), kind, details);

        match tokio::task::spawn_blocking(move || store.log_connection_event(&entry)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(symbol = %self.session.symbol(), event = kind.as_str(), error = %e, "connection_log_failed")
            }
            Err(e) => error!(error = %e, "connection_log_task_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DepthHeuristicConfig, StreamKind};
    use crate::feed::session::ConnectionState;
    use crate::models::MarketEvent;
    use crate::storage::SqliteStore;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<MarketEvent>>,
    }

    impl EventSink for CollectingSink {
        fn on_event(&self, event: &MarketEvent) {
            self.events.lock().push(event.clone());
        }
    }

    fn supervisor(
        url: &str,
        sink: Arc<CollectingSink>,
        store: Option<Arc<dyn VolumeStore>>,
    ) -> ConnectionSupervisor {
        let reconnect = ReconnectConfig {
            backoff_base_ms: 20,
            backoff_max_ms: 200,
            connect_timeout_ms: 500,
            ..ReconnectConfig::default()
        };
        ConnectionSupervisor::new(
            SupervisorConfig {
                ws_base_url: url.to_string(),
                reconnect,
            },
            FeedCodec::new(StreamKind::Trade, &DepthHeuristicConfig::default()),
            sink,
            store,
        )
    }

    /// An address nothing is listening on.
    async fn dead_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_refused_connection_retries_with_backoff() {
        let sink = Arc::new(CollectingSink::default());
        let store: Arc<dyn VolumeStore> = Arc::new(SqliteStore::open_memory().unwrap());
        let sup = supervisor(&dead_url().await, sink, Some(store.clone()));

        sup.start(&["btcusdt".to_string()]);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = sup.symbol_status("btcusdt").unwrap();
        assert!(status.total_reconnects >= 2);
        assert!(status.last_error.is_some());
        assert!(status.last_connected.is_none());

        sup.stop().await;
        assert_eq!(
            sup.symbol_status("btcusdt").unwrap().state,
            ConnectionState::Disconnected
        );

        let log = store.connection_log(Some("btcusdt"), 100).unwrap();
        assert!(log.iter().any(|e| e.event == ConnectionEventKind::Error));
        assert!(log
            .iter()
            .any(|e| e.event == ConnectionEventKind::ReconnectAttempt));
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_reconnect() {
        let sink = Arc::new(CollectingSink::default());
        let mut sup = supervisor(&dead_url().await, sink, None);
        sup.config.reconnect.backoff_base_ms = 60_000;
        sup.config.reconnect.backoff_max_ms = 60_000;

        sup.start(&["ethusdt".to_string()]);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Task is parked in a 60s backoff; stop must not wait for it
        tokio::time::timeout(Duration::from_secs(2), sup.stop())
            .await
            .expect("stop should cancel the backoff timer");

        let before = sup.symbol_status("ethusdt").unwrap().total_reconnects;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sup.symbol_status("ethusdt").unwrap().total_reconnects, before);
        assert!(sup.is_stopped());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_per_symbol() {
        let sink = Arc::new(CollectingSink::default());
        let sup = supervisor(&dead_url().await, sink, None);

        sup.start(&["btcusdt".to_string(), "btcusdt".to_string()]);
        sup.start(&["btcusdt".to_string()]);
        assert_eq!(sup.tasks.lock().len(), 1);
        assert_eq!(sup.status().len(), 1);

        sup.stop().await;
    }
}
