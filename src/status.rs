//! Read-only pipeline status snapshot

use std::collections::BTreeMap;

use serde::Serialize;

use crate::feed::{ConnectionSupervisor, SymbolStatus};
use crate::ingest::{BufferStatus, FlushStatsSnapshot, IngestBuffer};
use crate::storage::StoreStats;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub is_running: bool,
    pub started_at: Option<i64>,
    pub per_symbol: BTreeMap<String, SymbolStatus>,
    pub buffer: Option<BufferStatus>,
    pub flush: Option<FlushStatsSnapshot>,
    /// `None` when the store could not be read
    pub store: Option<StoreStats>,
}

impl PipelineStatus {
    pub fn connected_symbols(&self) -> usize {
        self.per_symbol
            .values()
            .filter(|s| s.state == crate::feed::ConnectionState::Connected)
            .count()
    }
}

/// Combines component views. Reads only.
pub struct StatusReporter;

impl StatusReporter {
    pub fn collect(
        started_at: Option<i64>,
        supervisor: Option<&ConnectionSupervisor>,
        buffer: Option<&IngestBuffer>,
        flush: Option<FlushStatsSnapshot>,
        store: Option<StoreStats>,
    ) -> PipelineStatus {
        PipelineStatus {
            is_running: supervisor.map(|s| !s.is_stopped()).unwrap_or(false),
            started_at,
            per_symbol: supervisor.map(|s| s.status()).unwrap_or_default(),
            buffer: buffer.map(|b| b.status()),
            flush,
            store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DepthHeuristicConfig;
    use crate::models::Timeframe;

    #[test]
    fn test_idle_status() {
        let status = StatusReporter::collect(None, None, None, None, None);
        assert!(!status.is_running);
        assert!(status.per_symbol.is_empty());
        assert_eq!(status.connected_symbols(), 0);
    }

    #[test]
    fn test_buffer_occupancy_reported() {
        let buffer = IngestBuffer::new(Timeframe::ONE_SECOND, false, DepthHeuristicConfig::default());
        buffer.ingest("btcusdt", 1_000, 1.0, 0.0);
        buffer.ingest("btcusdt", 2_000, 1.0, 0.0);

        let status = StatusReporter::collect(Some(5), None, Some(&buffer), None, None);
        let occupancy = status.buffer.unwrap();
        assert_eq!(occupancy.live_buckets, 2);
        assert_eq!(occupancy.timeframe, "1s");
        assert_eq!(status.started_at, Some(5));

        let json = serde_json::to_value(&StatusReporter::collect(None, None, Some(&buffer), None, None)).unwrap();
        assert_eq!(json["buffer"]["per_symbol"]["btcusdt"]["live_buckets"], 2);
    }
}
