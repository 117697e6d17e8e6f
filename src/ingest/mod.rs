//! Volume ingestion: delta derivation, bucket buffer, flush scheduler

pub mod buffer;
pub mod delta;
pub mod flush;

pub use buffer::{BufferStatus, FlushBatch, IngestBuffer};
pub use delta::VolumeDelta;
pub use flush::{FlushReport, FlushScheduler, FlushStats, FlushStatsSnapshot};

use crate::models::MarketEvent;

/// Destination for decoded feed events.
///
/// Called from the symbol's feed task, in arrival order. Must not block on
/// I/O.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &MarketEvent);
}
