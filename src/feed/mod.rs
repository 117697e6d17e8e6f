//! Live market data feed: per-symbol WebSocket sessions

pub mod codec;
pub mod session;
pub mod supervisor;

pub use codec::{FeedCodec, ParseError};
pub use session::{
    BackoffCalculator, ConnectionState, LivenessMonitor, ReconnectDecision, SessionEnd,
    SymbolSession, SymbolStatus,
};
pub use supervisor::{ConnectionSupervisor, SupervisorConfig};
