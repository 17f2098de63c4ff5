//! # Rallypoint
//!
//! Transport optimization and real-time multiplayer synchronization for
//! game backends.
//!
//! Gameplay code talks to a [`RealtimeSyncService`](rallypoint_sync::RealtimeSyncService):
//! actions are validated by anti-cheat, recorded for prediction, applied to
//! the match and published. Outbound events go through a
//! [`TransportOptimizer`](rallypoint_optimizer::TransportOptimizer) that
//! batches, compresses, pools connections, caches and retries.
//!
//! ```text
//! action → AntiCheatValidator → PredictionBuffer → match actor
//!        → SyncMessage → TransportOptimizer → Transport
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rallypoint::prelude::*;
//!
//! # async fn run() -> Result<(), RallypointError> {
//! rallypoint::init_tracing();
//! let runtime = RallypointBuilder::new().build(LoopbackTransport::echo())?;
//! runtime.start()?;
//! // connect players, create rooms, queue for matches...
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod runtime;
mod telemetry;

pub use config::RallypointConfig;
pub use error::RallypointError;
pub use runtime::{Rallypoint, RallypointBuilder};
pub use telemetry::{DEFAULT_FILTER, init_tracing};

pub use rallypoint_anticheat as anticheat;
pub use rallypoint_matchmaking as matchmaking;
pub use rallypoint_optimizer as optimizer;
pub use rallypoint_prediction as prediction;
pub use rallypoint_protocol as protocol;
pub use rallypoint_sync as sync;
pub use rallypoint_tick as tick;
pub use rallypoint_transport as transport;

/// The types most applications need.
pub mod prelude {
    pub use crate::{Rallypoint, RallypointBuilder, RallypointConfig, RallypointError, init_tracing};
    pub use rallypoint_anticheat::{ChannelReporter, SuspicionReport, SuspicionReporter};
    pub use rallypoint_optimizer::{NetworkMessage, Priority};
    pub use rallypoint_protocol::{
        Channel, GameMode, MatchId, PlayerId, RoomId, SyncEventType, SyncMessage, Transform, Vec3,
    };
    pub use rallypoint_sync::{
        InboundUpdate, MatchStatus, PlayerStatus, RealtimeSyncService, RoomStatus, SyncError,
    };
    pub use rallypoint_transport::{LoopbackTransport, Method, Transport};
}
