//! Real-time synchronization for Rallypoint.
//!
//! [`RealtimeSyncService`] owns every player, room and match, validates
//! gameplay actions before they touch match state, and publishes each
//! change as a [`SyncMessage`](rallypoint_protocol::SyncMessage) through
//! the transport optimizer.
//!
//! # Key types
//!
//! - [`RealtimeSyncService`] — the front door
//! - [`MatchHandle`] — talks to one match actor
//! - [`PlayerStatus`], [`RoomStatus`], [`MatchStatus`] — lifecycle state machines
//! - [`SyncConfig`] — publish interval, countdown, player limits

mod config;
mod error;
mod game_match;
mod lobby;
mod player;
mod service;
mod state;

pub use config::SyncConfig;
pub use error::SyncError;
pub use game_match::{MatchEvent, MatchHandle, MatchInfo, MatchTransition, REASON_ABANDONED, REASON_START_TIMEOUT};
pub use lobby::{LeaveOutcome, Room};
pub use player::Player;
pub use service::{Collaborators, InboundUpdate, REASON_MATCHMAKING_TIMEOUT, RealtimeSyncService};
pub use state::{MatchStatus, PlayerStatus, RoomStatus};
