//! Matchmaking for Rallypoint.
//!
//! [`MatchmakingEngine`] holds one FIFO queue per game mode and groups
//! players whose ratings fit within `skill_range`. [`Matchmaker`] runs an
//! engine as an actor task and scans it on a fixed interval.

mod config;
mod engine;
mod error;
mod matchmaker;

pub use config::MatchmakingConfig;
pub use engine::{FormedMatch, MatchmakingEngine, QueueEntry, ScanOutcome};
pub use error::MatchmakingError;
pub use matchmaker::Matchmaker;
