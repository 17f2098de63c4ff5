//! Error types for matchmaking.

use std::time::Duration;

use rallypoint_protocol::{ConfigError, PlayerId};

/// Errors that can occur during matchmaking operations.
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    /// The player already sits in a queue.
    #[error("player {0} is already queued")]
    AlreadyQueued(PlayerId),

    /// The player is not in any queue.
    #[error("player {0} is not queued")]
    NotQueued(PlayerId),

    /// The player waited longer than `matchmaking_timeout` and was dropped.
    #[error("player {player} timed out after {waited:?} in the queue")]
    Timeout { player: PlayerId, waited: Duration },

    /// The matchmaker task is gone.
    #[error("matchmaker is unavailable")]
    Unavailable,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
