//! Error types for the sync layer.

use rallypoint_anticheat::RejectReason;
use rallypoint_matchmaking::MatchmakingError;
use rallypoint_optimizer::OptimizerError;
use rallypoint_prediction::PredictionError;
use rallypoint_protocol::{ConfigError, MatchId, PlayerId, ProtocolError, RoomId};

use crate::{MatchStatus, PlayerStatus};

/// Errors that can occur during sync service operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("player {0} not found")]
    PlayerNotFound(PlayerId),

    /// The player is already connected.
    #[error("player {0} is already online")]
    AlreadyConnected(PlayerId),

    /// The player's current status does not allow this operation.
    #[error("player {player} cannot go from {from} to {to}")]
    InvalidPlayerTransition {
        player: PlayerId,
        from: PlayerStatus,
        to: PlayerStatus,
    },

    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    /// The room is full — no more member slots available.
    #[error("room {0} is full")]
    RoomFull(RoomId),

    /// The room is no longer accepting members.
    #[error("room {0} is not accepting members")]
    RoomClosed(RoomId),

    #[error("player {0} is not in a room")]
    NotInRoom(PlayerId),

    /// Only the room host may do this.
    #[error("player {0} is not the host of room {1}")]
    NotHost(PlayerId, RoomId),

    #[error("match {0} not found")]
    MatchNotFound(MatchId),

    #[error("player {0} is not in match {1}")]
    NotInMatch(PlayerId, MatchId),

    /// The player is not taking part in any live match.
    #[error("player {0} is not in a live match")]
    NoActiveMatch(PlayerId),

    /// The match is in a state that does not allow this operation.
    #[error("match {id} is {status}: {reason}")]
    InvalidMatchState {
        id: MatchId,
        status: MatchStatus,
        reason: &'static str,
    },

    /// A request that can never succeed as asked.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Anti-cheat turned the action down. Nothing was changed.
    #[error("action rejected: {reason}")]
    ActionRejected { reason: RejectReason },

    /// The match's command channel is closed.
    #[error("match {0} is unavailable")]
    Unavailable(MatchId),

    /// The service has been started already, or was shut down.
    #[error("sync service is {0}")]
    Lifecycle(&'static str),

    #[error(transparent)]
    Matchmaking(#[from] MatchmakingError),

    #[error(transparent)]
    Prediction(#[from] PredictionError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Short reason code for the player-facing no-op reply.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ActionRejected { reason } => reason.code(),
            Self::PlayerNotFound(_) => "player_not_found",
            Self::RoomNotFound(_) | Self::MatchNotFound(_) => "not_found",
            Self::RoomFull(_) => "room_full",
            Self::NotHost(..) => "not_host",
            Self::Matchmaking(MatchmakingError::Timeout { .. }) => "matchmaking_timeout",
            _ => "invalid",
        }
    }
}
