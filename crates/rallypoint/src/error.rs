//! Unified error type for Rallypoint.

use rallypoint_matchmaking::MatchmakingError;
use rallypoint_optimizer::OptimizerError;
use rallypoint_prediction::PredictionError;
use rallypoint_protocol::{ConfigError, ProtocolError};
use rallypoint_sync::SyncError;
use rallypoint_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant generates the `From` impl, so
/// `?` converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum RallypointError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A config value the runtime cannot start with.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error(transparent)]
    Matchmaking(#[from] MatchmakingError),

    #[error(transparent)]
    Prediction(#[from] PredictionError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl RallypointError {
    /// Whether the same call may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_transient(),
            Self::Optimizer(OptimizerError::TransientNetwork { .. })
            | Self::Optimizer(OptimizerError::PoolExhausted { .. })
            | Self::Optimizer(OptimizerError::Timeout(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rallypoint_protocol::{PlayerId, RoomId};

    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err: RallypointError = TransportError::ConnectionClosed("gone".into()).into();
        assert!(matches!(err, RallypointError::Transport(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_config_error() {
        let err: RallypointError = ConfigError::invalid("optimizer.max_batch_size", "must be at least 1").into();
        assert!(matches!(err, RallypointError::Config(_)));
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn test_from_sync_error() {
        let err: RallypointError = SyncError::RoomNotFound(RoomId(4)).into();
        assert!(matches!(err, RallypointError::Sync(_)));
    }

    #[test]
    fn test_from_matchmaking_error() {
        let err: RallypointError = MatchmakingError::NotQueued(PlayerId(1)).into();
        assert!(matches!(err, RallypointError::Matchmaking(_)));
    }

    #[test]
    fn test_is_retryable_follows_taxonomy() {
        let exhausted: RallypointError = OptimizerError::PoolExhausted {
            waited: Duration::from_secs(5),
        }
        .into();
        assert!(exhausted.is_retryable());

        let shut: RallypointError = OptimizerError::Shutdown.into();
        assert!(!shut.is_retryable());

        let timeout: RallypointError = TransportError::Timeout(Duration::from_secs(1)).into();
        assert!(timeout.is_retryable());
    }
}
