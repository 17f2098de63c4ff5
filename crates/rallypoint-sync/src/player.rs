//! Player records.

use std::time::Duration;

use rallypoint_prediction::{PredictionBuffer, PredictionConfig, StateHistory};
use rallypoint_protocol::{MatchId, PlayerId, RoomId, SequenceTracker, Transform};
use tokio::time::Instant;

use crate::{PlayerStatus, SyncError};

/// A snapshot of one player.
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub id: PlayerId,
    pub display_name: String,
    pub skill_rating: u32,
    pub status: PlayerStatus,
    pub transform: Transform,
    pub last_seen: Instant,
    /// Last measured round trip, if any.
    pub ping: Option<Duration>,
    pub is_host: bool,
    pub room: Option<RoomId>,
    /// Set from match creation until the match ends.
    pub current_match: Option<MatchId>,
    pub spectating: Option<MatchId>,
}

/// A player plus the per-player sync machinery. One lock guards it all.
#[derive(Debug)]
pub(crate) struct PlayerEntry {
    pub(crate) player: Player,
    /// Last-write-wins gate for inbound updates.
    pub(crate) inbound: SequenceTracker,
    pub(crate) prediction: PredictionBuffer<Transform>,
    pub(crate) history: StateHistory<Transform>,
}

impl PlayerEntry {
    pub(crate) fn new(
        id: PlayerId,
        display_name: String,
        skill_rating: u32,
        prediction: &PredictionConfig,
        history_capacity: usize,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            player: Player {
                id,
                display_name,
                skill_rating,
                status: PlayerStatus::Online,
                transform: Transform::default(),
                last_seen: Instant::now(),
                ping: None,
                is_host: false,
                room: None,
                current_match: None,
                spectating: None,
            },
            inbound: SequenceTracker::new(),
            prediction: PredictionBuffer::new(prediction)?,
            history: StateHistory::new(history_capacity),
        })
    }

    /// Moves to `to`, or explains why that is not allowed.
    pub(crate) fn transition(&mut self, to: PlayerStatus) -> Result<(), SyncError> {
        let from = self.player.status;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(SyncError::InvalidPlayerTransition {
                player: self.player.id,
                from,
                to,
            });
        }
        self.player.status = to;
        tracing::debug!(player_id = %self.player.id, %from, %to, "player status changed");
        Ok(())
    }

    /// The status to fall back to when leaving a match or spectating.
    pub(crate) fn resting_status(&self) -> PlayerStatus {
        if self.player.room.is_some() {
            PlayerStatus::InLobby
        } else {
            PlayerStatus::Online
        }
    }

    /// Records a new authoritative transform.
    pub(crate) fn set_transform(&mut self, transform: Transform) {
        self.player.transform = transform;
        self.history.record(transform);
    }

    pub(crate) fn touch(&mut self) {
        self.player.last_seen = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use rallypoint_protocol::Vec3;

    use super::*;

    fn entry() -> PlayerEntry {
        PlayerEntry::new(PlayerId(1), "ada".into(), 1200, &PredictionConfig::default(), 8).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_rejects_illegal_move() {
        let mut e = entry();
        assert!(e.transition(PlayerStatus::InLobby).is_ok());
        assert!(matches!(
            e.transition(PlayerStatus::Offline).and_then(|_| e.transition(PlayerStatus::InMatch)),
            Err(SyncError::InvalidPlayerTransition { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resting_status_depends_on_room() {
        let mut e = entry();
        assert_eq!(e.resting_status(), PlayerStatus::Online);
        e.player.room = Some(RoomId(3));
        assert_eq!(e.resting_status(), PlayerStatus::InLobby);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_transform_feeds_history() {
        let mut e = entry();
        e.set_transform(Transform::at(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(e.history.latest().map(|t| t.position.x), Some(1.0));
    }
}
