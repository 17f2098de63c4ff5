//! Lobby rooms: an ordered member list with a host.

use rallypoint_protocol::{GameMode, MatchId, PlayerId, RoomId};

use crate::{RoomStatus, SyncError};

/// A snapshot of one room.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub id: RoomId,
    pub capacity: usize,
    pub game_mode: GameMode,
    /// In join order. The host is always a member.
    pub members: Vec<PlayerId>,
    pub status: RoomStatus,
    /// Looked up in `members`; the room does not own the player.
    pub host: PlayerId,
    pub current_match: Option<MatchId>,
}

/// What happened to a room when a member left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// A non-host member left.
    Left,
    /// The host left; the next member by join order took over.
    HostChanged { new_host: PlayerId },
    /// The last member left. The room should be discarded.
    Emptied,
}

impl Room {
    pub(crate) fn new(id: RoomId, host: PlayerId, capacity: usize, game_mode: GameMode) -> Self {
        Self {
            id,
            capacity,
            game_mode,
            members: vec![host],
            status: RoomStatus::Waiting,
            host,
            current_match: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity
    }

    pub fn contains(&self, player: PlayerId) -> bool {
        self.members.contains(&player)
    }

    pub(crate) fn add_member(&mut self, player: PlayerId) -> Result<(), SyncError> {
        if !self.status.is_joinable() {
            return Err(SyncError::RoomClosed(self.id));
        }
        if self.contains(player) {
            return Ok(());
        }
        if self.is_full() {
            return Err(SyncError::RoomFull(self.id));
        }
        self.members.push(player);
        Ok(())
    }

    pub(crate) fn remove_member(&mut self, player: PlayerId) -> Result<LeaveOutcome, SyncError> {
        let index = self
            .members
            .iter()
            .position(|m| *m == player)
            .ok_or(SyncError::NotInRoom(player))?;
        self.members.remove(index);

        if self.members.is_empty() {
            return Ok(LeaveOutcome::Emptied);
        }
        if self.host != player {
            return Ok(LeaveOutcome::Left);
        }
        // Members keep join order, so the earliest remaining joiner is first.
        self.host = self.members[0];
        Ok(LeaveOutcome::HostChanged {
            new_host: self.host,
        })
    }

    pub(crate) fn set_status(&mut self, status: RoomStatus) {
        if self.status.can_transition_to(status) {
            tracing::debug!(room_id = %self.id, from = %self.status, to = %status, "room status changed");
            self.status = status;
        }
    }
}
