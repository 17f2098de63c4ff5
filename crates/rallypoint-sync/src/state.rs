//! Lifecycle state machines for players, rooms and matches.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// PlayerStatus
// ---------------------------------------------------------------------------

/// Where a player currently is.
///
/// ```text
/// Offline ↔ Online ↔ InLobby ↔ InMatch
///             ↕         ↕
///          Spectating ──┘
/// ```
///
/// Any status may drop straight to `Offline` on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    Offline,
    Online,
    InLobby,
    InMatch,
    Spectating,
}

impl PlayerStatus {
    /// Returns `true` if moving to `target` is a legal transition.
    pub fn can_transition_to(self, target: Self) -> bool {
        use PlayerStatus::*;
        match (self, target) {
            (_, Offline) => self != Offline,
            (Offline, Online) => true,
            (Online, InLobby | InMatch | Spectating) => true,
            (InLobby, Online | InMatch | Spectating) => true,
            (InMatch, Online | InLobby) => true,
            (Spectating, Online | InLobby) => true,
            _ => false,
        }
    }

    /// Connected and not busy with a room, match or spectating.
    pub fn is_idle(self) -> bool {
        self == Self::Online
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::InLobby => "in_lobby",
            Self::InMatch => "in_match",
            Self::Spectating => "spectating",
        }
    }
}

impl fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RoomStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a lobby room.
///
/// ```text
/// Waiting → Starting → InProgress → Finished
///              └──────────┴──→ Waiting   (match cancelled)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    Starting,
    InProgress,
    Finished,
}

impl RoomStatus {
    /// Returns `true` if the room is accepting new members.
    pub fn is_joinable(self) -> bool {
        self == Self::Waiting
    }

    pub fn can_transition_to(self, target: Self) -> bool {
        use RoomStatus::*;
        matches!(
            (self, target),
            (Waiting, Starting)
                | (Starting, InProgress)
                | (InProgress, Finished)
                | (Starting | InProgress, Waiting)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Starting => "starting",
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// MatchStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a match.
///
/// ```text
/// Waiting → Starting → InProgress → Finished
///    └─────────┴──→ Cancelled
/// ```
///
/// - **Waiting**: created, collecting acknowledgements from every player.
/// - **Starting**: everyone acknowledged, countdown running.
/// - **InProgress**: live. Actions are applied.
/// - **Finished** / **Cancelled**: terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Waiting,
    Starting,
    InProgress,
    Finished,
    Cancelled,
}

impl MatchStatus {
    pub fn can_transition_to(self, target: Self) -> bool {
        use MatchStatus::*;
        matches!(
            (self, target),
            (Waiting, Starting)
                | (Starting, InProgress)
                | (InProgress, Finished)
                | (Waiting | Starting, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }

    /// Not yet live and not over.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Waiting | Self::Starting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Starting => "starting",
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
