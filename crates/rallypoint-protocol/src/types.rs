//! Core protocol types.
//!
//! These are the values every other crate agrees on: who a player is,
//! which room or match they are in, and what a published state change
//! looks like on the wire.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A unique identifier for a player.
///
/// `#[serde(transparent)]` keeps it a plain number on the wire:
/// `PlayerId(42)` serializes as `42`, not `{"0": 42}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P-{}", self.0)
    }
}

/// A unique identifier for a lobby room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub u64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R-{}", self.0)
    }
}

/// A unique identifier for a match (one live game between players).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(pub u64);

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M-{}", self.0)
    }
}

/// Name of a game mode. Matchmaking keeps one queue per mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameMode(pub String);

impl GameMode {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GameMode {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

// ---------------------------------------------------------------------------
// Channel — delivery guarantees
// ---------------------------------------------------------------------------

/// The delivery guarantee for a message.
///
/// Sequence numbers are tracked per channel, and lag compensation is
/// configured per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum Channel {
    /// Delivered in order, no loss.
    #[default]
    ReliableOrdered,

    /// Delivered, but possibly out of order.
    ReliableUnordered,

    /// May be lost or reordered. Position streams live here.
    Unreliable,
}

impl Channel {
    pub fn is_reliable(self) -> bool {
        !matches!(self, Self::Unreliable)
    }
}

// ---------------------------------------------------------------------------
// Spatial state
// ---------------------------------------------------------------------------

/// A 3-component vector in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance(self, other: Self) -> f32 {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z).length()
    }
}

/// Position plus orientation (yaw, pitch, roll in radians) of a player.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub orientation: Vec3,
}

impl Transform {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            orientation: Vec3::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// SyncMessage — the published envelope
// ---------------------------------------------------------------------------

/// The kinds of state change the sync service publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    PlayerUpdate,
    RoomUpdate,
    MatchStart,
    MatchState,
    GameEvent,
    PlayerState,
}

impl SyncEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlayerUpdate => "player_update",
            Self::RoomUpdate => "room_update",
            Self::MatchStart => "match_start",
            Self::MatchState => "match_state",
            Self::GameEvent => "game_event",
            Self::PlayerState => "player_state",
        }
    }
}

impl fmt::Display for SyncEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{type, data, timestamp}` — every outbound state change.
///
/// ```text
/// { "type": "player_update", "data": { "player_id": 7, ... }, "timestamp": 1700000000000 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub kind: SyncEventType,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl SyncMessage {
    pub fn new(kind: SyncEventType, timestamp: u64) -> Self {
        Self {
            kind,
            data: Map::new(),
            timestamp,
        }
    }

    /// Adds a field to `data`. Values that fail to serialize become `null`.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.data.insert(key.to_string(), value);
        self
    }

    /// Reads a field back out of `data`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Milliseconds since the Unix epoch, for envelope timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
