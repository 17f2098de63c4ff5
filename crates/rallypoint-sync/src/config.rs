//! Sync service configuration.

use std::time::Duration;

use rallypoint_protocol::ConfigError;
use serde::{Deserialize, Serialize};

/// Settings for the [`RealtimeSyncService`](crate::RealtimeSyncService).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often positions of in-match players are published.
    pub publish_interval: Duration,
    /// Random delay, at most this long, before the first publish tick.
    pub publish_jitter: Duration,
    /// Delay between everyone acknowledging and the match going live.
    pub match_countdown: Duration,
    /// A match not live within this long after creation is cancelled.
    pub match_start_timeout: Duration,
    pub min_match_players: usize,
    pub max_match_players: usize,
    /// Capacity of rooms created without an explicit one.
    pub default_room_capacity: usize,
    /// Transport target every outbound event is sent to.
    pub publish_target: String,
    /// Snapshots kept per player for lag-compensated validation.
    pub history_capacity: usize,
    /// Queue size for inbound updates waiting to be applied.
    pub inbound_channel_size: usize,
    /// Command channel size per match actor.
    pub match_channel_size: usize,
    /// Broadcast buffer for event subscribers.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_millis(100),
            publish_jitter: Duration::ZERO,
            match_countdown: Duration::from_secs(3),
            match_start_timeout: Duration::from_secs(30),
            min_match_players: 2,
            max_match_players: 4,
            default_room_capacity: 4,
            publish_target: "sync".to_string(),
            history_capacity: 64,
            inbound_channel_size: 1024,
            match_channel_size: 64,
            event_capacity: 1024,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_match_players < 2 {
            return Err(ConfigError::invalid(
                "sync.min_match_players",
                "a match needs at least 2 players",
            ));
        }
        if self.max_match_players < self.min_match_players {
            return Err(ConfigError::invalid(
                "sync.max_match_players",
                "must be at least min_match_players",
            ));
        }
        if self.default_room_capacity < self.min_match_players {
            return Err(ConfigError::invalid(
                "sync.default_room_capacity",
                "a room must be able to hold a match",
            ));
        }
        if self.publish_interval.is_zero() {
            return Err(ConfigError::invalid("sync.publish_interval", "must be non-zero"));
        }
        if self.publish_jitter > self.publish_interval {
            return Err(ConfigError::invalid(
                "sync.publish_jitter",
                "must not exceed publish_interval",
            ));
        }
        if self.inbound_channel_size == 0 || self.match_channel_size == 0 || self.event_capacity == 0 {
            return Err(ConfigError::invalid("sync.channel sizes", "must be at least 1"));
        }
        Ok(())
    }
}
