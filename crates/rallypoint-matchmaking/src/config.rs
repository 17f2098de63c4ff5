use std::time::Duration;

use rallypoint_protocol::ConfigError;
use serde::{Deserialize, Serialize};

/// Matchmaking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// How often the queues are scanned.
    pub scan_interval: Duration,
    /// Random delay, at most this long, before the first scan.
    pub scan_jitter: Duration,
    /// Largest allowed rating spread (max - min) within one match.
    pub skill_range: u32,
    /// Fewest players a match is formed with.
    pub min_players: usize,
    pub max_players_per_room: usize,
    /// Entries older than this are dropped and their owner notified.
    pub matchmaking_timeout: Duration,
    /// Command channel size for the matchmaker actor.
    pub channel_size: usize,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(1),
            scan_jitter: Duration::ZERO,
            skill_range: 100,
            min_players: 2,
            max_players_per_room: 4,
            matchmaking_timeout: Duration::from_secs(60),
            channel_size: 256,
        }
    }
}

impl MatchmakingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_players < 2 {
            return Err(ConfigError::invalid(
                "matchmaking.min_players",
                "a match needs at least 2 players",
            ));
        }
        if self.max_players_per_room < self.min_players {
            return Err(ConfigError::invalid(
                "matchmaking.max_players_per_room",
                format!("must be at least min_players ({})", self.min_players),
            ));
        }
        if self.scan_jitter > self.scan_interval {
            return Err(ConfigError::invalid(
                "matchmaking.scan_jitter",
                "must not exceed scan_interval",
            ));
        }
        if self.channel_size == 0 {
            return Err(ConfigError::invalid("matchmaking.channel_size", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = MatchmakingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.skill_range, 100);
        assert_eq!(config.max_players_per_room, 4);
    }

    #[test]
    fn test_validate_rejects_room_smaller_than_match() {
        let config = MatchmakingConfig {
            max_players_per_room: 1,
            ..MatchmakingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_jitter_longer_than_interval() {
        let config = MatchmakingConfig {
            scan_jitter: Duration::from_secs(2),
            ..MatchmakingConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
