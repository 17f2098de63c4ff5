//! Top-level configuration: one section per component.

use rallypoint_anticheat::AntiCheatConfig;
use rallypoint_matchmaking::MatchmakingConfig;
use rallypoint_optimizer::OptimizerConfig;
use rallypoint_prediction::PredictionConfig;
use rallypoint_protocol::ConfigError;
use rallypoint_sync::SyncConfig;
use serde::{Deserialize, Serialize};

/// Every setting the runtime reads. Missing sections take their defaults.
///
/// ```rust
/// use rallypoint::RallypointConfig;
///
/// let config = RallypointConfig::from_json_str(r#"{ "matchmaking": { "skill_range": 150 } }"#).unwrap();
/// assert_eq!(config.matchmaking.skill_range, 150);
/// assert_eq!(config.optimizer.max_batch_size, 10);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RallypointConfig {
    pub optimizer: OptimizerConfig,
    pub sync: SyncConfig,
    pub matchmaking: MatchmakingConfig,
    pub prediction: PredictionConfig,
    pub anticheat: AntiCheatConfig,
}

impl RallypointConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section, then the rules that span sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.optimizer.validate()?;
        self.sync.validate()?;
        self.matchmaking.validate()?;
        self.prediction.validate()?;
        self.anticheat.validate()?;

        if self.matchmaking.max_players_per_room > self.sync.max_match_players {
            return Err(ConfigError::invalid(
                "matchmaking.max_players_per_room",
                format!(
                    "matchmade groups of {} would not fit a match of at most {}",
                    self.matchmaking.max_players_per_room, self.sync.max_match_players
                ),
            ));
        }
        if self.matchmaking.min_players < self.sync.min_match_players {
            return Err(ConfigError::invalid(
                "matchmaking.min_players",
                "must be at least sync.min_match_players",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RallypointConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_json_str_fills_missing_sections() {
        let config = RallypointConfig::from_json_str(
            r#"{ "sync": { "publish_interval": { "secs": 0, "nanos": 50000000 } } }"#,
        )
        .unwrap();
        assert_eq!(config.sync.publish_interval, Duration::from_millis(50));
        assert_eq!(config.sync.match_countdown, Duration::from_secs(3));
        assert_eq!(config.anticheat.max_actions_per_window, 20);
    }

    #[test]
    fn test_from_json_str_rejects_zero_capacity_pool() {
        let err = RallypointConfig::from_json_str(r#"{ "optimizer": { "pool": { "max_connections": 0 } } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_from_json_str_malformed_is_parse_error() {
        let err = RallypointConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_rejects_groups_larger_than_matches() {
        let mut config = RallypointConfig::default();
        config.matchmaking.max_players_per_room = 8;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_players_per_room"));
    }
}
