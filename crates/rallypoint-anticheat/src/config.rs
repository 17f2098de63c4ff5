use std::time::Duration;

use rallypoint_protocol::ConfigError;
use serde::{Deserialize, Serialize};

/// Limits enforced by the [`AntiCheatValidator`](crate::AntiCheatValidator).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiCheatConfig {
    /// Accepted actions allowed per player within `rate_window`.
    pub max_actions_per_window: usize,
    pub rate_window: Duration,
    /// Longest distance a single `move` may cover, in world units.
    pub max_move_distance: f32,
    /// Largest absolute `points` a single `score` action may claim.
    pub max_score_delta: i64,
}

impl Default for AntiCheatConfig {
    fn default() -> Self {
        Self {
            max_actions_per_window: 20,
            rate_window: Duration::from_secs(1),
            max_move_distance: 10.0,
            max_score_delta: 100,
        }
    }
}

impl AntiCheatConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_actions_per_window == 0 {
            return Err(ConfigError::invalid(
                "anticheat.max_actions_per_window",
                "must be at least 1",
            ));
        }
        if self.rate_window.is_zero() {
            return Err(ConfigError::invalid("anticheat.rate_window", "must be non-zero"));
        }
        if !(self.max_move_distance.is_finite() && self.max_move_distance > 0.0) {
            return Err(ConfigError::invalid(
                "anticheat.max_move_distance",
                "must be a positive number",
            ));
        }
        Ok(())
    }
}
