use std::time::Duration;

use rallypoint_protocol::{Channel, ConfigError};
use serde::{Deserialize, Serialize};

/// Settings for the prediction buffer and lag compensator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Ring capacity. The oldest step is evicted past this.
    pub max_steps: usize,
    /// Steps older than this are pruned, confirmed or not.
    pub prediction_window: Duration,
    pub compensation: CompensationConfig,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            max_steps: 64,
            prediction_window: Duration::from_secs(1),
            compensation: CompensationConfig::default(),
        }
    }
}

impl PredictionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_steps == 0 {
            return Err(ConfigError::invalid("prediction.max_steps", "must be at least 1"));
        }
        if self.prediction_window.is_zero() {
            return Err(ConfigError::invalid(
                "prediction.prediction_window",
                "must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Fixed rewind offsets applied when validating a peer's past action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensationConfig {
    /// For both reliable channels.
    pub reliable: Duration,
    pub unreliable: Duration,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            reliable: Duration::from_millis(100),
            unreliable: Duration::from_millis(50),
        }
    }
}

impl CompensationConfig {
    pub fn for_channel(&self, channel: Channel) -> Duration {
        if channel.is_reliable() {
            self.reliable
        } else {
            self.unreliable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_documented_values() {
        let config = PredictionConfig::default();
        assert_eq!(config.max_steps, 64);
        assert_eq!(config.prediction_window, Duration::from_secs(1));
        assert_eq!(
            config.compensation.for_channel(Channel::ReliableOrdered),
            Duration::from_millis(100)
        );
        assert_eq!(
            config.compensation.for_channel(Channel::Unreliable),
            Duration::from_millis(50)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = PredictionConfig {
            max_steps: 0,
            ..PredictionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: PredictionConfig = serde_json::from_str(r#"{"max_steps": 8}"#).unwrap();
        assert_eq!(config.max_steps, 8);
        assert_eq!(config.prediction_window, Duration::from_secs(1));
    }
}
