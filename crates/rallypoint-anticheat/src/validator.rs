//! The action gate.
//!
//! Rules are deterministic and checked in order: rate limit first, then
//! the bound checks for the action type. The first failing rule rejects.
//! A rejection bumps the player's suspicion score by exactly one and
//! produces one [`SuspicionReport`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rallypoint_protocol::{ConfigError, PlayerId, Vec3, now_millis};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::{AntiCheatConfig, NoopReporter, SuspicionReport, SuspicionReporter};

pub const ACTION_MOVE: &str = "move";
pub const ACTION_SCORE: &str = "score";

/// Why an action was turned down.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("more than {limit} actions within the rate window")]
    RateLimited { limit: usize },

    #[error("move of {distance:.2} units exceeds the limit of {max}")]
    MoveTooFar { distance: f32, max: f32 },

    #[error("score delta {delta} exceeds the limit of {max}")]
    ScoreTooLarge { delta: i64, max: i64 },

    #[error("malformed `{action}` action: {detail}")]
    Malformed { action: String, detail: String },
}

impl RejectReason {
    /// Stable short code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::MoveTooFar { .. } => "move_too_far",
            Self::ScoreTooLarge { .. } => "score_too_large",
            Self::Malformed { .. } => "malformed",
        }
    }
}

/// Outcome of [`AntiCheatValidator::validate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub accepted: bool,
    pub reason: Option<RejectReason>,
}

impl Verdict {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn reject(reason: RejectReason) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Default)]
struct PlayerRecord {
    /// Instants of recently accepted actions, oldest first.
    recent: VecDeque<Instant>,
    suspicion: u32,
}

/// Validates player actions before they reach authoritative state.
pub struct AntiCheatValidator {
    config: AntiCheatConfig,
    players: Mutex<HashMap<PlayerId, PlayerRecord>>,
    reporter: Arc<dyn SuspicionReporter>,
}

impl AntiCheatValidator {
    /// A validator that discards its reports.
    pub fn new(config: AntiCheatConfig) -> Result<Self, ConfigError> {
        Self::with_reporter(config, Arc::new(NoopReporter))
    }

    pub fn with_reporter(
        config: AntiCheatConfig,
        reporter: Arc<dyn SuspicionReporter>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            players: Mutex::new(HashMap::new()),
            reporter,
        })
    }

    pub fn config(&self) -> &AntiCheatConfig {
        &self.config
    }

    /// Checks one action.
    ///
    /// `reference` is where the server believes the player was when the
    /// action happened (already lag compensated by the caller). When given,
    /// a `move` carrying an absolute `position` is measured against it.
    pub fn validate(
        &self,
        player: PlayerId,
        action_type: &str,
        data: &Map<String, Value>,
        reference: Option<Vec3>,
    ) -> Verdict {
        let now = Instant::now();
        let mut players = self.lock();
        let record = players.entry(player).or_default();

        while record
            .recent
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= self.config.rate_window)
        {
            record.recent.pop_front();
        }

        let rejection = if record.recent.len() >= self.config.max_actions_per_window {
            Some(RejectReason::RateLimited {
                limit: self.config.max_actions_per_window,
            })
        } else {
            self.check_bounds(action_type, data, reference).err()
        };

        let Some(reason) = rejection else {
            record.recent.push_back(now);
            return Verdict::accept();
        };

        record.suspicion += 1;
        let score = record.suspicion;
        drop(players);

        tracing::warn!(%player, action = action_type, reason = %reason, score, "action rejected");
        self.reporter.report(SuspicionReport {
            player,
            action: action_type.to_string(),
            reason: reason.clone(),
            score,
            timestamp: now_millis(),
        });
        Verdict::reject(reason)
    }

    fn check_bounds(
        &self,
        action_type: &str,
        data: &Map<String, Value>,
        reference: Option<Vec3>,
    ) -> Result<(), RejectReason> {
        match action_type {
            ACTION_MOVE => {
                let distance = match (field::<Vec3>(action_type, data, "position")?, reference) {
                    (Some(position), Some(reference)) => position.distance(reference),
                    _ => field::<Vec3>(action_type, data, "delta")?
                        .ok_or_else(|| malformed(action_type, "needs `delta`, or `position` with a known reference"))?
                        .length(),
                };
                if !distance.is_finite() {
                    return Err(malformed(action_type, "non-finite coordinates"));
                }
                if distance > self.config.max_move_distance {
                    return Err(RejectReason::MoveTooFar {
                        distance,
                        max: self.config.max_move_distance,
                    });
                }
                Ok(())
            }
            ACTION_SCORE => {
                let delta = field::<i64>(action_type, data, "points")?
                    .ok_or_else(|| malformed(action_type, "needs integer `points`"))?;
                if delta.unsigned_abs() > self.config.max_score_delta.unsigned_abs() {
                    return Err(RejectReason::ScoreTooLarge {
                        delta,
                        max: self.config.max_score_delta,
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn suspicion_score(&self, player: PlayerId) -> u32 {
        self.lock().get(&player).map_or(0, |r| r.suspicion)
    }

    /// Forgets everything about `player`: score and rate window.
    pub fn reset(&self, player: PlayerId) {
        self.lock().remove(&player);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PlayerId, PlayerRecord>> {
        self.players.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for AntiCheatValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AntiCheatValidator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Reads an optional typed field. Present but mistyped is malformed.
fn field<T: serde::de::DeserializeOwned>(
    action: &str,
    data: &Map<String, Value>,
    key: &str,
) -> Result<Option<T>, RejectReason> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| malformed(action, &format!("`{key}`: {e}"))),
    }
}

fn malformed(action: &str, detail: &str) -> RejectReason {
    RejectReason::Malformed {
        action: action.to_string(),
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::ChannelReporter;

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn validator() -> AntiCheatValidator {
        AntiCheatValidator::new(AntiCheatConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_accepts_small_move() {
        let v = validator();
        let verdict = v.validate(PlayerId(1), ACTION_MOVE, &data(json!({"delta": {"x": 3.0, "y": 4.0, "z": 0.0}})), None);
        assert!(verdict.accepted);
        assert_eq!(v.suspicion_score(PlayerId(1)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_rejects_teleport_against_reference() {
        let v = validator();
        let verdict = v.validate(
            PlayerId(1),
            ACTION_MOVE,
            &data(json!({"position": {"x": 50.0, "y": 0.0, "z": 0.0}})),
            Some(Vec3::ZERO),
        );
        assert!(!verdict.accepted);
        assert_eq!(verdict.reason.unwrap().code(), "move_too_far");
        assert_eq!(v.suspicion_score(PlayerId(1)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_rejects_oversized_score() {
        let v = validator();
        let ok = v.validate(PlayerId(2), ACTION_SCORE, &data(json!({"points": 100})), None);
        let bad = v.validate(PlayerId(2), ACTION_SCORE, &data(json!({"points": -101})), None);
        assert!(ok.accepted);
        assert_eq!(bad.reason, Some(RejectReason::ScoreTooLarge { delta: -101, max: 100 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_rejects_malformed_payload() {
        let v = validator();
        let verdict = v.validate(PlayerId(3), ACTION_SCORE, &data(json!({"points": "lots"})), None);
        assert_eq!(verdict.reason.unwrap().code(), "malformed");
        let verdict = v.validate(PlayerId(3), ACTION_MOVE, &data(json!({})), None);
        assert_eq!(verdict.reason.unwrap().code(), "malformed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_slides() {
        let v = AntiCheatValidator::new(AntiCheatConfig {
            max_actions_per_window: 2,
            ..AntiCheatConfig::default()
        })
        .unwrap();
        let empty = Map::new();

        assert!(v.validate(PlayerId(1), "emote", &empty, None).accepted);
        assert!(v.validate(PlayerId(1), "emote", &empty, None).accepted);
        assert!(!v.validate(PlayerId(1), "emote", &empty, None).accepted);
        // Other players have their own window.
        assert!(v.validate(PlayerId(2), "emote", &empty, None).accepted);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(v.validate(PlayerId(1), "emote", &empty, None).accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_reported_once() {
        let (reporter, mut reports) = ChannelReporter::new();
        let v = AntiCheatValidator::with_reporter(AntiCheatConfig::default(), Arc::new(reporter)).unwrap();

        v.validate(PlayerId(4), ACTION_SCORE, &data(json!({"points": 5000})), None);

        let report = reports.recv().await.unwrap();
        assert_eq!(report.player, PlayerId(4));
        assert_eq!(report.action, "score");
        assert_eq!(report.score, 1);
        assert!(reports.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_score() {
        let v = validator();
        v.validate(PlayerId(5), ACTION_SCORE, &data(json!({"points": 5000})), None);
        assert_eq!(v.suspicion_score(PlayerId(5)), 1);
        v.reset(PlayerId(5));
        assert_eq!(v.suspicion_score(PlayerId(5)), 0);
    }
}
