//! Retry policy: how many times, and how long to wait in between.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * 2^(retry - 1)`, never more than `max`.
    Exponential { base: Duration, max: Duration },
}

/// Retry settings for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retry_attempts: u32,
    pub backoff: Backoff,
    /// Random spread applied to each delay, as a fraction (0.0–1.0).
    /// `0.25` turns a 1s delay into anything between 0.75s and 1.25s.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            backoff: Backoff::Fixed {
                delay: Duration::from_secs(1),
            },
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retry_attempts: 0,
            ..Self::default()
        }
    }

    pub fn fixed(max_retry_attempts: u32, delay: Duration) -> Self {
        Self {
            max_retry_attempts,
            backoff: Backoff::Fixed { delay },
            jitter: 0.0,
        }
    }

    pub fn exponential(max_retry_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retry_attempts,
            backoff: Backoff::Exponential { base, max },
            jitter: 0.0,
        }
    }

    /// Total attempts for a request: one, plus retries when allowed.
    pub fn total_attempts(&self, retries_allowed: bool) -> u32 {
        if retries_allowed {
            1 + self.max_retry_attempts
        } else {
            1
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = match &self.backoff {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential { base, max } => {
                let shift = retry.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << shift).min(*max)
            }
        };
        apply_jitter(base, self.jitter)
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
    delay.mul_f64(factor)
}
