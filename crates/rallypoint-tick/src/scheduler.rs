//! Fixed-interval tick scheduler.
//!
//! A [`TickScheduler`] fires every `interval` and reports late wake-ups.
//! A late tick is never replayed: the next one is scheduled a full
//! interval after the wake-up. `interval == 0` means "never fire", which
//! lets a loop keep its `select!` shape even when a feature is switched off.

use std::time::Duration;

use rand::Rng;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

/// Configuration for one scheduler.
#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Time between ticks. `Duration::ZERO` disables the scheduler.
    pub interval: Duration,
    /// Fraction of `interval` the loop body may use before a warning (0.0–1.0).
    pub budget_warn_threshold: f64,
    /// Upper bound of random delay added to the first tick, so loops
    /// started together do not fire in lockstep.
    pub initial_jitter: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            budget_warn_threshold: 0.80,
            initial_jitter: Duration::ZERO,
        }
    }
}

impl TickConfig {
    /// Shortest interval accepted. Anything below is raised to this.
    pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

    /// Ticks every `interval`, no jitter.
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.initial_jitter = jitter;
        self
    }

    /// Clamps out-of-range values. Called by [`TickScheduler::new`].
    pub fn validated(mut self) -> Self {
        if !self.interval.is_zero() && self.interval < Self::MIN_INTERVAL {
            warn!(
                interval_us = self.interval.as_micros() as u64,
                "tick interval below minimum, raising to 1ms"
            );
            self.interval = Self::MIN_INTERVAL;
        }
        self.budget_warn_threshold = self.budget_warn_threshold.clamp(0.0, 1.0);
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.interval.is_zero()
    }
}

/// What [`TickScheduler::wait_for_tick`] hands back.
#[derive(Debug, Clone)]
pub struct TickInfo {
    /// Monotonic tick number, starting at 1.
    pub tick: u64,
    /// The configured interval.
    pub interval: Duration,
    /// The wake-up was more than 10% of `interval` late.
    pub overrun: bool,
    /// Whole intervals missed by a late wake-up.
    pub ticks_skipped: u64,
}

/// Drives one periodic loop.
#[derive(Debug)]
pub struct TickScheduler {
    config: TickConfig,
    tick_count: u64,
    next_deadline: Option<Instant>,
    body_started: Option<Instant>,
}

impl TickScheduler {
    pub fn new(config: TickConfig) -> Self {
        let config = config.validated();

        let next_deadline = if config.is_disabled() {
            debug!("tick scheduler created disabled");
            None
        } else {
            let jitter = random_jitter(config.initial_jitter);
            debug!(
                interval_ms = config.interval.as_secs_f64() * 1000.0,
                jitter_ms = jitter.as_secs_f64() * 1000.0,
                "tick scheduler created"
            );
            Some(Instant::now() + config.interval + jitter)
        };

        Self {
            config,
            tick_count: 0,
            next_deadline,
            body_started: None,
        }
    }

    /// Shorthand for `TickScheduler::new(TickConfig::every(interval))`.
    pub fn every(interval: Duration) -> Self {
        Self::new(TickConfig::every(interval))
    }

    /// Sleeps until the next tick is due.
    ///
    /// Pends forever while disabled, so `select!` keeps serving its other
    /// branches.
    pub async fn wait_for_tick(&mut self) -> TickInfo {
        let Some(deadline) = self.next_deadline else {
            return std::future::pending().await;
        };

        time::sleep_until(deadline).await;

        let now = Instant::now();
        let interval = self.config.interval;
        let late_by = now.saturating_duration_since(deadline);
        let overrun = late_by > interval / 10;
        let ticks_skipped = if overrun {
            (late_by.as_nanos() / interval.as_nanos()) as u64
        } else {
            0
        };

        self.next_deadline = Some(now + interval);
        self.tick_count += 1;
        self.body_started = Some(now);

        if overrun {
            warn!(
                tick = self.tick_count,
                late_ms = late_by.as_secs_f64() * 1000.0,
                skipped = ticks_skipped,
                "tick fired late"
            );
        }
        trace!(tick = self.tick_count, "tick");

        TickInfo {
            tick: self.tick_count,
            interval,
            overrun,
            ticks_skipped,
        }
    }

    /// Marks the end of the loop body started by the last tick, warning
    /// when the body used more than `budget_warn_threshold` of the
    /// interval. Returns how long the body took.
    pub fn record_tick_end(&mut self) -> Option<Duration> {
        let start = self.body_started.take()?;
        let elapsed = Instant::now().saturating_duration_since(start);

        if !self.config.interval.is_zero() {
            let used = elapsed.as_secs_f64() / self.config.interval.as_secs_f64();
            if used >= self.config.budget_warn_threshold {
                warn!(
                    tick = self.tick_count,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    used_pct = format!("{:.1}", used * 100.0),
                    "loop body close to its interval"
                );
            }
        }
        Some(elapsed)
    }

    pub fn is_disabled(&self) -> bool {
        self.config.is_disabled()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_us = max.as_micros() as u64;
    if max_us == 0 {
        Duration::ZERO
    } else {
        Duration::from_micros(rand::rng().random_range(0..max_us))
    }
}
