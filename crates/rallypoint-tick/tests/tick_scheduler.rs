//! Integration tests for the tick scheduler.
//!
//! Tests run on a paused Tokio clock: sleeping auto-advances time, so
//! tick timing is exact and the tests finish instantly.

use std::time::Duration;

use rallypoint_tick::{Shutdown, TickConfig, TickScheduler};
use tokio::time::Instant;

fn every_50ms() -> TickConfig {
    TickConfig::every(Duration::from_millis(50))
}

// =========================================================================
// TickConfig
// =========================================================================

#[test]
fn test_default_config_is_disabled() {
    let cfg = TickConfig::default();
    assert!(cfg.is_disabled());
}

#[test]
fn test_validated_raises_tiny_interval() {
    let cfg = TickConfig::every(Duration::from_micros(10)).validated();
    assert_eq!(cfg.interval, TickConfig::MIN_INTERVAL);
}

#[test]
fn test_validated_clamps_budget_threshold() {
    let cfg = TickConfig {
        budget_warn_threshold: 3.0,
        ..every_50ms()
    }
    .validated();
    assert_eq!(cfg.budget_warn_threshold, 1.0);
}

// =========================================================================
// Ticking
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_wait_for_tick_fires_after_one_interval() {
    let start = Instant::now();
    let mut s = TickScheduler::new(every_50ms());

    let info = s.wait_for_tick().await;
    assert_eq!(info.tick, 1);
    assert_eq!(info.interval, Duration::from_millis(50));
    assert!(!info.overrun);
    assert_eq!(start.elapsed(), Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn test_ticks_increment_monotonically() {
    let mut s = TickScheduler::every(Duration::from_millis(100));
    for expected in 1..=5 {
        assert_eq!(s.wait_for_tick().await.tick, expected);
    }
    assert_eq!(s.tick_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_scheduler_never_fires() {
    let mut s = TickScheduler::new(TickConfig::default());
    assert!(s.is_disabled());
    let result = tokio::time::timeout(Duration::from_secs(5), s.wait_for_tick()).await;
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_jitter_delays_first_tick_within_bound() {
    let start = Instant::now();
    let mut s = TickScheduler::new(every_50ms().with_jitter(Duration::from_millis(20)));
    s.wait_for_tick().await;
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(70));
}

// =========================================================================
// Late wake-ups
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_late_tick_reports_skipped_ticks() {
    let mut s = TickScheduler::new(every_50ms());
    s.wait_for_tick().await;

    // Body takes 3.5 intervals.
    tokio::time::advance(Duration::from_millis(175)).await;
    let info = s.wait_for_tick().await;
    assert!(info.overrun);
    assert_eq!(info.ticks_skipped, 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_tick_does_not_replay_missed_ones() {
    let mut s = TickScheduler::new(every_50ms());
    s.wait_for_tick().await;
    tokio::time::advance(Duration::from_millis(120)).await;
    s.wait_for_tick().await;

    let before = Instant::now();
    let info = s.wait_for_tick().await;
    assert!(!info.overrun);
    assert_eq!(before.elapsed(), Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn test_record_tick_end_reports_body_time_once() {
    let mut s = TickScheduler::new(every_50ms());
    s.wait_for_tick().await;
    tokio::time::advance(Duration::from_millis(10)).await;
    assert_eq!(s.record_tick_end(), Some(Duration::from_millis(10)));

    // Without a tick in between, a second call is ignored.
    assert_eq!(s.record_tick_end(), None);
}

// =========================================================================
// Loop shape with shutdown
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_loop_stops_on_shutdown() {
    let shutdown = Shutdown::new();
    let mut signal = shutdown.signal();

    let handle = tokio::spawn(async move {
        let mut s = TickScheduler::new(every_50ms());
        let mut ticks = 0;
        loop {
            tokio::select! {
                _ = signal.wait() => break,
                _ = s.wait_for_tick() => ticks += 1,
            }
        }
        ticks
    });

    tokio::time::sleep(Duration::from_millis(175)).await;
    shutdown.trigger();
    let ticks = handle.await.unwrap();
    assert_eq!(ticks, 3);
}
