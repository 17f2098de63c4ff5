use std::time::Duration;

use rallypoint_prediction::{
    LagCompensator, PredictionBuffer, PredictionConfig, Reconciliation, StateHistory,
};
use rallypoint_protocol::{Channel, Vec3};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_movement_prediction_reconciles_against_server() {
    let mut buffer: PredictionBuffer<Vec3> =
        PredictionBuffer::new(&PredictionConfig::default()).unwrap();

    // Client predicts three moves of one unit along x.
    for seq in 1..=3u64 {
        buffer.add_step(seq, Vec3::new(seq as f32, 0.0, 0.0)).unwrap();
        tokio::time::advance(Duration::from_millis(16)).await;
    }
    assert_eq!(buffer.pending_steps().len(), 3);

    // Server agrees on the first move, then clamps the second against a wall.
    assert_eq!(buffer.confirm_step(1, Vec3::new(1.0, 0.0, 0.0)), Reconciliation::Matched);
    let wall = Vec3::new(1.5, 0.0, 0.0);
    assert_eq!(buffer.confirm_step(2, wall), Reconciliation::Corrected(wall));

    let pending: Vec<u64> = buffer.pending_steps().iter().map(|s| s.sequence).collect();
    assert_eq!(pending, vec![3]);
    assert_eq!(buffer.authoritative_state(), Some(&wall));
}

#[tokio::test(start_paused = true)]
async fn test_confirmations_never_arriving_stay_bounded() {
    let config = PredictionConfig {
        max_steps: 16,
        prediction_window: Duration::from_millis(500),
        ..PredictionConfig::default()
    };
    let mut buffer = PredictionBuffer::new(&config).unwrap();

    for seq in 1..=200u64 {
        buffer.add_step(seq, seq).unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(buffer.len() <= 16);
    }
    // 50ms apart and a 500ms window: at most 11 steps survive.
    assert!(buffer.len() <= 11);
    assert!(buffer.evicted() >= 189);
}

#[tokio::test(start_paused = true)]
async fn test_lag_compensated_position_lookup() {
    let lag = LagCompensator::default();
    let mut history = StateHistory::new(64);
    let start = Instant::now();

    for tick in 0..10u64 {
        history.record(Vec3::new(tick as f32, 0.0, 0.0));
        tokio::time::advance(Duration::from_millis(20)).await;
    }
    // Now at 200ms. Reliable channel rewinds 100ms to the tick recorded at 100ms.
    let now = start + Duration::from_millis(200);
    let rewound = lag.rewind(&history, Channel::ReliableOrdered, now).unwrap();
    assert_eq!(rewound.x, 5.0);
}
