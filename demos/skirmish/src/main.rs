//! Skirmish: four players, one lobby duel and one matchmade duel, over an
//! in-process transport with simulated latency.
//!
//! Run with `RUST_LOG=debug cargo run -p skirmish` to watch batching,
//! retries and match transitions.

use std::sync::Arc;
use std::time::Duration;

use rallypoint::prelude::*;
use serde_json::{Map, Value, json};

fn action(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// A transport that answers every request with an empty 200 after 15ms.
fn simulated_network() -> LoopbackTransport {
    LoopbackTransport::new(|_request| Ok(rallypoint::transport::Response::ok(Vec::new())))
        .with_latency(Duration::from_millis(15))
}

async fn wait_until_live(sync: &RealtimeSyncService<LoopbackTransport>, player: PlayerId) {
    for _ in 0..100 {
        if sync.player(player).is_some_and(|p| p.status == PlayerStatus::InMatch) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::warn!(%player, "match never went live");
}

#[tokio::main]
async fn main() -> Result<(), RallypointError> {
    init_tracing();

    let mut config = RallypointConfig::default();
    config.sync.match_countdown = Duration::from_secs(1);
    config.matchmaking.scan_interval = Duration::from_millis(500);

    let (reporter, mut reports) = ChannelReporter::new();
    let runtime = RallypointBuilder::new()
        .config(config)
        .reporter(Arc::new(reporter))
        .build(simulated_network())?;
    runtime.start()?;
    let sync = runtime.sync();

    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            tracing::warn!(player = %report.player, reason = %report.reason, score = report.score, "suspicion report");
        }
    });

    for (id, name, rating) in [(1, "ada", 1200), (2, "bo", 1180), (3, "cy", 900), (4, "di", 950)] {
        sync.connect_player(PlayerId(id), name, rating)?;
    }

    // Lobby duel between ada and bo.
    let room = sync.create_room(PlayerId(1), Some(2), GameMode::from("duel"))?;
    sync.join_room(PlayerId(2), room.id)?;
    let lobby_match = sync.start_room_match(room.id, PlayerId(1)).await?;
    sync.acknowledge_match(PlayerId(1)).await?;
    sync.acknowledge_match(PlayerId(2)).await?;

    // Matchmade duel between cy and di.
    sync.queue_for_match(PlayerId(3), GameMode::from("duel")).await?;
    sync.queue_for_match(PlayerId(4), GameMode::from("duel")).await?;

    wait_until_live(sync, PlayerId(1)).await;
    for step in 1..=5u64 {
        sync.submit_action(
            PlayerId(1),
            "move",
            action(json!({"delta": {"x": 1.0, "y": 0.0, "z": 0.5}, "sequence": step})),
        )
        .await?;
        sync.submit_action(PlayerId(2), "score", action(json!({"points": 10})))
            .await?;
    }
    // The server saw ada slightly behind where she predicted.
    let confirmed = Transform::at(Vec3::new(2.5, 0.0, 1.0));
    sync.confirm_action(PlayerId(1), 3, confirmed)?;

    // bo claims an impossible score.
    if let Err(err) = sync
        .submit_action(PlayerId(2), "score", action(json!({"points": 9999})))
        .await
    {
        tracing::info!(code = err.code(), "action refused");
    }

    wait_until_live(sync, PlayerId(3)).await;
    if let Some(match_id) = sync.player(PlayerId(3)).and_then(|p| p.current_match) {
        sync.submit_action(PlayerId(4), "score", action(json!({"points": 3})))
            .await?;
        let info = sync.finish_match(match_id, Some("forfeit".into())).await?;
        tracing::info!(%match_id, scores = ?info.scores, "matchmade duel finished");
    }

    let info = sync.finish_match(lobby_match, Some("time".into())).await?;
    tracing::info!(match_id = %lobby_match, scores = ?info.scores, "lobby duel finished");

    tokio::time::sleep(Duration::from_millis(300)).await;
    runtime.shutdown().await;

    let stats = runtime.optimizer().stats();
    tracing::info!(
        requests = stats.total_requests,
        successful = stats.successful,
        batches = stats.batches_flushed,
        avg_latency_ms = stats.avg_latency.as_millis() as u64,
        "optimizer summary"
    );
    Ok(())
}
