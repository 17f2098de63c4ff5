use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rallypoint_optimizer::{
    CONTENT_ENCODING, FlushReason, HEADER_SEQUENCE, NetworkMessage, OptimizerConfig,
    OptimizerError, OptimizerEvent, PoolConfig, Priority, RetryPolicy, TransportOptimizer,
};
use rallypoint_transport::{LoopbackTransport, Method, Response, TransportError};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;

fn config() -> OptimizerConfig {
    OptimizerConfig {
        max_batch_size: 10,
        batch_timeout: Duration::from_millis(100),
        ..OptimizerConfig::default()
    }
}

fn get(target: &str) -> NetworkMessage {
    NetworkMessage::new("query", Method::Get, target, b"q".to_vec())
}

async fn next_flush(events: &mut broadcast::Receiver<OptimizerEvent>) -> (usize, FlushReason) {
    loop {
        match events.recv().await.unwrap() {
            OptimizerEvent::BatchFlushed { size, reason } => return (size, reason),
            OptimizerEvent::CacheSwept { .. } => continue,
        }
    }
}

fn failing_with(status: u16) -> LoopbackTransport {
    LoopbackTransport::new(move |_| Ok(Response::with_status(status, Vec::new())))
}

// =========================================================================
// Batching
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_enqueue_twelve_flushes_ten_then_two_after_timeout() {
    let optimizer = TransportOptimizer::new(config(), LoopbackTransport::echo()).unwrap();
    let mut events = optimizer.subscribe();
    let start = Instant::now();

    let handles: Vec<_> = (0..12)
        .map(|i| optimizer.enqueue(get(&format!("player/{i}"))))
        .collect();

    assert_eq!(next_flush(&mut events).await, (10, FlushReason::Full));
    assert!(start.elapsed() < Duration::from_millis(100));

    assert_eq!(next_flush(&mut events).await, (2, FlushReason::Timeout));
    assert!(start.elapsed() >= Duration::from_millis(100));

    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }
    let stats = optimizer.stats();
    assert_eq!(stats.batches_flushed, 2);
    assert_eq!(stats.messages_batched, 12);
    assert_eq!(stats.successful, 12);
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_stamps_increasing_sequence_per_channel() {
    let transport = Arc::new(LoopbackTransport::echo());
    let optimizer = TransportOptimizer::with_transport(config(), Arc::clone(&transport)).unwrap();

    let handles: Vec<_> = (0..3).map(|_| optimizer.enqueue(get("state"))).collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let sequences: BTreeSet<String> = transport
        .requests()
        .iter()
        .filter_map(|(_, req)| req.header(HEADER_SEQUENCE).map(str::to_string))
        .collect();
    assert_eq!(sequences, BTreeSet::from(["1".to_string(), "2".to_string(), "3".to_string()]));
}

#[tokio::test(start_paused = true)]
async fn test_failing_message_does_not_affect_siblings() {
    let transport = LoopbackTransport::new(|req| {
        if req.target == "bad" {
            Err(TransportError::Status { code: 400 })
        } else {
            Ok(Response::ok(req.payload.clone()))
        }
    });
    let optimizer = TransportOptimizer::new(config(), transport).unwrap();

    let good_a = optimizer.enqueue(get("good-a"));
    let bad = optimizer.enqueue(get("bad").with_priority(Priority::Critical));
    let good_b = optimizer.enqueue(get("good-b"));

    assert!(good_a.await.is_ok());
    assert!(matches!(bad.await, Err(OptimizerError::PermanentRequest { .. })));
    assert!(good_b.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_send_handle_with_timeout_expires() {
    let transport = LoopbackTransport::echo().with_latency(Duration::from_secs(1));
    let optimizer = TransportOptimizer::new(config(), transport).unwrap();

    let result = optimizer
        .enqueue(get("slow"))
        .with_timeout(Duration::from_millis(10))
        .await;
    assert!(matches!(result, Err(OptimizerError::Timeout(_))));
}

// =========================================================================
// Pool
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_eight_concurrent_sends_never_exceed_pool_of_five() {
    let transport = Arc::new(LoopbackTransport::echo().with_latency(Duration::from_millis(50)));
    let config = OptimizerConfig {
        pool: PoolConfig::with_capacity(5),
        ..config()
    };
    let optimizer = TransportOptimizer::with_transport(config, Arc::clone(&transport)).unwrap();

    let start = Instant::now();
    let mut sends = JoinSet::new();
    for i in 0..8 {
        let optimizer = optimizer.clone();
        sends.spawn(async move { optimizer.send_now(get(&format!("item/{i}"))).await });
    }

    // Five sends hold every connection; the other three wait for a release.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(optimizer.pool().active(), 5);
    assert_eq!(transport.in_flight(), 5);
    assert_eq!(transport.sent_count(), 5);

    let mut ok = 0;
    while let Some(result) = sends.join_next().await {
        assert!(result.unwrap().is_ok());
        ok += 1;
    }

    assert_eq!(ok, 8);
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(transport.peak_in_flight(), 5);
    assert_eq!(optimizer.pool().peak_active(), 5);
    assert_eq!(optimizer.pool().active(), 0);
}

// =========================================================================
// Cache
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_cacheable_get_served_within_ttl_then_refetched() {
    let transport = Arc::new(LoopbackTransport::echo());
    let optimizer = TransportOptimizer::with_transport(config(), Arc::clone(&transport)).unwrap();
    let profile = || get("profile/7").cacheable();

    optimizer.send_now(profile()).await.unwrap();
    assert_eq!(transport.sent_count(), 1);

    tokio::time::advance(Duration::from_secs(250)).await;
    let cached = optimizer.send_now(profile()).await.unwrap();
    assert_eq!(cached.payload, b"q");
    assert_eq!(transport.sent_count(), 1, "served from cache");

    tokio::time::advance(Duration::from_secs(150)).await;
    optimizer.send_now(profile()).await.unwrap();
    assert_eq!(transport.sent_count(), 2, "expired entry refetched");

    let stats = optimizer.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 2);
}

#[tokio::test(start_paused = true)]
async fn test_post_is_never_served_from_cache() {
    let transport = Arc::new(LoopbackTransport::echo());
    let optimizer = TransportOptimizer::with_transport(config(), Arc::clone(&transport)).unwrap();
    let score = || NetworkMessage::new("score", Method::Post, "score", b"10".to_vec()).cacheable();

    optimizer.send_now(score()).await.unwrap();
    optimizer.send_now(score()).await.unwrap();
    assert_eq!(transport.sent_count(), 2);
}

// =========================================================================
// Retries
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failure_exhausts_all_attempts() {
    let transport = Arc::new(failing_with(503));
    let optimizer = TransportOptimizer::with_transport(config(), Arc::clone(&transport)).unwrap();
    let start = Instant::now();

    let err = optimizer.send_now(get("flaky")).await.unwrap_err();
    match err {
        OptimizerError::TransientNetwork { attempts, .. } => assert_eq!(attempts, 4),
        other => panic!("expected TransientNetwork, got {other:?}"),
    }
    assert_eq!(transport.sent_count(), 4);
    assert!(start.elapsed() >= Duration::from_secs(3), "fixed 1s between attempts");
    assert_eq!(optimizer.stats().retries, 3);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_not_retried() {
    let transport = Arc::new(failing_with(404));
    let optimizer = TransportOptimizer::with_transport(config(), Arc::clone(&transport)).unwrap();

    let err = optimizer.send_now(get("missing")).await.unwrap_err();
    assert!(matches!(err, OptimizerError::PermanentRequest { .. }));
    assert_eq!(transport.sent_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_idempotent_request_not_retried_without_deduplication() {
    let transport = Arc::new(failing_with(503));
    let optimizer = TransportOptimizer::with_transport(config(), Arc::clone(&transport)).unwrap();

    let msg = NetworkMessage::new("score", Method::Post, "score", b"1".to_vec());
    let err = optimizer.send_now(msg).await.unwrap_err();
    assert!(matches!(err, OptimizerError::TransientNetwork { attempts: 1, .. }));
    assert_eq!(transport.sent_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_idempotent_request_retried_when_transport_deduplicates() {
    let transport = Arc::new(failing_with(503).with_deduplication(true));
    let optimizer = TransportOptimizer::with_transport(config(), Arc::clone(&transport)).unwrap();

    let msg = NetworkMessage::new("score", Method::Post, "score", b"1".to_vec());
    let _ = optimizer.send_now(msg).await;
    assert_eq!(transport.sent_count(), 4);

    let ids: HashSet<_> = transport.requests().iter().map(|(_, r)| r.id).collect();
    assert_eq!(ids.len(), 1, "every attempt reuses the request id");
}

#[tokio::test(start_paused = true)]
async fn test_per_send_timeout_counts_as_transient() {
    let transport = LoopbackTransport::echo().with_latency(Duration::from_secs(1));
    let config = OptimizerConfig {
        retry: RetryPolicy::none(),
        ..config()
    };
    let optimizer = TransportOptimizer::new(config, transport).unwrap();

    let msg = get("slow").with_timeout(Duration::from_millis(100));
    let err = optimizer.send_now(msg).await.unwrap_err();
    match err {
        OptimizerError::TransientNetwork { source, .. } => {
            assert!(matches!(source, TransportError::Timeout(_)));
        }
        other => panic!("expected TransientNetwork, got {other:?}"),
    }
}

// =========================================================================
// Compression
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_large_payload_sent_compressed_with_header() {
    let transport = Arc::new(LoopbackTransport::echo());
    let optimizer = TransportOptimizer::with_transport(config(), Arc::clone(&transport)).unwrap();

    let big = NetworkMessage::new("snapshot", Method::Put, "world", vec![b'a'; 4096]);
    let small = NetworkMessage::new("ping", Method::Put, "lobby", vec![b'a'; 64]);
    optimizer.send_now(big).await.unwrap();
    optimizer.send_now(small).await.unwrap();

    let log = transport.requests();
    let world = &log.iter().find(|(_, r)| r.target == "world").unwrap().1;
    let lobby = &log.iter().find(|(_, r)| r.target == "lobby").unwrap().1;
    assert_eq!(world.header(CONTENT_ENCODING), Some("lz4"));
    assert!(world.payload.len() < 4096);
    assert_eq!(lobby.header(CONTENT_ENCODING), None);
    assert_eq!(lobby.payload.len(), 64);
    assert!(optimizer.stats().bytes_saved() > 0);
}

// =========================================================================
// Shutdown
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_pending_and_rejects_new_messages() {
    let optimizer = TransportOptimizer::new(config(), LoopbackTransport::echo()).unwrap();
    let start = Instant::now();

    let handles: Vec<_> = (0..3).map(|i| optimizer.enqueue(get(&format!("p/{i}")))).collect();
    optimizer.shutdown().await;

    for handle in handles {
        assert!(handle.await.is_ok());
    }
    assert!(start.elapsed() < Duration::from_millis(100), "flushed without waiting for the timer");
    assert!(optimizer.is_shut_down());

    assert!(matches!(optimizer.enqueue(get("late")).await, Err(OptimizerError::Shutdown)));
    assert!(matches!(optimizer.send_now(get("late")).await, Err(OptimizerError::Shutdown)));
}

#[tokio::test]
async fn test_new_rejects_invalid_config() {
    let config = OptimizerConfig {
        max_batch_size: 0,
        ..config()
    };
    let err = TransportOptimizer::new(config, LoopbackTransport::echo()).unwrap_err();
    assert!(matches!(err, OptimizerError::Config(_)));
}
