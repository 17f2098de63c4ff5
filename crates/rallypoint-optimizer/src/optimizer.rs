//! The transport optimizer: one front door for every outbound message.
//!
//! Messages go through `enqueue` (batched) or `send_now` (immediate). Both
//! end up in the same delivery pipeline:
//!
//! 1. cache lookup for cacheable idempotent requests
//! 2. payload compression above the size threshold
//! 3. a pooled connection for the send itself
//! 4. retries on transient failures, for requests that may be repeated
//!
//! A background flusher task owns the batching timer and the periodic
//! cache sweep. Each flushed message is delivered on its own task, so a
//! failing message never affects its batch siblings.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use rallypoint_protocol::SequenceCounter;
use rallypoint_tick::{Shutdown, ShutdownSignal, TickScheduler};
use rallypoint_transport::{Request, Response, Transport, TransportError};
use serde::Serialize;
use tokio::sync::{Notify, broadcast, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};

use crate::batch::BatchQueue;
use crate::cache::{CacheKey, ResponseCache};
use crate::compression::{CONTENT_ENCODING, PayloadCompression};
use crate::message::NetworkMessage;
use crate::pool::ConnectionPool;
use crate::stats::OptimizerStats;
use crate::{OptimizerConfig, OptimizerError};

pub const HEADER_SEQUENCE: &str = "x-sequence";
pub const HEADER_MESSAGE_TYPE: &str = "x-message-type";
pub const HEADER_PRIORITY: &str = "x-priority";

const EVENT_CAPACITY: usize = 256;

type Reply = oneshot::Sender<Result<Response, OptimizerError>>;

/// Why a batch left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// The batch reached `max_batch_size`.
    Full,
    /// The oldest message waited `batch_timeout`.
    Timeout,
    /// The optimizer is shutting down.
    Shutdown,
}

/// Notifications about background work, for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OptimizerEvent {
    BatchFlushed { size: usize, reason: FlushReason },
    CacheSwept { removed: usize },
}

/// Resolves to the outcome of an enqueued message.
#[derive(Debug)]
pub struct SendHandle {
    rx: oneshot::Receiver<Result<Response, OptimizerError>>,
}

impl SendHandle {
    fn resolved(result: Result<Response, OptimizerError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Waits at most `limit` for the outcome.
    ///
    /// # Errors
    /// [`OptimizerError::Timeout`] if the outcome did not arrive in time.
    /// The message itself is not cancelled.
    pub async fn with_timeout(self, limit: Duration) -> Result<Response, OptimizerError> {
        match time::timeout(limit, self).await {
            Ok(result) => result,
            Err(_) => Err(OptimizerError::Timeout(limit)),
        }
    }
}

impl Future for SendHandle {
    type Output = Result<Response, OptimizerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(OptimizerError::Shutdown)))
    }
}

struct Pending {
    message: NetworkMessage,
    reply: Reply,
}

struct QueueState {
    batch: BatchQueue<Pending>,
    closed: bool,
}

struct Shared<T> {
    config: OptimizerConfig,
    transport: Arc<T>,
    pool: ConnectionPool,
    cache: ResponseCache,
    compression: PayloadCompression,
    queue: Mutex<QueueState>,
    sequences: Mutex<SequenceCounter>,
    stats: Mutex<OptimizerStats>,
    wake: Notify,
    events: broadcast::Sender<OptimizerEvent>,
}

struct Lifecycle {
    shutdown: Shutdown,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

/// Batching, compressing, pooling, caching, retrying sender.
///
/// Cheap to clone; clones share one queue, pool and cache.
pub struct TransportOptimizer<T: Transport> {
    shared: Arc<Shared<T>>,
    lifecycle: Arc<Lifecycle>,
}

impl<T: Transport> Clone for TransportOptimizer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }
}

impl<T: Transport> TransportOptimizer<T> {
    /// Validates `config` and starts the background flusher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: OptimizerConfig, transport: T) -> Result<Self, OptimizerError> {
        Self::with_transport(config, Arc::new(transport))
    }

    /// Like [`new`](Self::new), sharing a transport the caller keeps a
    /// handle to.
    pub fn with_transport(config: OptimizerConfig, transport: Arc<T>) -> Result<Self, OptimizerError> {
        config.validate()?;
        let pool = ConnectionPool::new(config.pool.clone())?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            cache: ResponseCache::new(config.cache_ttl),
            compression: PayloadCompression::new(config.compression, config.compression_threshold),
            queue: Mutex::new(QueueState {
                batch: BatchQueue::new(config.max_batch_size, config.batch_timeout),
                closed: false,
            }),
            sequences: Mutex::new(SequenceCounter::new()),
            stats: Mutex::new(OptimizerStats::default()),
            wake: Notify::new(),
            events,
            transport,
            pool,
            config,
        });

        let shutdown = Shutdown::new();
        let flusher = tokio::spawn(run_flusher(Arc::clone(&shared), shutdown.signal()));

        tracing::info!(
            max_batch_size = shared.config.max_batch_size,
            batch_timeout_ms = shared.config.batch_timeout.as_millis() as u64,
            compression = ?shared.config.compression,
            "transport optimizer started"
        );

        Ok(Self {
            shared,
            lifecycle: Arc::new(Lifecycle {
                shutdown,
                flusher: Mutex::new(Some(flusher)),
            }),
        })
    }

    /// Queues `message` for the next batch.
    ///
    /// The sequence number is stamped here, so order of `enqueue` calls is
    /// order of sequence numbers on each channel.
    pub fn enqueue(&self, mut message: NetworkMessage) -> SendHandle {
        let (reply, rx) = oneshot::channel();
        let full = {
            let mut queue = self.shared.lock_queue();
            if queue.closed {
                return SendHandle::resolved(Err(OptimizerError::Shutdown));
            }
            message.sequence = self.shared.next_sequence(&message);
            self.shared.lock_stats().total_requests += 1;
            tracing::trace!(id = %message.id, kind = %message.kind, seq = message.sequence, "message enqueued");
            queue.batch.push(Pending { message, reply }, Instant::now())
        };
        if full {
            tracing::debug!("batch full, waking flusher");
        }
        // Also wakes the flusher for a fresh deadline when the queue was empty.
        self.shared.wake.notify_one();
        SendHandle { rx }
    }

    /// Delivers `message` right away, bypassing the batch queue.
    pub async fn send_now(&self, mut message: NetworkMessage) -> Result<Response, OptimizerError> {
        {
            let queue = self.shared.lock_queue();
            if queue.closed {
                return Err(OptimizerError::Shutdown);
            }
            message.sequence = self.shared.next_sequence(&message);
        }
        self.shared.lock_stats().total_requests += 1;
        self.shared.deliver(message).await
    }

    /// Subscribes to [`OptimizerEvent`]s emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OptimizerEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> OptimizerStats {
        self.shared.lock_stats().clone()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.shared.pool
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.shared.cache
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.shared.config
    }

    /// Messages waiting for a flush.
    pub fn pending(&self) -> usize {
        self.shared.lock_queue().batch.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock_queue().closed
    }

    /// Stops accepting messages, flushes everything queued, waits for
    /// in-flight deliveries, then closes the pool.
    pub async fn shutdown(&self) {
        {
            let mut queue = self.shared.lock_queue();
            if queue.closed {
                return;
            }
            queue.closed = true;
        }
        tracing::info!("transport optimizer shutting down");
        self.lifecycle.shutdown.trigger();

        let flusher = self
            .lifecycle
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = flusher {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "flusher task failed");
            }
        }

        for id in self.shared.pool.close() {
            self.shared.transport.close(id).await;
        }
        tracing::info!("transport optimizer stopped");
    }
}

impl<T: Transport> std::fmt::Debug for TransportOptimizer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptimizer")
            .field("pending", &self.pending())
            .field("pool", &self.shared.pool)
            .finish()
    }
}

impl<T: Transport> Shared<T> {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> MutexGuard<'_, OptimizerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_sequence(&self, message: &NetworkMessage) -> u64 {
        self.sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next(message.channel)
    }

    fn emit(&self, event: OptimizerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Full pipeline for one message. Never panics on transport failure.
    async fn deliver(&self, message: NetworkMessage) -> Result<Response, OptimizerError> {
        let cache_key = message
            .is_cacheable()
            .then(|| CacheKey::new(message.method, &message.target, &message.payload));

        if let Some(key) = &cache_key {
            if let Some(payload) = self.cache.get(key, &message.payload) {
                let mut stats = self.lock_stats();
                stats.cache_hits += 1;
                stats.successful += 1;
                tracing::trace!(id = %message.id, target = %message.target, "served from cache");
                return Ok(Response::ok(payload));
            }
            self.lock_stats().cache_misses += 1;
        }

        let request = self.build_request(&message);
        let retries_allowed =
            message.method.is_idempotent() || self.transport.deduplicates(&request);
        let attempts = self.config.retry.total_attempts(retries_allowed);

        let result = self.send_with_retry(&request, message.timeout, attempts).await;
        match &result {
            Ok(response) => {
                self.lock_stats().successful += 1;
                if let Some(key) = cache_key {
                    self.cache
                        .insert(key, message.payload, response.payload.clone());
                }
            }
            Err(e) => {
                self.lock_stats().failed += 1;
                tracing::warn!(id = %message.id, target = %message.target, error = %e, "delivery failed");
            }
        }
        result
    }

    fn build_request(&self, message: &NetworkMessage) -> Request {
        let encoded = self.compression.encode(&message.payload);
        self.lock_stats()
            .record_payload(message.payload.len(), encoded.bytes.len());

        let mut request = Request::new(message.id, message.method, message.target.clone(), encoded.bytes);
        request.headers = message.headers.clone();
        let mut request = request
            .with_header(HEADER_SEQUENCE, message.sequence.to_string())
            .with_header(HEADER_MESSAGE_TYPE, message.kind.clone())
            .with_header(HEADER_PRIORITY, message.priority.as_str());
        if let Some(encoding) = encoded.encoding {
            request = request.with_header(CONTENT_ENCODING, encoding);
        }
        request
    }

    async fn send_with_retry(
        &self,
        request: &Request,
        timeout: Option<Duration>,
        attempts: u32,
    ) -> Result<Response, OptimizerError> {
        let mut attempt = 1;
        loop {
            match self.attempt(request, timeout).await? {
                Ok(response) => return Ok(response),
                Err(source) if !source.is_transient() => {
                    return Err(OptimizerError::PermanentRequest {
                        id: request.id,
                        source,
                    });
                }
                Err(source) if attempt >= attempts => {
                    return Err(OptimizerError::TransientNetwork {
                        attempts: attempt,
                        source,
                    });
                }
                Err(source) => {
                    let delay = self.config.retry.delay_for(attempt);
                    tracing::debug!(
                        id = %request.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %source,
                        "transient failure, retrying"
                    );
                    self.lock_stats().retries += 1;
                    time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One send on one pooled connection. Pool failures end the delivery;
    /// transport failures are handed back for classification.
    async fn attempt(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Result<Response, TransportError>, OptimizerError> {
        let lease = self.pool.acquire().await?;
        if let Some(old) = lease.replaced() {
            self.transport.close(old).await;
        }

        let started = Instant::now();
        let sent = match timeout {
            Some(limit) => time::timeout(limit, self.transport.send(lease.id(), request))
                .await
                .unwrap_or(Err(TransportError::Timeout(limit))),
            None => self.transport.send(lease.id(), request).await,
        };
        self.lock_stats().record_latency(started.elapsed());
        drop(lease);

        Ok(sent.and_then(|response| {
            if response.is_success() {
                Ok(response)
            } else {
                Err(TransportError::Status {
                    code: response.status,
                })
            }
        }))
    }
}

/// Background task: flushes due batches and sweeps the cache.
async fn run_flusher<T: Transport>(shared: Arc<Shared<T>>, mut shutdown: ShutdownSignal) {
    let mut sweep = TickScheduler::every(shared.config.cache_sweep_interval);
    let mut deliveries = JoinSet::new();

    loop {
        let deadline = shared.lock_queue().batch.oldest_deadline();

        tokio::select! {
            _ = shutdown.wait() => break,
            _ = shared.wake.notified() => {}
            _ = sleep_until(deadline) => {}
            _ = sweep.wait_for_tick() => {
                let removed = shared.cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "expired cache entries swept");
                }
                shared.emit(OptimizerEvent::CacheSwept { removed });
                sweep.record_tick_end();
            }
            Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "delivery task failed");
                }
            }
        }

        let now = Instant::now();
        loop {
            let (batch, max) = {
                let mut queue = shared.lock_queue();
                (queue.batch.take_ready(now), queue.batch.max_size())
            };
            let Some(batch) = batch else { break };
            let reason = if batch.len() >= max {
                FlushReason::Full
            } else {
                FlushReason::Timeout
            };
            dispatch(&shared, &mut deliveries, batch, reason);
        }
    }

    let remaining = shared.lock_queue().batch.drain_all();
    for batch in remaining {
        dispatch(&shared, &mut deliveries, batch, FlushReason::Shutdown);
    }
    while let Some(joined) = deliveries.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "delivery task failed");
        }
    }
    tracing::debug!("flusher stopped");
}

/// Sends one flushed batch, highest priority first.
fn dispatch<T: Transport>(
    shared: &Arc<Shared<T>>,
    deliveries: &mut JoinSet<()>,
    mut batch: Vec<Pending>,
    reason: FlushReason,
) {
    // Stable: FIFO within a priority level.
    batch.sort_by(|a, b| b.message.priority.cmp(&a.message.priority));
    let size = batch.len();
    {
        let mut stats = shared.lock_stats();
        stats.batches_flushed += 1;
        stats.messages_batched += size as u64;
    }
    tracing::debug!(size, ?reason, "batch flushed");
    shared.emit(OptimizerEvent::BatchFlushed { size, reason });

    for Pending { message, reply } in batch {
        let shared = Arc::clone(shared);
        deliveries.spawn(async move {
            let result = shared.deliver(message).await;
            // The caller may have dropped its handle.
            let _ = reply.send(result);
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
