//! In-process transport: requests are answered by a closure.
//!
//! Used by the demo binary and by tests across the workspace. It also
//! keeps the bookkeeping those tests assert on: how many sends happened
//! and how many were in flight at once.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::{ConnectionId, Request, Response, Transport, TransportError};

type Handler =
    dyn Fn(&Request) -> Result<Response, TransportError> + Send + Sync;

/// A [`Transport`] that answers every request with a user-supplied handler.
pub struct LoopbackTransport {
    handler: Box<Handler>,
    latency: Duration,
    deduplicates: bool,
    sent: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    log: Mutex<Vec<(ConnectionId, Request)>>,
}

impl LoopbackTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Result<Response, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Box::new(handler),
            latency: Duration::ZERO,
            deduplicates: false,
            sent: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with `200` and the request's own payload.
    pub fn echo() -> Self {
        Self::new(|req| Ok(Response::ok(req.payload.clone())))
    }

    /// Delays every response by `latency` (uses Tokio time, so paused
    /// test clocks apply).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Declares at-most-once delivery per request id.
    pub fn with_deduplication(mut self, enabled: bool) -> Self {
        self.deduplicates = enabled;
        self
    }

    /// Number of `send` calls observed so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently in-flight sends observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Sends currently in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Every request seen, with the connection it arrived on.
    pub fn requests(&self) -> Vec<(ConnectionId, Request)> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Counts one send as in flight until dropped, so a send future that is
/// cancelled mid-flight still leaves the count.
struct InFlight<'a> {
    count: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = count.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { count }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transport for LoopbackTransport {
    async fn send(
        &self,
        connection: ConnectionId,
        request: &Request,
    ) -> Result<Response, TransportError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((connection, request.clone()));

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = (self.handler)(request);
        tracing::trace!(
            %connection,
            id = %request.id,
            target = %request.target,
            ok = result.is_ok(),
            "loopback send"
        );
        result
    }

    fn deduplicates(&self, _request: &Request) -> bool {
        self.deduplicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Method, RequestId};

    fn request(payload: &[u8]) -> Request {
        Request::new(RequestId(1), Method::Get, "profile", payload.to_vec())
    }

    #[tokio::test]
    async fn test_echo_returns_payload_and_counts_sends() {
        let transport = LoopbackTransport::echo();
        let resp = transport
            .send(ConnectionId::new(1), &request(b"ping"))
            .await
            .unwrap();
        assert_eq!(resp.payload, b"ping");
        assert_eq!(transport.sent_count(), 1);
        assert_eq!(transport.requests()[0].0, ConnectionId::new(1));
    }

    #[tokio::test]
    async fn test_handler_error_is_returned() {
        let transport =
            LoopbackTransport::new(|_| Err(TransportError::Status { code: 500 }));
        let result = transport.send(ConnectionId::new(1), &request(b"x")).await;
        assert!(matches!(result, Err(TransportError::Status { code: 500 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peak_in_flight_tracks_concurrency() {
        let transport = std::sync::Arc::new(
            LoopbackTransport::echo().with_latency(Duration::from_millis(10)),
        );
        let mut tasks = Vec::new();
        for i in 0..3 {
            let t = std::sync::Arc::clone(&transport);
            tasks.push(tokio::spawn(async move {
                t.send(ConnectionId::new(i), &request(b"x")).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(transport.peak_in_flight(), 3);
        assert_eq!(transport.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_send_leaves_in_flight() {
        let transport = LoopbackTransport::echo().with_latency(Duration::from_millis(100));
        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            transport.send(ConnectionId::new(1), &request(b"x")),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(transport.in_flight(), 0);

        transport.send(ConnectionId::new(2), &request(b"y")).await.unwrap();
        assert_eq!(transport.peak_in_flight(), 1);
    }
}
