//! Transport boundary for Rallypoint.
//!
//! Everything above this crate talks to the network through the
//! [`Transport`] trait: `send(target, method, headers, payload)` in, a
//! `(status, payload)` [`Response`] out. The concrete wire (HTTP, a
//! long-lived socket, an in-process loopback) is an implementation detail.
//!
//! # Feature Flags
//!
//! - `websocket` (default) — client-side WebSocket transport via `tokio-tungstenite`

mod error;
mod loopback;
mod request;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use loopback::LoopbackTransport;
pub use request::{Method, Request, RequestId, Response};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;

use std::fmt;
use std::future::Future;

/// Opaque identifier for a pooled transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sends requests to remote targets.
///
/// `connection` names the pooled handle the caller checked out. A transport
/// may keep one physical link per handle; the pool guarantees a handle
/// serves at most one in-flight request at a time.
pub trait Transport: Send + Sync + 'static {
    /// Sends `request` over `connection` and waits for the response.
    fn send(
        &self,
        connection: ConnectionId,
        request: &Request,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send;

    /// Whether this transport delivers `request` at most once, even when
    /// the caller repeats it under the same [`RequestId`].
    ///
    /// Non-idempotent requests are only retried when this returns `true`.
    fn deduplicates(&self, _request: &Request) -> bool {
        false
    }

    /// Releases whatever physical link backs `connection`.
    ///
    /// Called when the pool recycles a handle or shuts down. Default: no-op.
    fn close(
        &self,
        _connection: ConnectionId,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}
