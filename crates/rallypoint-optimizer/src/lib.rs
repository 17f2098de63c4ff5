//! Outbound traffic optimizer for Rallypoint.
//!
//! Sits between game services and a [`Transport`](rallypoint_transport::Transport)
//! and makes each message cheaper to send: batching by size or age,
//! compression above a threshold, a bounded connection pool, a TTL
//! response cache and retries with backoff for transient failures.
//!
//! # Key types
//!
//! - [`TransportOptimizer`] — the front door: `enqueue`, `send_now`, `shutdown`
//! - [`NetworkMessage`] — what callers hand in
//! - [`ConnectionPool`] — bounded, recycling pool of connection handles
//! - [`ResponseCache`] — TTL cache for idempotent responses
//! - [`OptimizerConfig`] — every knob, with defaults

mod batch;
mod cache;
mod compression;
mod config;
mod error;
mod message;
mod optimizer;
mod pool;
mod retry;
mod stats;

pub use batch::BatchQueue;
pub use cache::{CacheKey, CachedEntry, ResponseCache};
pub use compression::{
    CONTENT_ENCODING, CompressionError, CompressionScheme, Compressor, EncodedPayload,
    IdentityCompressor, Lz4Compressor, PayloadCompression,
};
pub use config::{OptimizerConfig, PoolConfig};
pub use error::OptimizerError;
pub use message::{NetworkMessage, Priority};
pub use optimizer::{
    FlushReason, HEADER_MESSAGE_TYPE, HEADER_PRIORITY, HEADER_SEQUENCE, OptimizerEvent,
    SendHandle, TransportOptimizer,
};
pub use pool::{Connection, ConnectionPool, ConnectionState, PooledConnection};
pub use retry::{Backoff, RetryPolicy};
pub use stats::OptimizerStats;
