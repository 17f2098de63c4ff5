//! Error types for the optimizer.

use std::time::Duration;

use rallypoint_protocol::ConfigError;
use rallypoint_transport::{RequestId, TransportError};

use crate::compression::CompressionError;

/// Why a send through the optimizer failed.
///
/// A cache miss is not an error: it simply falls through to a live send.
#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    /// Every attempt hit a transient failure. Carries the last one.
    #[error("transient network failure after {attempts} attempt(s): {source}")]
    TransientNetwork {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The request cannot succeed as sent (malformed, 4xx). Never retried.
    #[error("request {id} rejected: {source}")]
    PermanentRequest {
        id: RequestId,
        #[source]
        source: TransportError,
    },

    /// No connection could be checked out within `connection_timeout`.
    /// Retryable by the caller.
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    /// The caller's own deadline elapsed before a result arrived.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// The optimizer was shut down before the send could run.
    #[error("transport optimizer is shut down")]
    Shutdown,

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OptimizerError {
    /// `true` if the caller may reasonably try the same send again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork { .. } | Self::PoolExhausted { .. } | Self::Timeout(_)
        )
    }
}
