use std::time::Duration;

/// Errors that can occur in the transport layer.
///
/// Every variant is either *transient* (worth retrying) or *permanent*
/// (the same request will fail the same way). [`TransportError::is_transient`]
/// is the single place that classification lives.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed by the remote side.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Opening a connection to the target failed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// No response arrived within the allotted time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote side answered with a non-success status code.
    #[error("remote returned status {code}")]
    Status {
        /// HTTP-style status code.
        code: u16,
    },

    /// The request could not be encoded, or the response decoded.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// Returns `true` if retrying the same request may succeed.
    ///
    /// Network hiccups, timeouts, 5xx, 408 and 429 are transient.
    /// Malformed requests, other 4xx and shutdown are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionClosed(_)
            | Self::ConnectFailed(_)
            | Self::SendFailed(_)
            | Self::ReceiveFailed(_)
            | Self::Timeout(_) => true,
            Self::Status { code } => is_retryable_status(*code),
            Self::Malformed(_) | Self::Shutdown => false,
        }
    }
}

/// Status codes that indicate a temporary condition on the remote side.
pub(crate) fn is_retryable_status(code: u16) -> bool {
    code >= 500 || code == 408 || code == 429
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient_network_errors_are_retryable() {
        assert!(TransportError::ConnectionClosed("reset".into()).is_transient());
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(
            TransportError::SendFailed(std::io::Error::other("pipe")).is_transient()
        );
    }

    #[test]
    fn test_is_transient_status_codes() {
        assert!(TransportError::Status { code: 503 }.is_transient());
        assert!(TransportError::Status { code: 429 }.is_transient());
        assert!(TransportError::Status { code: 408 }.is_transient());
        assert!(!TransportError::Status { code: 400 }.is_transient());
        assert!(!TransportError::Status { code: 404 }.is_transient());
    }

    #[test]
    fn test_is_transient_malformed_and_shutdown_are_permanent() {
        assert!(!TransportError::Malformed("bad json".into()).is_transient());
        assert!(!TransportError::Shutdown.is_transient());
    }
}
