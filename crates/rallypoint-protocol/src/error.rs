//! Error types for the protocol layer.

/// Errors that can occur while encoding, decoding or interpreting messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, missing required fields,
    /// wrong data types, or truncated messages.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message decoded fine but its content breaks a protocol rule,
    /// e.g. a `player_update` without a position.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// A configuration value that cannot work, detected at startup.
///
/// Lives in the protocol crate because every layer validates its own
/// config section and the application root reports them uniformly.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field holds a value the component cannot run with
    /// (e.g. a connection pool of capacity zero).
    #[error("invalid config `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },

    /// The config document could not be parsed.
    #[error("config parse failed: {0}")]
    Parse(#[source] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
