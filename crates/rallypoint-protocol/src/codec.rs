//! Codec trait and the JSON implementation.
//!
//! A "codec" (coder/decoder) converts between Rust types and raw bytes.
//! The sync layer only needs *something* that implements [`Codec`] to turn
//! [`SyncMessage`](crate::SyncMessage)s into transport payloads.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// `Send + Sync + 'static` because a single codec instance is shared by
/// every task of the sync service.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ```rust
/// use rallypoint_protocol::{Codec, JsonCodec, SyncEventType, SyncMessage};
///
/// let codec = JsonCodec;
/// let msg = SyncMessage::new(SyncEventType::RoomUpdate, 5000)
///     .with("room_id", 3);
///
/// let bytes = codec.encode(&msg).unwrap();
/// let decoded: SyncMessage = codec.decode(&bytes).unwrap();
/// assert_eq!(msg, decoded);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
