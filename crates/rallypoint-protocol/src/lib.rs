//! Shared vocabulary for Rallypoint.
//!
//! - **Identity** ([`PlayerId`], [`RoomId`], [`MatchId`], [`GameMode`])
//! - **Sync envelope** ([`SyncMessage`], [`SyncEventType`]) — the
//!   `{type, data, timestamp}` shape every outbound state change takes.
//! - **Sequencing** ([`SequenceCounter`], [`SequenceTracker`]) — strictly
//!   increasing per-channel counters and the last-write-wins gate that
//!   drops stale or duplicate updates.
//! - **Codec** ([`Codec`], [`JsonCodec`]) — how envelopes become bytes.
//!
//! ```text
//! Sync service (state) → Protocol (SyncMessage) → Optimizer (bytes) → Transport
//! ```

mod codec;
mod error;
mod sequence;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::{ConfigError, ProtocolError};
pub use sequence::{SequenceCounter, SequenceTracker};
pub use types::{
    Channel, GameMode, MatchId, PlayerId, RoomId, SyncEventType, SyncMessage,
    Transform, Vec3, now_millis,
};
