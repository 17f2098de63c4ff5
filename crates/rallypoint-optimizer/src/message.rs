//! Outbound messages as the optimizer sees them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rallypoint_protocol::Channel;
use rallypoint_transport::{Method, RequestId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Dispatch order within a flushed batch. Higher goes first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A message queued for delivery.
///
/// `sequence` is left at zero by the constructors; the optimizer stamps it
/// from its per-channel counter when the message is accepted.
#[derive(Debug, Clone)]
pub struct NetworkMessage {
    pub id: RequestId,
    /// Application-level type, e.g. `"player_update"`.
    pub kind: String,
    pub target: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub sequence: u64,
    pub channel: Channel,
    pub cacheable: bool,
    /// Per-send deadline for each transport attempt.
    pub timeout: Option<Duration>,
    pub created_at: Instant,
}

impl NetworkMessage {
    pub fn new(
        kind: impl Into<String>,
        method: Method,
        target: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
            kind: kind.into(),
            target: target.into(),
            method,
            headers: BTreeMap::new(),
            payload,
            priority: Priority::Normal,
            sequence: 0,
            channel: Channel::default(),
            cacheable: false,
            timeout: None,
            created_at: Instant::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Allows a successful response to be served from the cache.
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_reliable(&self) -> bool {
        self.channel.is_reliable()
    }

    /// Only idempotent methods are ever cached, whatever the flag says.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable && self.method.is_idempotent()
    }
}
