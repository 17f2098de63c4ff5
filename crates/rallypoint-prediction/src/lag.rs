//! Validation-time lag compensation.
//!
//! A peer's action arrives late by roughly its latency. Before checking
//! it, the authoritative state is rewound by a fixed offset for the
//! channel it arrived on.

use std::collections::HashMap;
use std::time::Duration;

use rallypoint_protocol::Channel;
use tokio::time::Instant;

use crate::{CompensationConfig, StateHistory};

#[derive(Debug, Clone, Default)]
pub struct LagCompensator {
    config: CompensationConfig,
    overrides: HashMap<Channel, Duration>,
}

impl LagCompensator {
    pub fn new(config: CompensationConfig) -> Self {
        Self {
            config,
            overrides: HashMap::new(),
        }
    }

    /// Replaces the offset for one channel.
    pub fn set_offset(&mut self, channel: Channel, offset: Duration) {
        self.overrides.insert(channel, offset);
    }

    pub fn compensation_for(&self, channel: Channel) -> Duration {
        self.overrides
            .get(&channel)
            .copied()
            .unwrap_or_else(|| self.config.for_channel(channel))
    }

    /// The instant an action received on `channel` at `now` refers to.
    pub fn rewound_instant(&self, channel: Channel, now: Instant) -> Instant {
        now.checked_sub(self.compensation_for(channel)).unwrap_or(now)
    }

    /// The state to validate against for an action received at `now`.
    pub fn rewind<'h, T>(
        &self,
        history: &'h StateHistory<T>,
        channel: Channel,
        now: Instant,
    ) -> Option<&'h T> {
        history.state_at(self.rewound_instant(channel, now))
    }
}
