//! Per-channel sequence numbers.
//!
//! Senders stamp outbound messages with a [`SequenceCounter`]; receivers
//! run inbound updates through a [`SequenceTracker`], which applies
//! last-write-wins: anything not strictly newer than what was already
//! applied is dropped.

use std::collections::HashMap;

use crate::Channel;

/// Hands out strictly increasing sequence numbers, one series per channel.
#[derive(Debug, Default, Clone)]
pub struct SequenceCounter {
    next: HashMap<Channel, u64>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence number for `channel`, starting at 1.
    pub fn next(&mut self, channel: Channel) -> u64 {
        let slot = self.next.entry(channel).or_insert(0);
        *slot += 1;
        *slot
    }

    /// The last number handed out on `channel`, if any.
    pub fn current(&self, channel: Channel) -> Option<u64> {
        self.next.get(&channel).copied()
    }
}

/// Last-write-wins gate for one inbound stream.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    last_applied: Option<u64>,
    dropped: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` (and records `seq`) if it is newer than anything
    /// applied so far. Lower or duplicate numbers return `false`.
    pub fn accept(&mut self, seq: u64) -> bool {
        match self.last_applied {
            Some(last) if seq <= last => {
                self.dropped += 1;
                false
            }
            _ => {
                self.last_applied = Some(seq);
                true
            }
        }
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    /// How many updates were rejected as stale or duplicate.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
