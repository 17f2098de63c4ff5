//! Timestamped snapshots of authoritative state.

use std::collections::VecDeque;

use tokio::time::Instant;

/// Bounded ring of `(recorded_at, state)` snapshots, oldest first.
#[derive(Debug, Clone)]
pub struct StateHistory<T> {
    snapshots: VecDeque<(Instant, T)>,
    capacity: usize,
}

impl<T> StateHistory<T> {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, state: T) {
        self.record_at(Instant::now(), state);
    }

    /// Records a snapshot taken at `at`. Snapshots older than the newest
    /// one already held are ignored.
    pub fn record_at(&mut self, at: Instant, state: T) {
        if self.snapshots.back().is_some_and(|(last, _)| at < *last) {
            return;
        }
        self.snapshots.push_back((at, state));
        if self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
        }
    }

    /// The state as it was at `at`: the newest snapshot not after `at`.
    /// Falls back to the oldest snapshot when `at` predates the history.
    pub fn state_at(&self, at: Instant) -> Option<&T> {
        self.snapshots
            .iter()
            .rev()
            .find(|(recorded, _)| *recorded <= at)
            .or_else(|| self.snapshots.front())
            .map(|(_, state)| state)
    }

    pub fn latest(&self) -> Option<&T> {
        self.snapshots.back().map(|(_, state)| state)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}
