//! Size-or-age batching.
//!
//! A batch is ready when it holds `max_size` items, or when its oldest
//! item has waited `max_age`. Whichever happens first wins.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// FIFO of pending items with flush deadlines.
#[derive(Debug)]
pub struct BatchQueue<T> {
    items: VecDeque<(T, Instant)>,
    max_size: usize,
    max_age: Duration,
}

impl<T> BatchQueue<T> {
    /// `max_size` is clamped to at least 1.
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            max_size: max_size.max(1),
            max_age,
        }
    }

    /// Appends an item. Returns `true` if the queue now holds a full batch.
    pub fn push(&mut self, item: T, now: Instant) -> bool {
        self.items.push_back((item, now));
        self.items.len() >= self.max_size
    }

    /// When the oldest pending item's batch must be flushed.
    pub fn oldest_deadline(&self) -> Option<Instant> {
        self.items.front().map(|(_, at)| *at + self.max_age)
    }

    /// Takes the next batch if one is due at `now`.
    ///
    /// A full queue yields exactly `max_size` items. Otherwise, once the
    /// oldest item's deadline has passed, everything pending is taken.
    pub fn take_ready(&mut self, now: Instant) -> Option<Vec<T>> {
        if self.items.len() >= self.max_size {
            return Some(self.take(self.max_size));
        }
        match self.oldest_deadline() {
            Some(deadline) if deadline <= now => Some(self.take(self.items.len())),
            _ => None,
        }
    }

    /// Takes everything, split into batches of at most `max_size`.
    pub fn drain_all(&mut self) -> Vec<Vec<T>> {
        let mut batches = Vec::new();
        while !self.items.is_empty() {
            let n = self.items.len().min(self.max_size);
            batches.push(self.take(n));
        }
        batches
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn take(&mut self, n: usize) -> Vec<T> {
        self.items.drain(..n).map(|(item, _)| item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_twelve_messages_flush_as_ten_then_two() {
        let mut queue = BatchQueue::new(10, Duration::from_millis(100));
        let start = Instant::now();

        let mut full = false;
        for i in 0..10 {
            full = queue.push(i, start);
        }
        assert!(full);
        assert_eq!(queue.take_ready(start), Some((0..10).collect()));

        queue.push(10, start);
        queue.push(11, start);
        assert_eq!(queue.take_ready(start), None);
        assert_eq!(queue.take_ready(start + Duration::from_millis(99)), None);
        assert_eq!(
            queue.take_ready(start + Duration::from_millis(100)),
            Some(vec![10, 11])
        );
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_tracks_oldest_item() {
        let mut queue = BatchQueue::new(10, Duration::from_millis(100));
        assert_eq!(queue.oldest_deadline(), None);

        let t0 = Instant::now();
        queue.push("a", t0);
        queue.push("b", t0 + Duration::from_millis(50));
        assert_eq!(queue.oldest_deadline(), Some(t0 + Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_yields_only_max_size() {
        let mut queue = BatchQueue::new(3, Duration::from_secs(1));
        let now = Instant::now();
        for i in 0..7 {
            queue.push(i, now);
        }
        assert_eq!(queue.take_ready(now), Some(vec![0, 1, 2]));
        assert_eq!(queue.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_all_chunks_by_max_size() {
        let mut queue = BatchQueue::new(4, Duration::from_secs(1));
        let now = Instant::now();
        for i in 0..9 {
            queue.push(i, now);
        }
        let batches = queue.drain_all();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], vec![8]);
        assert!(queue.is_empty());
    }
}
