//! Bounded history of locally applied, not yet confirmed actions.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::{PredictionConfig, PredictionError};

/// One optimistic local action.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionStep<T> {
    pub sequence: u64,
    /// The locally predicted result of the action.
    pub payload: T,
    pub timestamp: Instant,
    pub confirmed: bool,
}

/// What `confirm_step` concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation<T> {
    /// The server agreed with the prediction.
    Matched,
    /// The server disagreed. Local state must snap to the carried value;
    /// steps up to the confirmed sequence were discarded.
    Corrected(T),
    /// The step was no longer buffered (evicted or never added). The
    /// confirmed value was still adopted as authoritative.
    Unknown,
    /// A newer sequence was already confirmed. Nothing changed.
    Stale,
}

/// Ring of [`PredictionStep`]s, ordered by sequence.
///
/// Steps leave the buffer oldest-first when `max_steps` is exceeded or when
/// they are older than `prediction_window`, whichever happens first.
#[derive(Debug)]
pub struct PredictionBuffer<T> {
    steps: VecDeque<PredictionStep<T>>,
    max_steps: usize,
    window: std::time::Duration,
    confirmed_through: Option<u64>,
    authoritative: Option<T>,
    evicted: u64,
}

impl<T: Clone + PartialEq> PredictionBuffer<T> {
    pub fn new(config: &PredictionConfig) -> Result<Self, PredictionError> {
        config.validate()?;
        Ok(Self {
            steps: VecDeque::with_capacity(config.max_steps),
            max_steps: config.max_steps,
            window: config.prediction_window,
            confirmed_through: None,
            authoritative: None,
            evicted: 0,
        })
    }

    /// Records a locally predicted step.
    ///
    /// # Errors
    /// - [`PredictionError::Obsolete`] if `sequence` was already confirmed through
    /// - [`PredictionError::OutOfOrder`] if it does not follow the last buffered step
    pub fn add_step(&mut self, sequence: u64, payload: T) -> Result<(), PredictionError> {
        self.check_sequence(sequence)?;

        let now = Instant::now();
        self.prune_expired(now);
        self.steps.push_back(PredictionStep {
            sequence,
            payload,
            timestamp: now,
            confirmed: false,
        });
        while self.steps.len() > self.max_steps {
            self.steps.pop_front();
            self.evicted += 1;
        }
        Ok(())
    }

    /// Whether `sequence` could be added as the next step.
    pub fn check_sequence(&self, sequence: u64) -> Result<(), PredictionError> {
        if let Some(confirmed_through) = self.confirmed_through {
            if sequence <= confirmed_through {
                return Err(PredictionError::Obsolete {
                    sequence,
                    confirmed_through,
                });
            }
        }
        if let Some(last) = self.steps.back().map(|s| s.sequence) {
            if sequence <= last {
                return Err(PredictionError::OutOfOrder { sequence, last });
            }
        }
        Ok(())
    }

    /// Applies the server's verdict for `sequence`.
    ///
    /// After this returns, no step with a sequence `<= sequence` is ever
    /// reported by [`pending_steps`](Self::pending_steps) again.
    pub fn confirm_step(&mut self, sequence: u64, confirmed: T) -> Reconciliation<T> {
        if self.confirmed_through.is_some_and(|c| sequence < c) {
            if let Some(step) = self.steps.iter_mut().find(|s| s.sequence == sequence) {
                step.confirmed = true;
            }
            return Reconciliation::Stale;
        }
        self.confirmed_through = Some(sequence);

        let outcome = match self.steps.iter_mut().find(|s| s.sequence == sequence) {
            Some(step) => {
                step.confirmed = true;
                if step.payload == confirmed {
                    Reconciliation::Matched
                } else {
                    Reconciliation::Corrected(confirmed.clone())
                }
            }
            None => Reconciliation::Unknown,
        };

        if matches!(outcome, Reconciliation::Corrected(_)) {
            let before = self.steps.len();
            self.steps.retain(|s| s.sequence > sequence);
            tracing::debug!(
                sequence,
                discarded = before - self.steps.len(),
                "prediction corrected, snapping to confirmed state"
            );
        }
        self.authoritative = Some(confirmed);
        outcome
    }

    /// Unconfirmed steps newer than the last confirmation, oldest first.
    pub fn pending_steps(&self) -> Vec<&PredictionStep<T>> {
        let floor = self.confirmed_through;
        self.steps
            .iter()
            .filter(|s| !s.confirmed && floor.is_none_or(|c| s.sequence > c))
            .collect()
    }

    /// Drops steps older than the prediction window. Returns how many.
    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let mut pruned = 0;
        while let Some(front) = self.steps.front() {
            if now.saturating_duration_since(front.timestamp) <= self.window {
                break;
            }
            self.steps.pop_front();
            pruned += 1;
        }
        if pruned > 0 {
            self.evicted += pruned as u64;
            tracing::trace!(pruned, "expired prediction steps pruned");
        }
        pruned
    }

    /// The last value confirmed by the server.
    pub fn authoritative_state(&self) -> Option<&T> {
        self.authoritative.as_ref()
    }

    /// The newest local view: the last pending prediction, falling back to
    /// the authoritative state.
    pub fn predicted_state(&self) -> Option<&T> {
        self.pending_steps()
            .last()
            .map(|s| &s.payload)
            .or(self.authoritative.as_ref())
    }

    pub fn confirmed_through(&self) -> Option<u64> {
        self.confirmed_through
    }

    /// Steps removed by capacity or window, confirmed or not.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn buffer(max_steps: usize) -> PredictionBuffer<i32> {
        PredictionBuffer::new(&PredictionConfig {
            max_steps,
            ..PredictionConfig::default()
        })
        .unwrap()
    }

    fn sequences(buffer: &PredictionBuffer<i32>) -> Vec<u64> {
        buffer.pending_steps().iter().map(|s| s.sequence).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_step_evicts_oldest_past_capacity() {
        let mut buf = buffer(3);
        for seq in 1..=5 {
            buf.add_step(seq, seq as i32).unwrap();
        }
        assert_eq!(sequences(&buf), vec![3, 4, 5]);
        assert_eq!(buf.evicted(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_step_prunes_steps_outside_window() {
        let mut buf = buffer(64);
        buf.add_step(1, 10).unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        buf.add_step(2, 20).unwrap();
        assert_eq!(sequences(&buf), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_step_rejects_out_of_order() {
        let mut buf = buffer(8);
        buf.add_step(5, 0).unwrap();
        assert!(matches!(
            buf.add_step(5, 0),
            Err(PredictionError::OutOfOrder { sequence: 5, last: 5 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_sequence_leaves_buffer_untouched() {
        let mut buf = buffer(8);
        assert!(buf.check_sequence(1).is_ok());
        assert!(buf.pending_steps().is_empty());

        buf.add_step(3, 0).unwrap();
        buf.confirm_step(3, 0);
        assert!(matches!(
            buf.check_sequence(2),
            Err(PredictionError::Obsolete { sequence: 2, confirmed_through: 3 })
        ));
        assert!(buf.check_sequence(4).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_step_matching_prediction() {
        let mut buf = buffer(8);
        buf.add_step(1, 10).unwrap();
        buf.add_step(2, 20).unwrap();

        assert_eq!(buf.confirm_step(1, 10), Reconciliation::Matched);
        assert_eq!(sequences(&buf), vec![2]);
        assert_eq!(buf.authoritative_state(), Some(&10));
        assert_eq!(buf.predicted_state(), Some(&20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_step_mismatch_snaps_and_discards_older() {
        let mut buf = buffer(8);
        for seq in 1..=4 {
            buf.add_step(seq, seq as i32 * 10).unwrap();
        }

        assert_eq!(buf.confirm_step(2, 99), Reconciliation::Corrected(99));
        assert_eq!(buf.len(), 2);
        assert_eq!(sequences(&buf), vec![3, 4]);
        assert_eq!(buf.authoritative_state(), Some(&99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_step_unknown_still_advances_floor() {
        let mut buf = buffer(2);
        for seq in 1..=4 {
            buf.add_step(seq, 0).unwrap();
        }
        assert_eq!(buf.confirm_step(1, 0), Reconciliation::Unknown);
        assert_eq!(buf.confirmed_through(), Some(1));
        assert!(matches!(buf.add_step(1, 0), Err(PredictionError::Obsolete { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_never_reports_confirmed_or_lower() {
        let mut buf = buffer(16);
        for seq in 1..=10 {
            buf.add_step(seq, seq as i32).unwrap();
        }
        // Out-of-order confirmations: the floor only moves up.
        for (seq, value) in [(4, 4), (2, 2), (7, 70), (5, 5)] {
            let outcome = buf.confirm_step(seq, value);
            if matches!(seq, 2 | 5) {
                assert_eq!(outcome, Reconciliation::Stale);
            }
            let floor = buf.confirmed_through().unwrap();
            assert!(buf.pending_steps().iter().all(|s| s.sequence > floor));
            assert!(buf.pending_steps().iter().all(|s| s.sequence > seq));
        }
        assert_eq!(sequences(&buf), vec![8, 9, 10]);
        assert_eq!(buf.authoritative_state(), Some(&70));
    }
}
