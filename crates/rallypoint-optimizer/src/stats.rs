//! Running counters for the optimizer.

use std::time::Duration;

use serde::Serialize;

const LATENCY_SMOOTHING: f64 = 0.1;

/// A snapshot of what the optimizer has done so far.
///
/// Latency is measured around each transport send, so cache hits do not
/// count towards it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptimizerStats {
    /// Messages accepted by `enqueue` or `send_now`.
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    /// Attempts beyond the first, across all messages.
    pub retries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub batches_flushed: u64,
    pub messages_batched: u64,
    pub bytes_before_compression: u64,
    pub bytes_after_compression: u64,
    /// Exponential moving average of send latency.
    pub avg_latency: Duration,
    pub max_latency: Duration,
}

impl OptimizerStats {
    pub(crate) fn record_latency(&mut self, latency: Duration) {
        self.avg_latency = if self.avg_latency.is_zero() {
            latency
        } else {
            self.avg_latency.mul_f64(1.0 - LATENCY_SMOOTHING)
                + latency.mul_f64(LATENCY_SMOOTHING)
        };
        self.max_latency = self.max_latency.max(latency);
    }

    pub(crate) fn record_payload(&mut self, before: usize, after: usize) {
        self.bytes_before_compression += before as u64;
        self.bytes_after_compression += after as u64;
    }

    /// Share of cache lookups that hit, in `0.0..=1.0`.
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    /// Share of finished messages that succeeded.
    pub fn success_rate(&self) -> f64 {
        let done = self.successful + self.failed;
        if done == 0 {
            0.0
        } else {
            self.successful as f64 / done as f64
        }
    }

    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before_compression
            .saturating_sub(self.bytes_after_compression)
    }
}
