//! Suspicion reports and where they go.
//!
//! The validator never sanctions anyone. It hands a report to a
//! [`SuspicionReporter`] and moves on.

use rallypoint_protocol::PlayerId;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::RejectReason;

/// One rejected action, as seen by moderation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuspicionReport {
    pub player: PlayerId,
    pub action: String,
    pub reason: RejectReason,
    /// The player's suspicion score after this rejection.
    pub score: u32,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Receives suspicion reports. Must not block.
pub trait SuspicionReporter: Send + Sync + 'static {
    fn report(&self, report: SuspicionReport);
}

/// Drops every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl SuspicionReporter for NoopReporter {
    fn report(&self, _report: SuspicionReport) {}
}

/// Forwards reports into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    sender: mpsc::UnboundedSender<SuspicionReport>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SuspicionReport>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl SuspicionReporter for ChannelReporter {
    fn report(&self, report: SuspicionReport) {
        if self.sender.send(report).is_err() {
            tracing::debug!("suspicion report receiver dropped");
        }
    }
}
