//! Pre-mutation action validation for Rallypoint.
//!
//! [`AntiCheatValidator::validate`] says yes or no to a player action
//! before it touches match state, keeps a per-player suspicion score and
//! reports every rejection through a [`SuspicionReporter`].

mod config;
mod report;
mod validator;

pub use config::AntiCheatConfig;
pub use report::{ChannelReporter, NoopReporter, SuspicionReport, SuspicionReporter};
pub use validator::{ACTION_MOVE, ACTION_SCORE, AntiCheatValidator, RejectReason, Verdict};
