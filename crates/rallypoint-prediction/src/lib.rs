//! Client-side prediction and lag compensation for Rallypoint.
//!
//! - [`PredictionBuffer`] — optimistic local steps awaiting confirmation
//! - [`LagCompensator`] — fixed per-channel rewind used when validating
//! - [`StateHistory`] — timestamped snapshots the compensator rewinds into

mod buffer;
mod config;
mod error;
mod history;
mod lag;

pub use buffer::{PredictionBuffer, PredictionStep, Reconciliation};
pub use config::{CompensationConfig, PredictionConfig};
pub use error::PredictionError;
pub use history::StateHistory;
pub use lag::LagCompensator;
