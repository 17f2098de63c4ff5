//! Periodic workers for Rallypoint.
//!
//! Every background loop in the workspace (batch flusher, cache sweep,
//! publish loop, matchmaking scan) is a Tokio task that `select!`s on a
//! [`TickScheduler`] and a [`ShutdownSignal`]:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         _ = shutdown.wait() => break,
//!         tick = scheduler.wait_for_tick() => {
//!             publish_positions(tick.tick);
//!             scheduler.record_tick_end();
//!         }
//!     }
//! }
//! ```
//!
//! The suspension point is the timer tick; cancelling is dropping or
//! triggering the [`Shutdown`] handle.

mod scheduler;
mod shutdown;

pub use scheduler::{TickConfig, TickInfo, TickScheduler};
pub use shutdown::{Shutdown, ShutdownSignal};
