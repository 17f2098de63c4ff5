//! `Rallypoint` builder: wires every service from one config.
//!
//! There are no process-wide singletons. The application root builds one
//! [`Rallypoint`] and hands references (or clones of the sync service) to
//! whatever needs them.

use std::sync::Arc;

use rallypoint_anticheat::{AntiCheatValidator, NoopReporter, SuspicionReporter};
use rallypoint_matchmaking::Matchmaker;
use rallypoint_optimizer::TransportOptimizer;
use rallypoint_sync::{Collaborators, RealtimeSyncService};
use rallypoint_transport::Transport;

use crate::{RallypointConfig, RallypointError};

/// Builder for a [`Rallypoint`] runtime.
///
/// # Example
///
/// ```rust,no_run
/// use rallypoint::prelude::*;
///
/// # async fn run() -> Result<(), RallypointError> {
/// let runtime = RallypointBuilder::new()
///     .config(RallypointConfig::default())
///     .build(LoopbackTransport::echo())?;
/// runtime.start()?;
/// runtime.sync().connect_player(PlayerId(1), "ada", 1200)?;
/// runtime.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct RallypointBuilder {
    config: RallypointConfig,
    reporter: Arc<dyn SuspicionReporter>,
}

impl RallypointBuilder {
    pub fn new() -> Self {
        Self {
            config: RallypointConfig::default(),
            reporter: Arc::new(NoopReporter),
        }
    }

    pub fn config(mut self, config: RallypointConfig) -> Self {
        self.config = config;
        self
    }

    /// Where anti-cheat suspicion reports go. Defaults to nowhere.
    pub fn reporter(mut self, reporter: Arc<dyn SuspicionReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Validates the config and spawns the optimizer and matchmaker.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build<T: Transport>(self, transport: T) -> Result<Rallypoint<T>, RallypointError> {
        self.config.validate()?;
        let RallypointConfig {
            optimizer,
            sync,
            matchmaking,
            prediction,
            anticheat,
        } = self.config;

        let optimizer = TransportOptimizer::new(optimizer, transport)?;
        let (matchmaker, scan_outcomes) = Matchmaker::spawn(matchmaking)?;
        let validator = Arc::new(AntiCheatValidator::with_reporter(anticheat, self.reporter)?);

        let sync = RealtimeSyncService::new(
            sync,
            Collaborators {
                optimizer,
                matchmaker,
                scan_outcomes,
                validator,
                prediction,
            },
        )?;
        tracing::info!("rallypoint runtime built");
        Ok(Rallypoint { sync })
    }
}

impl Default for RallypointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired runtime. Owns the sync service, which in turn owns the
/// optimizer, the matchmaker and the validator.
pub struct Rallypoint<T: Transport> {
    sync: RealtimeSyncService<T>,
}

impl<T: Transport> Rallypoint<T> {
    /// Starts the publish loop and event handling.
    pub fn start(&self) -> Result<(), RallypointError> {
        self.sync.start()?;
        Ok(())
    }

    pub fn sync(&self) -> &RealtimeSyncService<T> {
        &self.sync
    }

    pub fn optimizer(&self) -> &TransportOptimizer<T> {
        self.sync.optimizer()
    }

    pub fn matchmaker(&self) -> &Matchmaker {
        self.sync.matchmaker()
    }

    pub fn validator(&self) -> &Arc<AntiCheatValidator> {
        self.sync.validator()
    }

    /// Stops every loop and flushes pending outbound messages.
    pub async fn shutdown(&self) {
        self.sync.shutdown().await;
    }
}

impl<T: Transport> std::fmt::Debug for Rallypoint<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rallypoint").field("sync", &self.sync).finish()
    }
}
