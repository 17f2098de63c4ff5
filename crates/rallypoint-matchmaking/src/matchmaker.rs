//! Matchmaker actor: owns a [`MatchmakingEngine`] inside a Tokio task and
//! scans it on a fixed interval.
//!
//! Callers talk to it through a cloneable [`Matchmaker`] handle. Every
//! non-empty scan result is pushed to the outcome channel handed back by
//! [`Matchmaker::spawn`].

use rallypoint_protocol::{GameMode, PlayerId};
use rallypoint_tick::{TickConfig, TickScheduler};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::{MatchmakingConfig, MatchmakingEngine, MatchmakingError, QueueEntry, ScanOutcome};

enum MatchmakerCommand {
    Enqueue {
        player: PlayerId,
        skill_rating: u32,
        game_mode: GameMode,
        reply: oneshot::Sender<Result<(), MatchmakingError>>,
    },
    Dequeue {
        player: PlayerId,
        reply: oneshot::Sender<Result<QueueEntry, MatchmakingError>>,
    },
    Requeue {
        entry: QueueEntry,
        reply: oneshot::Sender<Result<(), MatchmakingError>>,
    },
    QueueLen {
        game_mode: GameMode,
        reply: oneshot::Sender<usize>,
    },
    Position {
        player: PlayerId,
        reply: oneshot::Sender<Option<usize>>,
    },
    ScanNow {
        reply: oneshot::Sender<ScanOutcome>,
    },
    Shutdown,
}

/// Handle to a running matchmaker. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Matchmaker {
    sender: mpsc::Sender<MatchmakerCommand>,
}

impl std::fmt::Debug for MatchmakerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Enqueue { .. } => "Enqueue",
            Self::Dequeue { .. } => "Dequeue",
            Self::Requeue { .. } => "Requeue",
            Self::QueueLen { .. } => "QueueLen",
            Self::Position { .. } => "Position",
            Self::ScanNow { .. } => "ScanNow",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl Matchmaker {
    /// Validates `config`, spawns the actor and returns its handle plus the
    /// receiver of scan outcomes.
    pub fn spawn(
        config: MatchmakingConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ScanOutcome>), MatchmakingError> {
        let engine = MatchmakingEngine::new(config)?;
        let (tx, rx) = mpsc::channel(engine.config().channel_size);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let actor = MatchmakerActor {
            scan: TickScheduler::new(
                TickConfig::every(engine.config().scan_interval).with_jitter(engine.config().scan_jitter),
            ),
            engine,
            receiver: rx,
            outcomes: outcome_tx,
        };
        tokio::spawn(actor.run());

        Ok((Self { sender: tx }, outcome_rx))
    }

    pub async fn enqueue(
        &self,
        player: PlayerId,
        skill_rating: u32,
        game_mode: GameMode,
    ) -> Result<(), MatchmakingError> {
        self.request(|reply| MatchmakerCommand::Enqueue {
            player,
            skill_rating,
            game_mode,
            reply,
        })
        .await?
    }

    pub async fn dequeue(&self, player: PlayerId) -> Result<QueueEntry, MatchmakingError> {
        self.request(|reply| MatchmakerCommand::Dequeue { player, reply })
            .await?
    }

    /// Returns a scanned entry to its queue with its original wait.
    pub async fn requeue(&self, entry: QueueEntry) -> Result<(), MatchmakingError> {
        self.request(|reply| MatchmakerCommand::Requeue { entry, reply })
            .await?
    }

    pub async fn queue_len(&self, game_mode: GameMode) -> Result<usize, MatchmakingError> {
        self.request(|reply| MatchmakerCommand::QueueLen { game_mode, reply })
            .await
    }

    pub async fn position(&self, player: PlayerId) -> Result<Option<usize>, MatchmakingError> {
        self.request(|reply| MatchmakerCommand::Position { player, reply })
            .await
    }

    /// Runs a scan immediately and returns its outcome directly rather
    /// than through the outcome channel.
    pub async fn scan_now(&self) -> Result<ScanOutcome, MatchmakingError> {
        self.request(|reply| MatchmakerCommand::ScanNow { reply })
            .await
    }

    /// Stops the actor. Queued players are discarded.
    pub async fn shutdown(&self) -> Result<(), MatchmakingError> {
        self.sender
            .send(MatchmakerCommand::Shutdown)
            .await
            .map_err(|_| MatchmakingError::Unavailable)
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> MatchmakerCommand,
    ) -> Result<R, MatchmakingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(command(reply_tx))
            .await
            .map_err(|_| MatchmakingError::Unavailable)?;
        reply_rx.await.map_err(|_| MatchmakingError::Unavailable)
    }
}

struct MatchmakerActor {
    engine: MatchmakingEngine,
    scan: TickScheduler,
    receiver: mpsc::Receiver<MatchmakerCommand>,
    outcomes: mpsc::UnboundedSender<ScanOutcome>,
}

impl MatchmakerActor {
    async fn run(mut self) {
        tracing::info!(
            interval_ms = self.scan.interval().as_millis() as u64,
            "matchmaker started"
        );

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle(cmd) {
                        break;
                    }
                }
                _ = self.scan.wait_for_tick() => {
                    let outcome = self.engine.scan(Instant::now());
                    self.scan.record_tick_end();
                    if !outcome.is_empty() && self.outcomes.send(outcome).is_err() {
                        tracing::warn!("scan outcome receiver dropped");
                    }
                }
            }
        }

        tracing::info!(queued = self.engine.len(), "matchmaker stopped");
    }

    /// Returns `false` when the actor should stop.
    fn handle(&mut self, cmd: MatchmakerCommand) -> bool {
        match cmd {
            MatchmakerCommand::Enqueue {
                player,
                skill_rating,
                game_mode,
                reply,
            } => {
                let result = self
                    .engine
                    .enqueue(player, skill_rating, game_mode, Instant::now());
                let _ = reply.send(result);
            }
            MatchmakerCommand::Dequeue { player, reply } => {
                let _ = reply.send(self.engine.dequeue(player));
            }
            MatchmakerCommand::Requeue { entry, reply } => {
                let _ = reply.send(self.engine.requeue(entry));
            }
            MatchmakerCommand::QueueLen { game_mode, reply } => {
                let _ = reply.send(self.engine.queue_len(&game_mode));
            }
            MatchmakerCommand::Position { player, reply } => {
                let _ = reply.send(self.engine.position(player));
            }
            MatchmakerCommand::ScanNow { reply } => {
                let _ = reply.send(self.engine.scan(Instant::now()));
            }
            MatchmakerCommand::Shutdown => return false,
        }
        true
    }
}
