//! Match actor: an isolated Tokio task that owns one match.
//!
//! Each match runs in its own task and is reached through a
//! [`MatchHandle`]. Updates to one match never wait on another. Status
//! changes, including the timer-driven ones (countdown, start timeout),
//! are reported as [`MatchTransition`]s on the channel handed in at spawn.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rallypoint_protocol::{GameMode, MatchId, PlayerId, RoomId, now_millis};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

use crate::{MatchStatus, SyncError};

pub const REASON_START_TIMEOUT: &str = "start_timeout";
pub const REASON_ABANDONED: &str = "abandoned";

/// One entry in a match's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchEvent {
    /// Strictly increasing within the match, starting at 1.
    pub sequence: u64,
    pub player: Option<PlayerId>,
    pub kind: String,
    pub data: Map<String, Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A snapshot of match state.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchInfo {
    pub id: MatchId,
    pub status: MatchStatus,
    pub game_mode: GameMode,
    pub room: Option<RoomId>,
    pub players: Vec<PlayerId>,
    pub acknowledged: Vec<PlayerId>,
    pub game_state: Map<String, Value>,
    pub scores: HashMap<PlayerId, i64>,
    pub event_count: usize,
}

/// A status change, reported by the actor as it happens.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchTransition {
    pub match_id: MatchId,
    pub status: MatchStatus,
    pub players: Vec<PlayerId>,
    pub room: Option<RoomId>,
    pub reason: Option<String>,
    pub scores: HashMap<PlayerId, i64>,
}

/// Everything a new match actor needs.
#[derive(Debug, Clone)]
pub(crate) struct MatchSetup {
    pub(crate) id: MatchId,
    pub(crate) players: Vec<PlayerId>,
    pub(crate) game_mode: GameMode,
    pub(crate) room: Option<RoomId>,
    pub(crate) min_players: usize,
    pub(crate) countdown: Duration,
    pub(crate) start_timeout: Duration,
    pub(crate) channel_size: usize,
}

/// Commands sent to a match actor. Variants carrying a `reply` are
/// request/response; the rest are fire-and-forget.
enum MatchCommand {
    Acknowledge {
        player: PlayerId,
        reply: oneshot::Sender<Result<MatchStatus, SyncError>>,
    },
    ApplyAction {
        player: PlayerId,
        kind: String,
        data: Map<String, Value>,
        reply: oneshot::Sender<Result<MatchEvent, SyncError>>,
    },
    Leave {
        player: PlayerId,
        reply: oneshot::Sender<Result<MatchStatus, SyncError>>,
    },
    Finish {
        reason: Option<String>,
        reply: oneshot::Sender<Result<MatchInfo, SyncError>>,
    },
    Cancel {
        reason: String,
        reply: oneshot::Sender<Result<MatchInfo, SyncError>>,
    },
    GetInfo {
        reply: oneshot::Sender<MatchInfo>,
    },
    Events {
        since: u64,
        reply: oneshot::Sender<Vec<MatchEvent>>,
    },
    Shutdown,
}

/// Handle to a running match actor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MatchHandle {
    id: MatchId,
    sender: mpsc::Sender<MatchCommand>,
}

impl MatchHandle {
    pub fn id(&self) -> MatchId {
        self.id
    }

    /// Marks `player` ready. Returns the status afterwards.
    pub async fn acknowledge(&self, player: PlayerId) -> Result<MatchStatus, SyncError> {
        self.request(|reply| MatchCommand::Acknowledge { player, reply })
            .await?
    }

    /// Applies an already validated action and logs it.
    pub async fn apply_action(
        &self,
        player: PlayerId,
        kind: impl Into<String>,
        data: Map<String, Value>,
    ) -> Result<MatchEvent, SyncError> {
        let kind = kind.into();
        self.request(|reply| MatchCommand::ApplyAction {
            player,
            kind,
            data,
            reply,
        })
        .await?
    }

    /// Removes `player` (abandon). Returns the status afterwards.
    pub async fn leave(&self, player: PlayerId) -> Result<MatchStatus, SyncError> {
        self.request(|reply| MatchCommand::Leave { player, reply })
            .await?
    }

    pub async fn finish(&self, reason: Option<String>) -> Result<MatchInfo, SyncError> {
        self.request(|reply| MatchCommand::Finish { reason, reply })
            .await?
    }

    pub async fn cancel(&self, reason: impl Into<String>) -> Result<MatchInfo, SyncError> {
        let reason = reason.into();
        self.request(|reply| MatchCommand::Cancel { reason, reply })
            .await?
    }

    pub async fn info(&self) -> Result<MatchInfo, SyncError> {
        self.request(|reply| MatchCommand::GetInfo { reply }).await
    }

    /// Log entries with a sequence greater than `since`.
    pub async fn events_since(&self, since: u64) -> Result<Vec<MatchEvent>, SyncError> {
        self.request(|reply| MatchCommand::Events { since, reply })
            .await
    }

    /// Stops the actor (fire-and-forget).
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.sender
            .send(MatchCommand::Shutdown)
            .await
            .map_err(|_| SyncError::Unavailable(self.id))
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> MatchCommand,
    ) -> Result<R, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(command(reply_tx))
            .await
            .map_err(|_| SyncError::Unavailable(self.id))?;
        reply_rx.await.map_err(|_| SyncError::Unavailable(self.id))
    }
}

/// The internal match state. Runs inside a Tokio task.
struct MatchActor {
    id: MatchId,
    status: MatchStatus,
    game_mode: GameMode,
    room: Option<RoomId>,
    players: Vec<PlayerId>,
    acknowledged: HashSet<PlayerId>,
    min_players: usize,
    game_state: Map<String, Value>,
    scores: HashMap<PlayerId, i64>,
    events: Vec<MatchEvent>,
    countdown: Duration,
    countdown_deadline: Option<Instant>,
    start_deadline: Instant,
    receiver: mpsc::Receiver<MatchCommand>,
    transitions: mpsc::UnboundedSender<MatchTransition>,
}

impl MatchActor {
    /// Runs the actor loop until shutdown or until every handle is gone.
    async fn run(mut self) {
        tracing::info!(match_id = %self.id, players = self.players.len(), "match actor started");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    None | Some(MatchCommand::Shutdown) => break,
                    Some(cmd) => self.handle(cmd),
                },
                _ = sleep_until(deadline) => self.on_timer(Instant::now()),
            }
        }

        tracing::info!(match_id = %self.id, status = %self.status, "match actor stopped");
    }

    fn handle(&mut self, cmd: MatchCommand) {
        match cmd {
            MatchCommand::Acknowledge { player, reply } => {
                let _ = reply.send(self.handle_acknowledge(player));
            }
            MatchCommand::ApplyAction {
                player,
                kind,
                data,
                reply,
            } => {
                let _ = reply.send(self.handle_action(player, kind, data));
            }
            MatchCommand::Leave { player, reply } => {
                let _ = reply.send(self.handle_leave(player));
            }
            MatchCommand::Finish { reason, reply } => {
                let result = if self.status == MatchStatus::InProgress {
                    self.transition(MatchStatus::Finished, reason);
                    Ok(self.info())
                } else {
                    Err(self.invalid_state("only a live match can finish"))
                };
                let _ = reply.send(result);
            }
            MatchCommand::Cancel { reason, reply } => {
                let result = if self.status.is_pending() {
                    self.transition(MatchStatus::Cancelled, Some(reason));
                    Ok(self.info())
                } else {
                    Err(self.invalid_state("only a pending match can be cancelled"))
                };
                let _ = reply.send(result);
            }
            MatchCommand::GetInfo { reply } => {
                let _ = reply.send(self.info());
            }
            MatchCommand::Events { since, reply } => {
                let events = self
                    .events
                    .iter()
                    .filter(|e| e.sequence > since)
                    .cloned()
                    .collect();
                let _ = reply.send(events);
            }
            MatchCommand::Shutdown => {}
        }
    }

    fn handle_acknowledge(&mut self, player: PlayerId) -> Result<MatchStatus, SyncError> {
        if !self.players.contains(&player) {
            return Err(SyncError::NotInMatch(player, self.id));
        }
        if self.status != MatchStatus::Waiting {
            return Ok(self.status);
        }
        self.acknowledged.insert(player);
        tracing::debug!(
            match_id = %self.id,
            %player,
            ready = self.acknowledged.len(),
            of = self.players.len(),
            "player acknowledged"
        );
        if self.acknowledged.len() == self.players.len() {
            self.countdown_deadline = Some(Instant::now() + self.countdown);
            self.transition(MatchStatus::Starting, None);
        }
        Ok(self.status)
    }

    fn handle_action(
        &mut self,
        player: PlayerId,
        kind: String,
        data: Map<String, Value>,
    ) -> Result<MatchEvent, SyncError> {
        if self.status != MatchStatus::InProgress {
            return Err(self.invalid_state("match is not live"));
        }
        if !self.players.contains(&player) {
            return Err(SyncError::NotInMatch(player, self.id));
        }

        if let Some(points) = data.get("points").and_then(Value::as_i64) {
            *self.scores.entry(player).or_insert(0) += points;
        }
        if let Some(position) = data.get("position") {
            let positions = self
                .game_state
                .entry("positions")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(positions) = positions {
                positions.insert(player.0.to_string(), position.clone());
            }
        }
        if let Some(Value::Object(state)) = data.get("state") {
            for (key, value) in state {
                self.game_state.insert(key.clone(), value.clone());
            }
        }

        Ok(self.log(Some(player), kind, data))
    }

    fn handle_leave(&mut self, player: PlayerId) -> Result<MatchStatus, SyncError> {
        let Some(index) = self.players.iter().position(|p| *p == player) else {
            return Err(SyncError::NotInMatch(player, self.id));
        };
        self.players.remove(index);
        self.acknowledged.remove(&player);
        self.log(Some(player), "player_left".to_string(), Map::new());

        if self.status.is_pending() {
            self.transition(MatchStatus::Cancelled, Some(REASON_ABANDONED.to_string()));
        } else if self.status == MatchStatus::InProgress && self.players.len() < self.min_players {
            self.transition(MatchStatus::Finished, Some(REASON_ABANDONED.to_string()));
        }
        Ok(self.status)
    }

    fn on_timer(&mut self, now: Instant) {
        if self.status == MatchStatus::Starting
            && self.countdown_deadline.is_some_and(|at| now >= at)
        {
            self.countdown_deadline = None;
            self.transition(MatchStatus::InProgress, None);
        } else if self.status.is_pending() && now >= self.start_deadline {
            tracing::warn!(match_id = %self.id, status = %self.status, "match did not start in time");
            self.transition(MatchStatus::Cancelled, Some(REASON_START_TIMEOUT.to_string()));
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match self.status {
            MatchStatus::Waiting => Some(self.start_deadline),
            MatchStatus::Starting => Some(
                self.countdown_deadline
                    .map_or(self.start_deadline, |at| at.min(self.start_deadline)),
            ),
            _ => None,
        }
    }

    fn transition(&mut self, to: MatchStatus, reason: Option<String>) {
        if !self.status.can_transition_to(to) {
            tracing::warn!(match_id = %self.id, from = %self.status, %to, "ignored invalid match transition");
            return;
        }
        let from = self.status;
        self.status = to;
        tracing::info!(match_id = %self.id, %from, %to, reason = reason.as_deref().unwrap_or(""), "match status changed");

        let mut data = Map::new();
        data.insert("status".into(), Value::String(to.as_str().into()));
        if let Some(reason) = &reason {
            data.insert("reason".into(), Value::String(reason.clone()));
        }
        self.log(None, "status".to_string(), data);

        let transition = MatchTransition {
            match_id: self.id,
            status: to,
            players: self.players.clone(),
            room: self.room,
            reason,
            scores: self.scores.clone(),
        };
        if self.transitions.send(transition).is_err() {
            tracing::debug!(match_id = %self.id, "transition receiver dropped");
        }
    }

    fn log(&mut self, player: Option<PlayerId>, kind: String, data: Map<String, Value>) -> MatchEvent {
        let event = MatchEvent {
            sequence: self.events.len() as u64 + 1,
            player,
            kind,
            data,
            timestamp: now_millis(),
        };
        self.events.push(event.clone());
        event
    }

    fn invalid_state(&self, reason: &'static str) -> SyncError {
        SyncError::InvalidMatchState {
            id: self.id,
            status: self.status,
            reason,
        }
    }

    fn info(&self) -> MatchInfo {
        MatchInfo {
            id: self.id,
            status: self.status,
            game_mode: self.game_mode.clone(),
            room: self.room,
            players: self.players.clone(),
            acknowledged: self
                .players
                .iter()
                .copied()
                .filter(|p| self.acknowledged.contains(p))
                .collect(),
            game_state: self.game_state.clone(),
            scores: self.scores.clone(),
            event_count: self.events.len(),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Spawns a match actor task and returns a handle to it.
pub(crate) fn spawn_match(
    setup: MatchSetup,
    transitions: mpsc::UnboundedSender<MatchTransition>,
) -> MatchHandle {
    let (tx, rx) = mpsc::channel(setup.channel_size);
    let scores = setup.players.iter().map(|p| (*p, 0)).collect();

    let actor = MatchActor {
        id: setup.id,
        status: MatchStatus::Waiting,
        game_mode: setup.game_mode,
        room: setup.room,
        players: setup.players,
        acknowledged: HashSet::new(),
        min_players: setup.min_players,
        game_state: Map::new(),
        scores,
        events: Vec::new(),
        countdown: setup.countdown,
        countdown_deadline: None,
        start_deadline: Instant::now() + setup.start_timeout,
        receiver: rx,
        transitions,
    };
    tokio::spawn(actor.run());

    MatchHandle {
        id: setup.id,
        sender: tx,
    }
}
