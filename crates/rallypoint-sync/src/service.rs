//! The real-time sync service: players, rooms and matches in one place.
//!
//! State lives in arenas keyed by id. Players and rooms sit behind their
//! own mutex each, so work on one entity never waits on another. Matches
//! are actors (see [`crate::game_match`]) reached by handle. There is no
//! lock spanning the whole service.
//!
//! Lock order where two are taken together: room, then player. Several
//! players are always locked in ascending id order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use rallypoint_anticheat::{ACTION_MOVE, AntiCheatValidator};
use rallypoint_matchmaking::{Matchmaker, MatchmakingError, QueueEntry, ScanOutcome};
use rallypoint_optimizer::{NetworkMessage, Priority, TransportOptimizer};
use rallypoint_prediction::{LagCompensator, PredictionConfig, Reconciliation};
use rallypoint_protocol::{
    Channel, Codec, GameMode, JsonCodec, MatchId, PlayerId, RoomId, SyncEventType, SyncMessage,
    Transform, Vec3, now_millis,
};
use rallypoint_tick::{Shutdown, ShutdownSignal, TickConfig, TickScheduler};
use rallypoint_transport::{Method, Transport};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::game_match::{MatchEvent, MatchHandle, MatchInfo, MatchSetup, MatchTransition, spawn_match};
use crate::lobby::{LeaveOutcome, Room};
use crate::player::{Player, PlayerEntry};
use crate::{MatchStatus, PlayerStatus, RoomStatus, SyncConfig, SyncError};

/// Reason attached to the `player_state` event of a dropped queue entry.
pub const REASON_MATCHMAKING_TIMEOUT: &str = "matchmaking_timeout";

/// A position report from a player's client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InboundUpdate {
    pub player: PlayerId,
    /// Per-player, strictly increasing. Stale or repeated values are dropped.
    pub sequence: u64,
    pub transform: Transform,
}

/// Services the sync layer drives. Built once by the application root.
pub struct Collaborators<T: Transport> {
    pub optimizer: TransportOptimizer<T>,
    pub matchmaker: Matchmaker,
    /// Outcomes of the matchmaker's periodic scans.
    pub scan_outcomes: mpsc::UnboundedReceiver<ScanOutcome>,
    pub validator: Arc<AntiCheatValidator>,
    pub prediction: PredictionConfig,
}

/// Receivers consumed by the driver task once it starts.
struct DriverParts {
    inbound: mpsc::Receiver<InboundUpdate>,
    transitions: mpsc::UnboundedReceiver<MatchTransition>,
    scans: mpsc::UnboundedReceiver<ScanOutcome>,
}

struct Inner<T: Transport> {
    config: SyncConfig,
    prediction: PredictionConfig,
    optimizer: TransportOptimizer<T>,
    matchmaker: Matchmaker,
    validator: Arc<AntiCheatValidator>,
    lag: LagCompensator,
    codec: JsonCodec,

    players: RwLock<HashMap<PlayerId, Arc<Mutex<PlayerEntry>>>>,
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>,
    matches: RwLock<HashMap<MatchId, MatchHandle>>,
    next_room: AtomicU64,
    next_match: AtomicU64,

    events: broadcast::Sender<SyncMessage>,
    inbound: mpsc::Sender<InboundUpdate>,
    transitions: mpsc::UnboundedSender<MatchTransition>,
    driver: Mutex<Option<DriverParts>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Shutdown,
}

/// Owns player, room and match state and publishes every change.
///
/// Cheap to clone; clones share the same state. Call [`start`](Self::start)
/// once to run the publish loop and to react to match and matchmaking
/// events, and [`shutdown`](Self::shutdown) to stop.
pub struct RealtimeSyncService<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for RealtimeSyncService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> std::fmt::Debug for RealtimeSyncService<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSyncService")
            .field("players", &read(&self.inner.players).len())
            .field("rooms", &read(&self.inner.rooms).len())
            .field("matches", &read(&self.inner.matches).len())
            .finish()
    }
}

impl<T: Transport> RealtimeSyncService<T> {
    pub fn new(config: SyncConfig, collaborators: Collaborators<T>) -> Result<Self, SyncError> {
        config.validate()?;
        collaborators.prediction.validate()?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_channel_size);
        let (transitions_tx, transitions_rx) = mpsc::unbounded_channel();

        let inner = Inner {
            lag: LagCompensator::new(collaborators.prediction.compensation.clone()),
            prediction: collaborators.prediction,
            optimizer: collaborators.optimizer,
            matchmaker: collaborators.matchmaker,
            validator: collaborators.validator,
            codec: JsonCodec,
            players: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            matches: RwLock::new(HashMap::new()),
            next_room: AtomicU64::new(1),
            next_match: AtomicU64::new(1),
            events,
            inbound: inbound_tx,
            transitions: transitions_tx,
            driver: Mutex::new(Some(DriverParts {
                inbound: inbound_rx,
                transitions: transitions_rx,
                scans: collaborators.scan_outcomes,
            })),
            task: Mutex::new(None),
            shutdown: Shutdown::new(),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Spawns the driver task: publish loop, inbound updates, match
    /// transitions and matchmaking outcomes.
    pub fn start(&self) -> Result<(), SyncError> {
        let parts = lock(&self.inner.driver)
            .take()
            .ok_or(SyncError::Lifecycle("already started"))?;
        if self.inner.shutdown.is_triggered() {
            return Err(SyncError::Lifecycle("shut down"));
        }
        let task = tokio::spawn(drive(
            Arc::downgrade(&self.inner),
            parts,
            self.inner.shutdown.signal(),
            TickConfig::every(self.inner.config.publish_interval)
                .with_jitter(self.inner.config.publish_jitter),
        ));
        *lock(&self.inner.task) = Some(task);
        tracing::info!(
            publish_interval_ms = self.inner.config.publish_interval.as_millis() as u64,
            "sync service started"
        );
        Ok(())
    }

    /// Stops the driver, the matchmaker and every match, then flushes the
    /// optimizer.
    pub async fn shutdown(&self) {
        self.inner.shutdown.trigger();
        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let _ = self.inner.matchmaker.shutdown().await;

        let handles: Vec<MatchHandle> = write(&self.inner.matches).drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.shutdown().await;
        }
        self.inner.optimizer.shutdown().await;
        tracing::info!("sync service stopped");
    }

    // -- players --------------------------------------------------------

    /// Brings a player online. A player that went offline earlier starts
    /// over with a fresh record.
    pub fn connect_player(
        &self,
        id: PlayerId,
        display_name: impl Into<String>,
        skill_rating: u32,
    ) -> Result<Player, SyncError> {
        let entry = PlayerEntry::new(
            id,
            display_name.into(),
            skill_rating,
            &self.inner.prediction,
            self.inner.config.history_capacity,
        )?;
        let snapshot = entry.player.clone();
        {
            let mut players = write(&self.inner.players);
            if let Some(existing) = players.get(&id) {
                if lock(existing).player.status != PlayerStatus::Offline {
                    return Err(SyncError::AlreadyConnected(id));
                }
            }
            players.insert(id, Arc::new(Mutex::new(entry)));
        }
        tracing::info!(player_id = %id, skill_rating, "player connected");
        self.publish(player_state(&snapshot));
        Ok(snapshot)
    }

    /// Takes a player offline: out of the queue, the match and the room.
    pub async fn disconnect_player(&self, id: PlayerId) -> Result<(), SyncError> {
        let (status, room, current_match) = {
            let entry = self.entry(id)?;
            let e = lock(&entry);
            (e.player.status, e.player.room, e.player.current_match)
        };
        if status == PlayerStatus::Offline {
            return Err(SyncError::InvalidPlayerTransition {
                player: id,
                from: status,
                to: PlayerStatus::Offline,
            });
        }

        self.withdraw_from_queue(id).await;
        if current_match.is_some() {
            if let Err(err) = self.leave_match(id).await {
                tracing::debug!(player_id = %id, error = %err, "match leave on disconnect failed");
            }
        }
        if room.is_some() {
            self.leave_room(id)?;
        }

        let snapshot = self.update_player(id, |e| {
            e.player.spectating = None;
            e.player.is_host = false;
            e.player.current_match = None;
            e.transition(PlayerStatus::Offline)
        })?;
        tracing::info!(player_id = %id, "player disconnected");
        self.publish(player_state(&snapshot));
        Ok(())
    }

    /// Stores a measured round trip for `id`.
    pub fn record_ping(&self, id: PlayerId, ping: Duration) -> Result<(), SyncError> {
        let snapshot = self.update_player(id, |e| {
            e.player.ping = Some(ping);
            e.touch();
            Ok(())
        })?;
        self.publish(player_state(&snapshot));
        Ok(())
    }

    pub fn player(&self, id: PlayerId) -> Option<Player> {
        let entry = read(&self.inner.players).get(&id).cloned()?;
        let player = lock(&entry).player.clone();
        Some(player)
    }

    /// Players not currently offline.
    pub fn online_players(&self) -> usize {
        let entries: Vec<_> = read(&self.inner.players).values().cloned().collect();
        entries
            .iter()
            .filter(|e| lock(e).player.status != PlayerStatus::Offline)
            .count()
    }

    // -- rooms ----------------------------------------------------------

    /// Opens a room with `host` as its first member.
    pub fn create_room(
        &self,
        host: PlayerId,
        capacity: Option<usize>,
        game_mode: GameMode,
    ) -> Result<Room, SyncError> {
        let capacity = capacity.unwrap_or(self.inner.config.default_room_capacity);
        if capacity < self.inner.config.min_match_players {
            return Err(SyncError::InvalidRequest(format!(
                "room capacity {capacity} cannot hold a match"
            )));
        }

        let id = RoomId(self.inner.next_room.fetch_add(1, Ordering::Relaxed));
        let room = Room::new(id, host, capacity, game_mode);
        let host_snapshot = self.update_player(host, |e| {
            ensure_free(e)?;
            e.transition(PlayerStatus::InLobby)?;
            e.player.room = Some(id);
            e.player.is_host = true;
            Ok(())
        })?;
        write(&self.inner.rooms).insert(id, Arc::new(Mutex::new(room.clone())));

        tracing::info!(room_id = %id, %host, capacity, game_mode = %room.game_mode, "room created");
        self.publish(room_update(&room));
        self.publish(player_state(&host_snapshot));
        Ok(room)
    }

    pub fn join_room(&self, player: PlayerId, room_id: RoomId) -> Result<Room, SyncError> {
        let room_entry = self.room_entry(room_id)?;
        let player_entry = self.entry(player)?;

        let (room, snapshot) = {
            let mut room = lock(&room_entry);
            let mut e = lock(&player_entry);
            ensure_free(&e)?;
            if !e.player.status.can_transition_to(PlayerStatus::InLobby) {
                return Err(SyncError::InvalidPlayerTransition {
                    player,
                    from: e.player.status,
                    to: PlayerStatus::InLobby,
                });
            }
            room.add_member(player)?;
            e.transition(PlayerStatus::InLobby)?;
            e.player.room = Some(room_id);
            e.player.is_host = false;
            e.touch();
            (room.clone(), e.player.clone())
        };

        tracing::debug!(%room_id, %player, members = room.members.len(), "player joined room");
        self.publish(room_update(&room));
        self.publish(player_state(&snapshot));
        Ok(room)
    }

    /// Removes `player` from their room. The host role passes to the next
    /// member by join order; an emptied room is discarded.
    pub fn leave_room(&self, player: PlayerId) -> Result<LeaveOutcome, SyncError> {
        let room_id = {
            let entry = self.entry(player)?;
            let room = lock(&entry).player.room;
            room.ok_or(SyncError::NotInRoom(player))?
        };
        let room_entry = self.room_entry(room_id)?;
        let player_entry = self.entry(player)?;

        let (outcome, room, snapshot) = {
            let mut room = lock(&room_entry);
            let outcome = room.remove_member(player)?;
            let mut e = lock(&player_entry);
            e.player.room = None;
            e.player.is_host = false;
            if e.player.status == PlayerStatus::InLobby {
                e.transition(PlayerStatus::Online)?;
            }
            (outcome, room.clone(), e.player.clone())
        };

        let mut new_host_state = None;
        match outcome {
            LeaveOutcome::Left => {
                tracing::debug!(%room_id, %player, "player left room");
            }
            LeaveOutcome::HostChanged { new_host } => {
                new_host_state = self
                    .update_player(new_host, |e| {
                        e.player.is_host = true;
                        Ok(())
                    })
                    .ok();
                tracing::info!(%room_id, old_host = %player, %new_host, "room host handed off");
            }
            LeaveOutcome::Emptied => {
                write(&self.inner.rooms).remove(&room_id);
                tracing::info!(%room_id, "room discarded");
            }
        }

        let update = room_update(&room).with("discarded", outcome == LeaveOutcome::Emptied);
        self.publish(update);
        self.publish(player_state(&snapshot));
        if let Some(host) = new_host_state {
            self.publish(player_state(&host));
        }
        Ok(outcome)
    }

    pub fn room(&self, id: RoomId) -> Option<Room> {
        let entry = read(&self.inner.rooms).get(&id).cloned()?;
        let room = lock(&entry).clone();
        Some(room)
    }

    /// Forms a match from a waiting room's members. Host only.
    pub async fn start_room_match(&self, room_id: RoomId, host: PlayerId) -> Result<MatchId, SyncError> {
        let room_entry = self.room_entry(room_id)?;
        let (members, game_mode) = {
            let mut room = lock(&room_entry);
            if room.host != host {
                return Err(SyncError::NotHost(host, room_id));
            }
            if room.status != RoomStatus::Waiting {
                return Err(SyncError::RoomClosed(room_id));
            }
            if room.members.len() < self.inner.config.min_match_players {
                return Err(SyncError::InvalidRequest(format!(
                    "room {room_id} needs at least {} members",
                    self.inner.config.min_match_players
                )));
            }
            room.set_status(RoomStatus::Starting);
            (room.members.clone(), room.game_mode.clone())
        };

        match self.open_match(members, game_mode, Some(room_id)).await {
            Ok(match_id) => {
                let room = {
                    let mut room = lock(&room_entry);
                    room.current_match = Some(match_id);
                    room.clone()
                };
                self.publish(room_update(&room));
                Ok(match_id)
            }
            Err(err) => {
                lock(&room_entry).set_status(RoomStatus::Waiting);
                Err(err)
            }
        }
    }

    // -- matchmaking ----------------------------------------------------

    /// Puts an idle player in the matchmaking queue for `game_mode`.
    pub async fn queue_for_match(&self, player: PlayerId, game_mode: GameMode) -> Result<(), SyncError> {
        let rating = {
            let entry = self.entry(player)?;
            let e = lock(&entry);
            ensure_free(&e)?;
            if !matches!(e.player.status, PlayerStatus::Online | PlayerStatus::InLobby) {
                return Err(SyncError::InvalidPlayerTransition {
                    player,
                    from: e.player.status,
                    to: PlayerStatus::InMatch,
                });
            }
            e.player.skill_rating
        };
        self.inner
            .matchmaker
            .enqueue(player, rating, game_mode.clone())
            .await?;
        tracing::debug!(%player, %game_mode, rating, "player queued");
        Ok(())
    }

    pub async fn leave_queue(&self, player: PlayerId) -> Result<(), SyncError> {
        self.inner.matchmaker.dequeue(player).await?;
        Ok(())
    }

    /// Opens a match for every formed group and tells timed-out players.
    pub async fn handle_scan_outcome(&self, outcome: ScanOutcome) {
        for error in outcome.timeout_errors(Instant::now()) {
            if let MatchmakingError::Timeout { player, waited } = error {
                tracing::warn!(%player, waited_ms = waited.as_millis() as u64, "matchmaking timed out");
                let message = SyncMessage::new(SyncEventType::PlayerState, now_millis())
                    .with("player_id", player)
                    .with("reason", REASON_MATCHMAKING_TIMEOUT)
                    .with("waited_ms", waited.as_millis() as u64);
                self.publish(message);
            }
        }
        for formed in outcome.matches {
            let players = formed.player_ids();
            if let Err(err) = self.open_match(players.clone(), formed.game_mode, None).await {
                tracing::warn!(?players, error = %err, "could not open matchmade match");
                self.requeue_free(formed.players).await;
            }
        }
    }

    /// Puts the members of a group that failed to start back in line,
    /// skipping anyone who has since been claimed elsewhere.
    async fn requeue_free(&self, entries: Vec<QueueEntry>) {
        for entry in entries {
            let player = entry.player;
            if !self.is_claimable(player) {
                continue;
            }
            match self.inner.matchmaker.requeue(entry).await {
                Ok(()) => tracing::debug!(%player, "player requeued"),
                Err(err) => tracing::warn!(%player, error = %err, "requeue failed"),
            }
        }
    }

    // -- matches --------------------------------------------------------

    /// Creates a match for `players` outside any room.
    pub async fn create_match(&self, players: Vec<PlayerId>, game_mode: GameMode) -> Result<MatchId, SyncError> {
        self.open_match(players, game_mode, None).await
    }

    /// Marks `player` ready for their pending match.
    pub async fn acknowledge_match(&self, player: PlayerId) -> Result<MatchStatus, SyncError> {
        let handle = self.player_match(player)?;
        handle.acknowledge(player).await
    }

    /// Abandons the player's match. A pending match is cancelled; a live
    /// one ends once too few players remain.
    pub async fn leave_match(&self, player: PlayerId) -> Result<MatchStatus, SyncError> {
        let handle = self.player_match(player)?;
        let status = handle.leave(player).await?;
        let snapshot = self.update_player(player, |e| {
            e.player.current_match = None;
            if e.player.status == PlayerStatus::InMatch {
                let resting = e.resting_status();
                e.transition(resting)?;
            }
            Ok(())
        })?;
        tracing::info!(%player, match_id = %handle.id(), "player left match");
        self.publish(player_state(&snapshot));
        Ok(status)
    }

    pub async fn finish_match(&self, id: MatchId, reason: Option<String>) -> Result<MatchInfo, SyncError> {
        self.match_handle(id)?.finish(reason).await
    }

    pub async fn cancel_match(&self, id: MatchId, reason: impl Into<String>) -> Result<MatchInfo, SyncError> {
        self.match_handle(id)?.cancel(reason).await
    }

    pub async fn match_info(&self, id: MatchId) -> Result<MatchInfo, SyncError> {
        self.match_handle(id)?.info().await
    }

    pub async fn match_events(&self, id: MatchId, since: u64) -> Result<Vec<MatchEvent>, SyncError> {
        self.match_handle(id)?.events_since(since).await
    }

    pub fn active_matches(&self) -> Vec<MatchId> {
        let mut ids: Vec<_> = read(&self.inner.matches).keys().copied().collect();
        ids.sort_by_key(|id| id.0);
        ids
    }

    /// Watches a match that has not ended.
    pub async fn spectate(&self, player: PlayerId, match_id: MatchId) -> Result<(), SyncError> {
        let info = self.match_info(match_id).await?;
        if info.status.is_terminal() {
            return Err(SyncError::InvalidMatchState {
                id: match_id,
                status: info.status,
                reason: "match is over",
            });
        }
        let snapshot = self.update_player(player, |e| {
            ensure_free(e)?;
            e.transition(PlayerStatus::Spectating)?;
            e.player.spectating = Some(match_id);
            Ok(())
        })?;
        self.withdraw_from_queue(player).await;
        tracing::debug!(%player, %match_id, "player spectating");
        self.publish(player_state(&snapshot).with("spectating", match_id));
        Ok(())
    }

    pub fn stop_spectating(&self, player: PlayerId) -> Result<(), SyncError> {
        let snapshot = self.update_player(player, |e| {
            if e.player.status != PlayerStatus::Spectating {
                return Err(SyncError::InvalidRequest(format!("player {player} is not spectating")));
            }
            e.player.spectating = None;
            let resting = e.resting_status();
            e.transition(resting)
        })?;
        self.publish(player_state(&snapshot));
        Ok(())
    }

    // -- actions --------------------------------------------------------

    /// Validates and applies one gameplay action.
    ///
    /// The action is checked against where the player was one compensation
    /// interval ago. A rejected action changes nothing and comes back as
    /// [`SyncError::ActionRejected`]. A `move` carrying a `sequence` is
    /// also recorded as a prediction step awaiting
    /// [`confirm_action`](Self::confirm_action).
    pub async fn submit_action(
        &self,
        player: PlayerId,
        action_type: &str,
        mut data: Map<String, Value>,
    ) -> Result<MatchEvent, SyncError> {
        let (match_id, reference, current) = self.action_context(player, action_type)?;

        let verdict = self
            .inner
            .validator
            .validate(player, action_type, &data, Some(reference.position));
        if let Some(reason) = verdict.reason {
            return Err(SyncError::ActionRejected { reason });
        }
        let handle = self.match_handle(match_id)?;

        let moved_to = if action_type == ACTION_MOVE {
            let target = resolve_move(&data, current)?;
            data.insert("position".into(), to_value(target.position));
            let sequence = data.get("sequence").and_then(Value::as_u64);
            if let Some(sequence) = sequence {
                let entry = self.entry(player)?;
                lock(&entry).prediction.check_sequence(sequence)?;
            }
            Some((target, sequence))
        } else {
            None
        };

        let event = handle.apply_action(player, action_type, data).await?;

        // Only an applied move becomes a prediction step.
        if let Some((target, sequence)) = moved_to {
            self.update_player(player, |e| {
                if let Some(sequence) = sequence {
                    if let Err(err) = e.prediction.add_step(sequence, target) {
                        tracing::warn!(%player, sequence, error = %err, "prediction step dropped");
                    }
                }
                e.set_transform(target);
                Ok(())
            })?;
        }
        let message = SyncMessage::new(SyncEventType::GameEvent, event.timestamp)
            .with("match_id", match_id)
            .with("player_id", player)
            .with("action", action_type)
            .with("sequence", event.sequence)
            .with("data", &event.data);
        self.publish(message);
        Ok(event)
    }

    /// Applies the server's verdict on a predicted move.
    pub fn confirm_action(
        &self,
        player: PlayerId,
        sequence: u64,
        confirmed: Transform,
    ) -> Result<Reconciliation<Transform>, SyncError> {
        let entry = self.entry(player)?;
        let (result, snapshot) = {
            let mut e = lock(&entry);
            let result = e.prediction.confirm_step(sequence, confirmed);
            match &result {
                Reconciliation::Corrected(state) => e.set_transform(*state),
                Reconciliation::Unknown => e.set_transform(confirmed),
                Reconciliation::Matched | Reconciliation::Stale => {}
            }
            (result, e.player.clone())
        };
        if let Reconciliation::Corrected(_) = result {
            tracing::debug!(%player, sequence, "prediction corrected");
            self.publish(player_update(&snapshot, Some(sequence)));
        }
        Ok(result)
    }

    /// Unconfirmed predicted moves of `player`, by sequence.
    pub fn pending_predictions(&self, player: PlayerId) -> Result<Vec<u64>, SyncError> {
        let entry = self.entry(player)?;
        let e = lock(&entry);
        Ok(e.prediction.pending_steps().iter().map(|s| s.sequence).collect())
    }

    // -- inbound & publishing -------------------------------------------

    /// Applies a client position report, last write wins. Returns `false`
    /// when the update was stale, repeated, or for an unknown player.
    pub fn apply_inbound_update(&self, update: InboundUpdate) -> bool {
        let Ok(entry) = self.entry(update.player) else {
            return false;
        };
        let mut e = lock(&entry);
        if e.player.status == PlayerStatus::Offline {
            return false;
        }
        if !e.inbound.accept(update.sequence) {
            tracing::trace!(player_id = %update.player, sequence = update.sequence, "stale update dropped");
            return false;
        }
        e.set_transform(update.transform);
        e.touch();
        true
    }

    /// Queue for inbound updates, drained by the driver task.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundUpdate> {
        self.inner.inbound.clone()
    }

    /// One publish interval: a `player_update` per in-match player.
    pub fn publish_tick(&self) -> usize {
        let entries: Vec<_> = read(&self.inner.players).values().cloned().collect();
        let updates: Vec<SyncMessage> = entries
            .iter()
            .filter_map(|entry| {
                let e = lock(entry);
                (e.player.status == PlayerStatus::InMatch)
                    .then(|| player_update(&e.player, e.inbound.last_applied()))
            })
            .collect();
        let count = updates.len();
        for update in updates {
            self.publish(update);
        }
        tracing::trace!(count, "published positions");
        count
    }

    /// Every outbound event, as it is published.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn optimizer(&self) -> &TransportOptimizer<T> {
        &self.inner.optimizer
    }

    pub fn validator(&self) -> &Arc<AntiCheatValidator> {
        &self.inner.validator
    }

    pub fn matchmaker(&self) -> &Matchmaker {
        &self.inner.matchmaker
    }

    // -- internals ------------------------------------------------------

    async fn open_match(
        &self,
        players: Vec<PlayerId>,
        game_mode: GameMode,
        room: Option<RoomId>,
    ) -> Result<MatchId, SyncError> {
        let config = &self.inner.config;
        if players.len() < config.min_match_players || players.len() > config.max_match_players {
            return Err(SyncError::InvalidRequest(format!(
                "a match takes {} to {} players, got {}",
                config.min_match_players,
                config.max_match_players,
                players.len()
            )));
        }
        let id = MatchId(self.inner.next_match.fetch_add(1, Ordering::Relaxed));
        self.claim_players(&players, id)?;
        for player in &players {
            self.withdraw_from_queue(*player).await;
        }

        let handle = spawn_match(
            MatchSetup {
                id,
                players: players.clone(),
                game_mode: game_mode.clone(),
                room,
                min_players: config.min_match_players,
                countdown: config.match_countdown,
                start_timeout: config.match_start_timeout,
                channel_size: config.match_channel_size,
            },
            self.inner.transitions.clone(),
        );
        write(&self.inner.matches).insert(id, handle);

        tracing::info!(match_id = %id, players = players.len(), %game_mode, "match created");
        let message = SyncMessage::new(SyncEventType::MatchState, now_millis())
            .with("match_id", id)
            .with("status", MatchStatus::Waiting)
            .with("players", &players)
            .with("game_mode", &game_mode)
            .with("room_id", room);
        self.publish(message);
        Ok(id)
    }

    /// Takes `player` out of the matchmaking queue if they are in it.
    async fn withdraw_from_queue(&self, player: PlayerId) {
        match self.inner.matchmaker.dequeue(player).await {
            Ok(_) => tracing::debug!(%player, "player withdrawn from queue"),
            Err(MatchmakingError::NotQueued(_)) | Err(MatchmakingError::Unavailable) => {}
            Err(err) => tracing::debug!(%player, error = %err, "queue withdrawal failed"),
        }
    }

    /// Whether `player` could join a new match right now.
    fn is_claimable(&self, player: PlayerId) -> bool {
        let Ok(entry) = self.entry(player) else {
            return false;
        };
        let e = lock(&entry);
        e.player.current_match.is_none()
            && matches!(e.player.status, PlayerStatus::Online | PlayerStatus::InLobby)
    }

    /// Reserves every player for match `id`, or none of them.
    fn claim_players(&self, players: &[PlayerId], id: MatchId) -> Result<(), SyncError> {
        let mut sorted = players.to_vec();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != players.len() {
            return Err(SyncError::InvalidRequest("duplicate players".into()));
        }
        let entries = sorted
            .iter()
            .map(|p| self.entry(*p))
            .collect::<Result<Vec<_>, _>>()?;
        let mut guards: Vec<_> = entries.iter().map(|e| lock(e)).collect();

        for e in &guards {
            ensure_free(e)?;
            if !matches!(e.player.status, PlayerStatus::Online | PlayerStatus::InLobby) {
                return Err(SyncError::InvalidPlayerTransition {
                    player: e.player.id,
                    from: e.player.status,
                    to: PlayerStatus::InMatch,
                });
            }
        }
        for e in &mut guards {
            e.player.current_match = Some(id);
        }
        Ok(())
    }

    /// Reacts to a match actor's status change.
    fn apply_transition(&self, transition: MatchTransition) {
        let MatchTransition {
            match_id,
            status,
            players,
            room,
            reason,
            scores,
        } = transition;

        match status {
            MatchStatus::Waiting => {}
            MatchStatus::Starting => {
                self.set_room_status(room, RoomStatus::Starting);
            }
            MatchStatus::InProgress => {
                for player in &players {
                    if let Err(err) = self.update_player(*player, |e| e.transition(PlayerStatus::InMatch)) {
                        tracing::warn!(%player, %match_id, error = %err, "player could not enter match");
                    }
                }
                self.set_room_status(room, RoomStatus::InProgress);
                let message = SyncMessage::new(SyncEventType::MatchStart, now_millis())
                    .with("match_id", match_id)
                    .with("players", &players)
                    .with("room_id", room);
                self.publish(message);
            }
            MatchStatus::Finished | MatchStatus::Cancelled => {
                write(&self.inner.matches).remove(&match_id);
                for player in &players {
                    let released = self.update_player(*player, |e| {
                        if e.player.current_match == Some(match_id) {
                            e.player.current_match = None;
                        }
                        if e.player.status == PlayerStatus::InMatch {
                            let resting = e.resting_status();
                            e.transition(resting)?;
                        }
                        Ok(())
                    });
                    if let Err(err) = released {
                        tracing::debug!(%player, %match_id, error = %err, "player release skipped");
                    }
                }
                self.release_spectators(match_id);
                if let Some(room_id) = room {
                    if let Ok(entry) = self.room_entry(room_id) {
                        let mut r = lock(&entry);
                        r.current_match = None;
                        r.set_status(if status == MatchStatus::Finished {
                            RoomStatus::Finished
                        } else {
                            RoomStatus::Waiting
                        });
                    }
                }
            }
        }

        let scores: Map<String, Value> = scores
            .into_iter()
            .map(|(player, score)| (player.0.to_string(), Value::from(score)))
            .collect();
        let message = SyncMessage::new(SyncEventType::MatchState, now_millis())
            .with("match_id", match_id)
            .with("status", status)
            .with("players", &players)
            .with("reason", reason)
            .with("scores", scores);
        self.publish(message);
    }

    fn release_spectators(&self, match_id: MatchId) {
        let entries: Vec<_> = read(&self.inner.players).values().cloned().collect();
        for entry in entries {
            let mut e = lock(&entry);
            if e.player.spectating == Some(match_id) {
                e.player.spectating = None;
                let resting = e.resting_status();
                if let Err(err) = e.transition(resting) {
                    tracing::debug!(player_id = %e.player.id, error = %err, "spectator release failed");
                }
            }
        }
    }

    fn set_room_status(&self, room: Option<RoomId>, status: RoomStatus) {
        let Some(room_id) = room else { return };
        let Ok(entry) = self.room_entry(room_id) else { return };
        let snapshot = {
            let mut r = lock(&entry);
            r.set_status(status);
            r.clone()
        };
        self.publish(room_update(&snapshot));
    }

    /// Match id plus the rewound and current transform of an acting player.
    fn action_context(&self, player: PlayerId, action_type: &str) -> Result<(MatchId, Transform, Transform), SyncError> {
        let entry = self.entry(player)?;
        let mut e = lock(&entry);
        let match_id = match (e.player.status, e.player.current_match) {
            (PlayerStatus::InMatch, Some(id)) => id,
            _ => return Err(SyncError::NoActiveMatch(player)),
        };
        e.touch();
        let channel = if action_type == ACTION_MOVE {
            Channel::Unreliable
        } else {
            Channel::ReliableOrdered
        };
        let current = e.player.transform;
        let reference = self
            .inner
            .lag
            .rewind(&e.history, channel, Instant::now())
            .copied()
            .unwrap_or(current);
        Ok((match_id, reference, current))
    }

    /// Wraps `message` for the transport and queues it. Subscribers get it
    /// straight away.
    fn publish(&self, message: SyncMessage) {
        let _ = self.inner.events.send(message.clone());

        let payload = match self.inner.codec.encode(&message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(kind = %message.kind, error = %err, "failed to encode sync event");
                return;
            }
        };
        let (channel, priority, method) = delivery_for(message.kind);
        let outbound = NetworkMessage::new(
            message.kind.as_str(),
            method,
            self.inner.config.publish_target.clone(),
            payload,
        )
        .with_channel(channel)
        .with_priority(priority);
        // Outcomes are tracked by the optimizer's stats; nobody awaits them here.
        drop(self.inner.optimizer.enqueue(outbound));
    }

    fn entry(&self, id: PlayerId) -> Result<Arc<Mutex<PlayerEntry>>, SyncError> {
        read(&self.inner.players)
            .get(&id)
            .cloned()
            .ok_or(SyncError::PlayerNotFound(id))
    }

    fn room_entry(&self, id: RoomId) -> Result<Arc<Mutex<Room>>, SyncError> {
        read(&self.inner.rooms)
            .get(&id)
            .cloned()
            .ok_or(SyncError::RoomNotFound(id))
    }

    fn match_handle(&self, id: MatchId) -> Result<MatchHandle, SyncError> {
        read(&self.inner.matches)
            .get(&id)
            .cloned()
            .ok_or(SyncError::MatchNotFound(id))
    }

    fn player_match(&self, player: PlayerId) -> Result<MatchHandle, SyncError> {
        let match_id = {
            let entry = self.entry(player)?;
            let current = lock(&entry).player.current_match;
            current.ok_or(SyncError::NoActiveMatch(player))?
        };
        self.match_handle(match_id)
    }

    /// Runs `f` under the player's lock and returns the resulting snapshot.
    fn update_player(
        &self,
        id: PlayerId,
        f: impl FnOnce(&mut PlayerEntry) -> Result<(), SyncError>,
    ) -> Result<Player, SyncError> {
        let entry = self.entry(id)?;
        let mut e = lock(&entry);
        f(&mut e)?;
        Ok(e.player.clone())
    }
}

/// The driver loop. Holds the service weakly so dropping every handle
/// also ends it.
async fn drive<T: Transport>(
    inner: Weak<Inner<T>>,
    mut parts: DriverParts,
    mut shutdown: ShutdownSignal,
    publish_tick: TickConfig,
) {
    let mut publish = TickScheduler::new(publish_tick);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = publish.wait_for_tick() => {
                let Some(service) = upgrade(&inner) else { break };
                service.publish_tick();
                publish.record_tick_end();
            }
            Some(update) = parts.inbound.recv() => {
                let Some(service) = upgrade(&inner) else { break };
                service.apply_inbound_update(update);
            }
            Some(transition) = parts.transitions.recv() => {
                let Some(service) = upgrade(&inner) else { break };
                service.apply_transition(transition);
            }
            Some(outcome) = parts.scans.recv() => {
                let Some(service) = upgrade(&inner) else { break };
                service.handle_scan_outcome(outcome).await;
            }
        }
    }
    tracing::debug!("sync driver stopped");
}

fn upgrade<T: Transport>(inner: &Weak<Inner<T>>) -> Option<RealtimeSyncService<T>> {
    inner.upgrade().map(|inner| RealtimeSyncService { inner })
}

/// Channel, priority and method each event kind is sent with.
fn delivery_for(kind: SyncEventType) -> (Channel, Priority, Method) {
    match kind {
        SyncEventType::PlayerUpdate => (Channel::Unreliable, Priority::Low, Method::Put),
        SyncEventType::MatchStart => (Channel::ReliableOrdered, Priority::Critical, Method::Put),
        SyncEventType::MatchState => (Channel::ReliableOrdered, Priority::High, Method::Put),
        SyncEventType::GameEvent => (Channel::ReliableOrdered, Priority::High, Method::Post),
        SyncEventType::RoomUpdate | SyncEventType::PlayerState => {
            (Channel::ReliableOrdered, Priority::Normal, Method::Put)
        }
    }
}

/// Rejects players already committed to a match.
fn ensure_free(entry: &PlayerEntry) -> Result<(), SyncError> {
    match entry.player.current_match {
        Some(match_id) => Err(SyncError::InvalidRequest(format!(
            "player {} is already in match {match_id}",
            entry.player.id
        ))),
        None => Ok(()),
    }
}

/// Where a validated `move` lands: an absolute `position`, or `delta`
/// added to the current position.
fn resolve_move(data: &Map<String, Value>, current: Transform) -> Result<Transform, SyncError> {
    let parse = |key: &str| {
        data.get(key)
            .and_then(|v| serde_json::from_value::<Vec3>(v.clone()).ok())
    };
    let position = match (parse("position"), parse("delta")) {
        (Some(position), _) => position,
        (None, Some(delta)) => Vec3::new(
            current.position.x + delta.x,
            current.position.y + delta.y,
            current.position.z + delta.z,
        ),
        (None, None) => {
            return Err(SyncError::InvalidRequest("move needs `position` or `delta`".into()));
        }
    };
    let orientation = parse("orientation").unwrap_or(current.orientation);
    Ok(Transform {
        position,
        orientation,
    })
}

fn to_value(position: Vec3) -> Value {
    serde_json::to_value(position).unwrap_or(Value::Null)
}

fn player_state(player: &Player) -> SyncMessage {
    SyncMessage::new(SyncEventType::PlayerState, now_millis())
        .with("player_id", player.id)
        .with("status", player.status)
        .with("room_id", player.room)
        .with("match_id", player.current_match)
        .with("is_host", player.is_host)
        .with("ping_ms", player.ping.map(|p| p.as_millis() as u64))
}

fn player_update(player: &Player, sequence: Option<u64>) -> SyncMessage {
    SyncMessage::new(SyncEventType::PlayerUpdate, now_millis())
        .with("player_id", player.id)
        .with("match_id", player.current_match)
        .with("position", player.transform.position)
        .with("orientation", player.transform.orientation)
        .with("sequence", sequence)
}

fn room_update(room: &Room) -> SyncMessage {
    SyncMessage::new(SyncEventType::RoomUpdate, now_millis())
        .with("room_id", room.id)
        .with("host", room.host)
        .with("members", &room.members)
        .with("status", room.status)
        .with("capacity", room.capacity)
        .with("game_mode", &room.game_mode)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use rallypoint_anticheat::AntiCheatConfig;
    use rallypoint_matchmaking::MatchmakingConfig;
    use rallypoint_optimizer::OptimizerConfig;
    use rallypoint_transport::LoopbackTransport;
    use serde_json::json;

    use super::*;

    fn idle_service() -> RealtimeSyncService<LoopbackTransport> {
        let optimizer = TransportOptimizer::new(OptimizerConfig::default(), LoopbackTransport::echo()).unwrap();
        let (matchmaker, scan_outcomes) = Matchmaker::spawn(MatchmakingConfig::default()).unwrap();
        let validator = Arc::new(AntiCheatValidator::new(AntiCheatConfig::default()).unwrap());
        RealtimeSyncService::new(
            SyncConfig::default(),
            Collaborators {
                optimizer,
                matchmaker,
                scan_outcomes,
                validator,
                prediction: PredictionConfig::default(),
            },
        )
        .unwrap()
    }

    /// Applies queued match transitions in place of the driver.
    fn apply_pending_transitions(service: &RealtimeSyncService<LoopbackTransport>, parts: &mut DriverParts) {
        while let Ok(transition) = parts.transitions.try_recv() {
            service.apply_transition(transition);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_action_failed_apply_records_no_prediction() {
        let service = idle_service();
        let mut parts = lock(&service.inner.driver).take().unwrap();
        for id in [1, 2] {
            service.connect_player(PlayerId(id), format!("p{id}"), 1000).unwrap();
        }
        let match_id = service
            .create_match(vec![PlayerId(1), PlayerId(2)], GameMode::from("duel"))
            .await
            .unwrap();
        service.acknowledge_match(PlayerId(1)).await.unwrap();
        service.acknowledge_match(PlayerId(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3100)).await;
        apply_pending_transitions(&service, &mut parts);
        assert_eq!(service.player(PlayerId(1)).unwrap().status, PlayerStatus::InMatch);

        // The match ends but its transition has not been applied yet.
        service.match_handle(match_id).unwrap().finish(None).await.unwrap();
        let data = match json!({"delta": {"x": 1.0, "y": 0.0, "z": 0.0}, "sequence": 1}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let err = service.submit_action(PlayerId(1), ACTION_MOVE, data).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidMatchState { .. } | SyncError::Unavailable(_)
        ));
        assert!(service.pending_predictions(PlayerId(1)).unwrap().is_empty());
        assert_eq!(service.player(PlayerId(1)).unwrap().transform, Transform::default());
    }

    #[test]
    fn test_resolve_move_prefers_absolute_position() {
        let data = match json!({"position": {"x": 1.0, "y": 2.0, "z": 3.0}, "delta": {"x": 9.0, "y": 9.0, "z": 9.0}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let moved = resolve_move(&data, Transform::default()).unwrap();
        assert_eq!(moved.position, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_resolve_move_adds_delta_to_current() {
        let data = match json!({"delta": {"x": 1.0, "y": 0.0, "z": -1.0}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let moved = resolve_move(&data, Transform::at(Vec3::new(2.0, 2.0, 2.0))).unwrap();
        assert_eq!(moved.position, Vec3::new(3.0, 2.0, 1.0));
    }

    #[test]
    fn test_resolve_move_without_coordinates_errors() {
        assert!(resolve_move(&Map::new(), Transform::default()).is_err());
    }

    #[test]
    fn test_delivery_for_streams_positions_unreliably() {
        let (channel, priority, method) = delivery_for(SyncEventType::PlayerUpdate);
        assert_eq!(channel, Channel::Unreliable);
        assert_eq!(priority, Priority::Low);
        assert_eq!(method, Method::Put);
        assert_eq!(delivery_for(SyncEventType::MatchStart).1, Priority::Critical);
        assert_eq!(delivery_for(SyncEventType::GameEvent).2, Method::Post);
    }
}
