//! Queue bookkeeping and the grouping algorithm. No I/O, no timers: the
//! caller passes `now` in, which keeps every decision reproducible.

use std::collections::{HashMap, VecDeque};

use rallypoint_protocol::{GameMode, PlayerId};
use tokio::time::Instant;

use crate::{MatchmakingConfig, MatchmakingError};

/// A player waiting for a match.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub player: PlayerId,
    pub skill_rating: u32,
    pub game_mode: GameMode,
    pub enqueued_at: Instant,
}

/// A group of compatible players pulled out of one queue.
#[derive(Debug, Clone, PartialEq)]
pub struct FormedMatch {
    pub game_mode: GameMode,
    /// Oldest-enqueued first.
    pub players: Vec<QueueEntry>,
}

impl FormedMatch {
    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.players.iter().map(|e| e.player).collect()
    }

    /// `max(skill) - min(skill)` across the group.
    pub fn skill_spread(&self) -> u32 {
        let ratings = self.players.iter().map(|e| e.skill_rating);
        let max = ratings.clone().max().unwrap_or(0);
        let min = ratings.min().unwrap_or(0);
        max - min
    }
}

/// Result of one [`MatchmakingEngine::scan`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanOutcome {
    pub matches: Vec<FormedMatch>,
    /// Entries dropped for waiting too long.
    pub timed_out: Vec<QueueEntry>,
}

impl ScanOutcome {
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty() && self.timed_out.is_empty()
    }

    /// One [`MatchmakingError::Timeout`] per dropped entry, measured at `now`.
    pub fn timeout_errors(&self, now: Instant) -> Vec<MatchmakingError> {
        self.timed_out
            .iter()
            .map(|e| MatchmakingError::Timeout {
                player: e.player,
                waited: now.saturating_duration_since(e.enqueued_at),
            })
            .collect()
    }
}

/// One FIFO queue per game mode, scanned oldest-first.
#[derive(Debug)]
pub struct MatchmakingEngine {
    config: MatchmakingConfig,
    queues: HashMap<GameMode, VecDeque<QueueEntry>>,
    /// Which queue each player sits in.
    index: HashMap<PlayerId, GameMode>,
}

impl MatchmakingEngine {
    pub fn new(config: MatchmakingConfig) -> Result<Self, MatchmakingError> {
        config.validate()?;
        Ok(Self {
            config,
            queues: HashMap::new(),
            index: HashMap::new(),
        })
    }

    pub fn config(&self) -> &MatchmakingConfig {
        &self.config
    }

    /// Appends a player to the queue for `game_mode`.
    ///
    /// # Errors
    /// [`MatchmakingError::AlreadyQueued`] if the player waits in any queue.
    pub fn enqueue(
        &mut self,
        player: PlayerId,
        skill_rating: u32,
        game_mode: GameMode,
        now: Instant,
    ) -> Result<(), MatchmakingError> {
        if self.index.contains_key(&player) {
            return Err(MatchmakingError::AlreadyQueued(player));
        }
        self.index.insert(player, game_mode.clone());
        let queue = self.queues.entry(game_mode.clone()).or_default();
        queue.push_back(QueueEntry {
            player,
            skill_rating,
            game_mode: game_mode.clone(),
            enqueued_at: now,
        });
        tracing::debug!(%player, skill_rating, mode = %game_mode, queued = queue.len(), "player queued");
        Ok(())
    }

    /// Puts a previously scanned entry back, keeping its original
    /// `enqueued_at` so its wait and queue position carry over.
    pub fn requeue(&mut self, entry: QueueEntry) -> Result<(), MatchmakingError> {
        if self.index.contains_key(&entry.player) {
            return Err(MatchmakingError::AlreadyQueued(entry.player));
        }
        self.index.insert(entry.player, entry.game_mode.clone());
        let queue = self.queues.entry(entry.game_mode.clone()).or_default();
        let at = queue.partition_point(|e| e.enqueued_at <= entry.enqueued_at);
        tracing::debug!(player = %entry.player, mode = %entry.game_mode, position = at, "player requeued");
        queue.insert(at, entry);
        Ok(())
    }

    /// Removes a player from whichever queue holds them.
    pub fn dequeue(&mut self, player: PlayerId) -> Result<QueueEntry, MatchmakingError> {
        let mode = self
            .index
            .remove(&player)
            .ok_or(MatchmakingError::NotQueued(player))?;
        let queue = self
            .queues
            .get_mut(&mode)
            .ok_or(MatchmakingError::NotQueued(player))?;
        let at = queue
            .iter()
            .position(|e| e.player == player)
            .ok_or(MatchmakingError::NotQueued(player))?;
        let entry = queue.remove(at).ok_or(MatchmakingError::NotQueued(player))?;
        if queue.is_empty() {
            self.queues.remove(&mode);
        }
        tracing::debug!(%player, mode = %mode, "player left queue");
        Ok(entry)
    }

    /// Drops timed-out entries, then groups compatible players.
    ///
    /// For each remaining player, oldest first, the scan greedily adds later
    /// players as long as the group's rating spread stays within
    /// `skill_range`, up to `max_players_per_room`. Groups smaller than
    /// `min_players` are left queued.
    pub fn scan(&mut self, now: Instant) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();

        for queue in self.queues.values_mut() {
            let entries: Vec<QueueEntry> = queue.drain(..).collect();
            let (expired, waiting): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| {
                now.saturating_duration_since(e.enqueued_at) > self.config.matchmaking_timeout
            });
            for entry in &expired {
                tracing::info!(player = %entry.player, mode = %entry.game_mode, "matchmaking timed out");
            }
            outcome.timed_out.extend(expired);

            let mut taken = vec![false; waiting.len()];
            for i in 0..waiting.len() {
                if taken[i] {
                    continue;
                }
                let mut group = vec![i];
                let (mut min, mut max) = (waiting[i].skill_rating, waiting[i].skill_rating);
                for j in (i + 1)..waiting.len() {
                    if group.len() >= self.config.max_players_per_room {
                        break;
                    }
                    if taken[j] {
                        continue;
                    }
                    let rating = waiting[j].skill_rating;
                    let (lo, hi) = (min.min(rating), max.max(rating));
                    if hi - lo <= self.config.skill_range {
                        group.push(j);
                        min = lo;
                        max = hi;
                    }
                }
                if group.len() >= self.config.min_players {
                    for &k in &group {
                        taken[k] = true;
                    }
                    outcome.matches.push(FormedMatch {
                        game_mode: waiting[i].game_mode.clone(),
                        players: group.iter().map(|&k| waiting[k].clone()).collect(),
                    });
                }
            }

            queue.extend(
                waiting
                    .into_iter()
                    .zip(taken)
                    .filter_map(|(entry, taken)| (!taken).then_some(entry)),
            );
        }

        for entry in outcome
            .timed_out
            .iter()
            .chain(outcome.matches.iter().flat_map(|m| m.players.iter()))
        {
            self.index.remove(&entry.player);
        }
        self.queues.retain(|_, queue| !queue.is_empty());

        for formed in &outcome.matches {
            tracing::info!(
                mode = %formed.game_mode,
                players = formed.players.len(),
                spread = formed.skill_spread(),
                "match formed"
            );
        }
        outcome
    }

    pub fn queue_len(&self, game_mode: &GameMode) -> usize {
        self.queues.get(game_mode).map_or(0, VecDeque::len)
    }

    /// Zero-based place in the player's queue.
    pub fn position(&self, player: PlayerId) -> Option<usize> {
        let mode = self.index.get(&player)?;
        self.queues.get(mode)?.iter().position(|e| e.player == player)
    }

    pub fn is_queued(&self, player: PlayerId) -> bool {
        self.index.contains_key(&player)
    }

    /// Players queued across every mode.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn engine() -> MatchmakingEngine {
        MatchmakingEngine::new(MatchmakingConfig::default()).unwrap()
    }

    fn ranked() -> GameMode {
        GameMode::from("ranked")
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_pairs_players_within_range() {
        let mut mm = engine();
        let now = Instant::now();
        mm.enqueue(PlayerId(1), 1000, ranked(), now).unwrap();
        mm.enqueue(PlayerId(2), 1050, ranked(), now).unwrap();

        let outcome = mm.scan(now);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].player_ids(), vec![PlayerId(1), PlayerId(2)]);
        assert!(mm.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_leaves_lonely_player_queued() {
        let mut mm = engine();
        let now = Instant::now();
        mm.enqueue(PlayerId(1), 1000, ranked(), now).unwrap();
        mm.enqueue(PlayerId(2), 1500, ranked(), now).unwrap();

        assert!(mm.scan(now).matches.is_empty());
        assert_eq!(mm.queue_len(&ranked()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_spread_is_bounded_not_pairwise_to_first() {
        let mut mm = engine();
        let now = Instant::now();
        // 1000 and 1080 fit; 920 is within 100 of 1000 but widens spread to 160.
        mm.enqueue(PlayerId(1), 1000, ranked(), now).unwrap();
        mm.enqueue(PlayerId(2), 1080, ranked(), now).unwrap();
        mm.enqueue(PlayerId(3), 920, ranked(), now).unwrap();

        let outcome = mm.scan(now);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].player_ids(), vec![PlayerId(1), PlayerId(2)]);
        assert!(outcome.matches[0].skill_spread() <= 100);
        assert_eq!(mm.position(PlayerId(3)), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_caps_group_at_room_size() {
        let mut mm = engine();
        let now = Instant::now();
        for id in 1..=6 {
            mm.enqueue(PlayerId(id), 1000, ranked(), now).unwrap();
        }
        let outcome = mm.scan(now);
        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.matches[0].players.len(), 4);
        assert_eq!(outcome.matches[1].players.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_drops_timed_out_entries() {
        let mut mm = engine();
        let start = Instant::now();
        mm.enqueue(PlayerId(1), 1000, ranked(), start).unwrap();
        let later = start + Duration::from_secs(61);
        mm.enqueue(PlayerId(2), 1000, ranked(), later).unwrap();

        let outcome = mm.scan(later);
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.timed_out.len(), 1);
        assert_eq!(outcome.timed_out[0].player, PlayerId(1));
        assert!(matches!(
            outcome.timeout_errors(later)[0],
            MatchmakingError::Timeout { player: PlayerId(1), .. }
        ));
        assert!(!mm.is_queued(PlayerId(1)));
        assert!(mm.is_queued(PlayerId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_modes_never_mix() {
        let mut mm = engine();
        let now = Instant::now();
        mm.enqueue(PlayerId(1), 1000, ranked(), now).unwrap();
        mm.enqueue(PlayerId(2), 1000, GameMode::from("casual"), now).unwrap();
        assert!(mm.scan(now).matches.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_twice_is_rejected() {
        let mut mm = engine();
        let now = Instant::now();
        mm.enqueue(PlayerId(1), 1000, ranked(), now).unwrap();
        assert!(matches!(
            mm.enqueue(PlayerId(1), 1000, GameMode::from("casual"), now),
            Err(MatchmakingError::AlreadyQueued(PlayerId(1)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_removes_and_reports_missing() {
        let mut mm = engine();
        let now = Instant::now();
        mm.enqueue(PlayerId(1), 1000, ranked(), now).unwrap();
        mm.enqueue(PlayerId(2), 1000, ranked(), now).unwrap();

        assert_eq!(mm.dequeue(PlayerId(1)).unwrap().player, PlayerId(1));
        assert_eq!(mm.position(PlayerId(2)), Some(0));
        assert!(matches!(mm.dequeue(PlayerId(1)), Err(MatchmakingError::NotQueued(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_restores_original_place() {
        let mut mm = engine();
        let start = Instant::now();
        mm.enqueue(PlayerId(1), 1000, ranked(), start).unwrap();
        mm.enqueue(PlayerId(2), 1000, ranked(), start + Duration::from_secs(1)).unwrap();
        mm.enqueue(PlayerId(3), 5000, ranked(), start + Duration::from_secs(2)).unwrap();

        let formed = mm.scan(start + Duration::from_secs(2)).matches.remove(0);
        assert_eq!(formed.player_ids(), vec![PlayerId(1), PlayerId(2)]);

        mm.requeue(formed.players[1].clone()).unwrap();
        assert_eq!(mm.position(PlayerId(2)), Some(0));
        assert_eq!(mm.position(PlayerId(3)), Some(1));
        assert!(matches!(
            mm.requeue(formed.players[1].clone()),
            Err(MatchmakingError::AlreadyQueued(PlayerId(2)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_keeps_timeout_clock() {
        let mut mm = engine();
        let start = Instant::now();
        mm.enqueue(PlayerId(1), 1000, ranked(), start).unwrap();
        let entry = mm.dequeue(PlayerId(1)).unwrap();
        mm.requeue(entry).unwrap();

        let late = start + mm.config().matchmaking_timeout + Duration::from_secs(1);
        let outcome = mm.scan(late);
        assert_eq!(outcome.timed_out.len(), 1);
        assert_eq!(outcome.timeout_errors(late).len(), 1);
        assert!(!mm.is_queued(PlayerId(1)));
    }
}
