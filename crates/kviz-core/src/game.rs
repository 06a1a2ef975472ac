use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::question::{OPTION_COUNT, Question};
use crate::{GameId, PlayerId, SocketId};

/// Default cap on concurrently admitted players per game.
pub const DEFAULT_MAX_PLAYERS: usize = 300;

/// Default cap on the per-question answer ring buffer.
pub const DEFAULT_MAX_ANSWER_BUFFER: usize = 500;

/// Points for a correct answer regardless of speed.
pub const BASE_POINTS: u32 = 1000;

/// Additional points for an instant correct answer, decaying linearly to
/// zero over the question's time limit.
pub const MAX_BONUS: u32 = 500;

/// Position of a game in the question lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Waiting,
    QuestionActive,
    Results,
    Finished,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::QuestionActive => "question_active",
            Self::Results => "results",
            Self::Finished => "finished",
        }
    }

    /// Parse a persisted status string. `ended` is a legacy synonym of
    /// `finished` and maps to the same terminal phase.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "question_active" => Some(Self::QuestionActive),
            "results" => Some(Self::Results),
            "finished" | "ended" => Some(Self::Finished),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A player tracked by the in-memory game instance.
#[derive(Debug, Clone)]
pub struct PlayerEntry {
    pub display_name: String,
    pub score: u32,
    pub connected: bool,
    pub last_seen: u64,
    pub join_order: u32,
    pub token: String,
}

/// One buffered answer for the current question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRecord {
    pub player_id: PlayerId,
    pub option_index: usize,
    pub effective_ts: u64,
    pub response_time_ms: u64,
}

/// Result of an accepted answer submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedAnswer {
    pub player_id: PlayerId,
    pub option_index: usize,
    pub effective_ts: u64,
    pub response_time_ms: u64,
}

/// A ranked leaderboard row. Includes every player, connected or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub position: u32,
    pub player_id: PlayerId,
    pub name: String,
    pub score: u32,
}

/// Per-option aggregate over the current answer buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerStat {
    pub option: usize,
    pub count: usize,
    pub percentage: u32,
}

/// Snapshot of the instance's authoritative state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateView {
    pub status: String,
    pub current_question_index: usize,
    pub question_start_time: Option<u64>,
}

/// Memory accounting for a game instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub peak_players: usize,
    pub total_joined: u64,
    pub total_answers: u64,
    pub last_cleanup_ms: u64,
}

/// Reasons an instance mutation can be refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    CapacityExceeded,
    InvalidTransition { from: Phase },
    UnknownPlayer,
    NoQuestions,
}

impl std::fmt::Display for GameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapacityExceeded => write!(f, "game is full"),
            Self::InvalidTransition { from } => {
                write!(f, "operation not allowed in phase {from}")
            },
            Self::UnknownPlayer => write!(f, "player not in game"),
            Self::NoQuestions => write!(f, "game has no questions"),
        }
    }
}

/// Whether `add_player` admitted a new player or refreshed a returning one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    New,
    Reconnected,
}

/// Capacity limits applied to one instance.
#[derive(Debug, Clone, Copy)]
pub struct GameLimits {
    pub max_players: usize,
    pub max_answer_buffer: usize,
}

impl Default for GameLimits {
    fn default() -> Self {
        Self {
            max_players: DEFAULT_MAX_PLAYERS,
            max_answer_buffer: DEFAULT_MAX_ANSWER_BUFFER,
        }
    }
}

/// The authoritative in-memory state of one active game. Pure data and
/// rules; all I/O and locking live with the caller. Each instance is
/// mutated only under its per-PIN lock.
pub struct GameInstance {
    pub id: GameId,
    pub pin: String,
    questions: Vec<Question>,
    phase: Phase,
    current_index: usize,
    question_start: Option<u64>,
    players: HashMap<PlayerId, PlayerEntry>,
    join_counter: u32,
    socket_by_player: HashMap<PlayerId, SocketId>,
    player_by_socket: HashMap<SocketId, PlayerId>,
    moderators: HashSet<SocketId>,
    panels: HashSet<SocketId>,
    answers: VecDeque<AnswerRecord>,
    answered: HashSet<PlayerId>,
    limits: GameLimits,
    leaderboard_cache: Option<Vec<LeaderboardEntry>>,
    stats: MemoryStats,
    pub last_activity: u64,
}

impl GameInstance {
    pub fn new(id: GameId, pin: String, questions: Vec<Question>, limits: GameLimits, now: u64) -> Self {
        Self {
            id,
            pin,
            questions,
            phase: Phase::Waiting,
            current_index: 0,
            question_start: None,
            players: HashMap::new(),
            join_counter: 0,
            socket_by_player: HashMap::new(),
            player_by_socket: HashMap::new(),
            moderators: HashSet::new(),
            panels: HashSet::new(),
            answers: VecDeque::new(),
            answered: HashSet::new(),
            limits,
            leaderboard_cache: None,
            stats: MemoryStats::default(),
            last_activity: now,
        }
    }

    // ---- accessors ----

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn question_start(&self) -> Option<u64> {
        self.question_start
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    /// Replace the question set. Only meaningful while waiting before the
    /// first question; the caller gates on phase.
    pub fn set_questions(&mut self, questions: Vec<Question>) {
        self.questions = questions;
    }

    pub fn current_question(&self) -> Option<&Question> {
        self.questions.get(self.current_index)
    }

    pub fn player(&self, id: PlayerId) -> Option<&PlayerEntry> {
        self.players.get(&id)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn connected_player_count(&self) -> usize {
        self.players.values().filter(|p| p.connected).count()
    }

    /// True while any player socket, moderator, or panel still references
    /// this game.
    pub fn has_connected_subjects(&self) -> bool {
        !self.moderators.is_empty()
            || !self.panels.is_empty()
            || self.players.values().any(|p| p.connected)
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats
    }

    pub fn state(&self) -> GameStateView {
        GameStateView {
            status: self.phase.as_str().to_string(),
            current_question_index: self.current_index,
            question_start_time: self.question_start,
        }
    }

    // ---- membership ----

    /// Admit a player or refresh a returning one. A known `id` is a
    /// reconnect: connected flips on, `last_seen` and score refresh, join
    /// order is kept. A new player is inserted with the next join ordinal
    /// and the default display name unless one is given.
    pub fn add_player(
        &mut self,
        id: PlayerId,
        name: Option<String>,
        score: u32,
        token: String,
        now: u64,
    ) -> Result<Admission, GameError> {
        self.last_activity = now;
        if let Some(existing) = self.players.get_mut(&id) {
            existing.connected = true;
            existing.last_seen = now;
            // The persisted score can lag behind the write queue; scores
            // never decrease within a game.
            existing.score = existing.score.max(score);
            self.leaderboard_cache = None;
            return Ok(Admission::Reconnected);
        }
        if self.connected_player_count() >= self.limits.max_players {
            return Err(GameError::CapacityExceeded);
        }
        self.join_counter += 1;
        let entry = PlayerEntry {
            display_name: name.unwrap_or_else(|| format!("Hráč {id}")),
            score,
            connected: true,
            last_seen: now,
            join_order: self.join_counter,
            token,
        };
        self.players.insert(id, entry);
        self.stats.total_joined += 1;
        self.stats.peak_players = self.stats.peak_players.max(self.players.len());
        self.leaderboard_cache = None;
        Ok(Admission::New)
    }

    /// Mark a player disconnected, or with `permanent` erase them entirely,
    /// including any buffered answers for the current question.
    pub fn remove_player(&mut self, id: PlayerId, permanent: bool, now: u64) -> bool {
        self.last_activity = now;
        if permanent {
            if self.players.remove(&id).is_none() {
                return false;
            }
            if let Some(socket) = self.socket_by_player.remove(&id) {
                self.player_by_socket.remove(&socket);
            }
            self.answered.remove(&id);
            self.answers.retain(|a| a.player_id != id);
            self.leaderboard_cache = None;
            true
        } else if let Some(entry) = self.players.get_mut(&id) {
            entry.connected = false;
            entry.last_seen = now;
            true
        } else {
            false
        }
    }

    /// Bind a player to a socket, last write wins: a prior binding of
    /// either side is dropped first.
    pub fn set_player_socket(&mut self, id: PlayerId, socket: SocketId) {
        if let Some(prev_socket) = self.socket_by_player.remove(&id) {
            self.player_by_socket.remove(&prev_socket);
        }
        if let Some(prev_player) = self.player_by_socket.remove(&socket) {
            self.socket_by_player.remove(&prev_player);
        }
        self.socket_by_player.insert(id, socket);
        self.player_by_socket.insert(socket, id);
    }

    pub fn player_for_socket(&self, socket: SocketId) -> Option<PlayerId> {
        self.player_by_socket.get(&socket).copied()
    }

    pub fn socket_for_player(&self, id: PlayerId) -> Option<SocketId> {
        self.socket_by_player.get(&id).copied()
    }

    /// Drop a socket binding without touching player state. Returns the
    /// player the socket belonged to, if any.
    pub fn unbind_socket(&mut self, socket: SocketId) -> Option<PlayerId> {
        self.moderators.remove(&socket);
        self.panels.remove(&socket);
        if let Some(id) = self.player_by_socket.remove(&socket) {
            self.socket_by_player.remove(&id);
            Some(id)
        } else {
            None
        }
    }

    pub fn add_moderator_socket(&mut self, socket: SocketId) {
        self.moderators.insert(socket);
    }

    pub fn add_panel_socket(&mut self, socket: SocketId) {
        self.panels.insert(socket);
    }

    pub fn moderator_sockets(&self) -> impl Iterator<Item = SocketId> + '_ {
        self.moderators.iter().copied()
    }

    pub fn panel_sockets(&self) -> impl Iterator<Item = SocketId> + '_ {
        self.panels.iter().copied()
    }

    pub fn player_sockets(&self) -> impl Iterator<Item = SocketId> + '_ {
        self.player_by_socket.keys().copied()
    }

    /// Iterate over (id, entry) for every tracked player.
    pub fn players(&self) -> impl Iterator<Item = (PlayerId, &PlayerEntry)> {
        self.players.iter().map(|(&id, p)| (id, p))
    }

    // ---- question lifecycle ----

    /// WAITING → QUESTION_ACTIVE. Clears the answer buffer and stamps the
    /// question start time.
    pub fn start_question(&mut self, now: u64) -> Result<&Question, GameError> {
        if self.phase != Phase::Waiting {
            return Err(GameError::InvalidTransition { from: self.phase });
        }
        if self.current_index >= self.questions.len() {
            return Err(GameError::NoQuestions);
        }
        self.phase = Phase::QuestionActive;
        self.question_start = Some(now);
        self.answers.clear();
        self.answered.clear();
        self.last_activity = now;
        Ok(&self.questions[self.current_index])
    }

    /// QUESTION_ACTIVE → RESULTS. Both the moderator's explicit end and the
    /// auto-end timer land here; the loser of that race sees a phase
    /// mismatch and backs off.
    pub fn end_question(&mut self, now: u64) -> Result<(), GameError> {
        if self.phase != Phase::QuestionActive {
            return Err(GameError::InvalidTransition { from: self.phase });
        }
        self.phase = Phase::Results;
        self.question_start = None;
        self.last_activity = now;
        Ok(())
    }

    /// RESULTS → WAITING when more questions remain, RESULTS → FINISHED
    /// past the end. Returns whether another question is available.
    pub fn next_question(&mut self, now: u64) -> Result<bool, GameError> {
        if self.phase != Phase::Results {
            return Err(GameError::InvalidTransition { from: self.phase });
        }
        self.last_activity = now;
        self.answers.clear();
        self.answered.clear();
        self.question_start = None;
        if self.current_index + 1 >= self.questions.len() {
            self.phase = Phase::Finished;
            return Ok(false);
        }
        self.current_index += 1;
        self.phase = Phase::Waiting;
        Ok(true)
    }

    /// Any phase → FINISHED.
    pub fn end_game(&mut self, now: u64) {
        self.phase = Phase::Finished;
        self.question_start = None;
        self.answers.clear();
        self.answered.clear();
        self.last_activity = now;
    }

    /// FINISHED → WAITING as a fresh lobby: index, answers, scores, and
    /// the player roster are all cleared. Returning players rejoin as new
    /// entrants; the caller mirrors the roster wipe into the store.
    pub fn reset_game(&mut self, now: u64) -> Result<(), GameError> {
        if self.phase != Phase::Finished {
            return Err(GameError::InvalidTransition { from: self.phase });
        }
        self.phase = Phase::Waiting;
        self.current_index = 0;
        self.question_start = None;
        self.answers.clear();
        self.answered.clear();
        self.players.clear();
        self.socket_by_player.clear();
        self.player_by_socket.clear();
        self.join_counter = 0;
        self.leaderboard_cache = None;
        self.last_activity = now;
        Ok(())
    }

    /// Restore persisted state when rehydrating an instance from the store.
    pub fn restore_state(&mut self, phase: Phase, index: usize, question_start: Option<u64>) {
        self.phase = phase;
        self.current_index = index.min(self.questions.len().saturating_sub(1));
        self.question_start = question_start;
    }

    // ---- answers & scoring ----

    /// Record an answer for the current question. The effective timestamp
    /// subtracts the submitting socket's latency estimate so slow links are
    /// not penalized; response time is clamped at zero. First write per
    /// player wins; any precondition failure yields `None` without
    /// mutation.
    pub fn submit_answer(
        &mut self,
        player_id: PlayerId,
        option_index: usize,
        latency_ms: u64,
        now: u64,
    ) -> Option<SubmittedAnswer> {
        if self.phase != Phase::QuestionActive {
            return None;
        }
        if option_index >= OPTION_COUNT {
            return None;
        }
        if !self.players.contains_key(&player_id) {
            return None;
        }
        if self.answered.contains(&player_id) {
            return None;
        }
        let start = self.question_start?;
        let effective_ts = now.saturating_sub(latency_ms);
        let response_time_ms = effective_ts.saturating_sub(start);

        if self.answers.len() >= self.limits.max_answer_buffer {
            self.answers.pop_front();
        }
        self.answers.push_back(AnswerRecord {
            player_id,
            option_index,
            effective_ts,
            response_time_ms,
        });
        self.answered.insert(player_id);
        self.stats.total_answers += 1;
        self.last_activity = now;
        Some(SubmittedAnswer {
            player_id,
            option_index,
            effective_ts,
            response_time_ms,
        })
    }

    /// Re-seed a buffered answer when rehydrating a mid-question game, so
    /// players who already answered stay locked out after a restart.
    pub fn restore_answer(
        &mut self,
        player_id: PlayerId,
        option_index: usize,
        response_time_ms: u64,
        effective_ts: u64,
    ) {
        if self.answered.contains(&player_id) || option_index >= OPTION_COUNT {
            return;
        }
        if self.answers.len() >= self.limits.max_answer_buffer {
            self.answers.pop_front();
        }
        self.answers.push_back(AnswerRecord {
            player_id,
            option_index,
            effective_ts,
            response_time_ms,
        });
        self.answered.insert(player_id);
        self.stats.total_answers += 1;
    }

    /// Add points to a player's running total. Returns the new total.
    pub fn add_points(&mut self, player_id: PlayerId, points: u32) -> Result<u32, GameError> {
        let entry = self
            .players
            .get_mut(&player_id)
            .ok_or(GameError::UnknownPlayer)?;
        entry.score += points;
        self.leaderboard_cache = None;
        Ok(entry.score)
    }

    pub fn answered_count(&self) -> usize {
        self.answered.len()
    }

    pub fn buffered_answers(&self) -> usize {
        self.answers.len()
    }

    /// Per-option counts and whole percentages over the current buffer.
    /// Always returns one row per option.
    pub fn answer_stats(&self) -> Vec<AnswerStat> {
        let mut counts = [0usize; OPTION_COUNT];
        for a in &self.answers {
            counts[a.option_index] += 1;
        }
        let total: usize = counts.iter().sum();
        counts
            .iter()
            .enumerate()
            .map(|(option, &count)| AnswerStat {
                option,
                count,
                percentage: if total == 0 {
                    0
                } else {
                    ((count as f64 / total as f64) * 100.0).round() as u32
                },
            })
            .collect()
    }

    // ---- leaderboard ----

    /// All players ranked by score descending, ties broken by earlier join
    /// order, dense 1-based positions. Cached until scores or membership
    /// change.
    pub fn leaderboard(&mut self) -> Vec<LeaderboardEntry> {
        if let Some(ref cached) = self.leaderboard_cache {
            return cached.clone();
        }
        let mut rows: Vec<(PlayerId, u32, u32, String)> = self
            .players
            .iter()
            .map(|(&id, p)| (id, p.score, p.join_order, p.display_name.clone()))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        let board: Vec<LeaderboardEntry> = rows
            .into_iter()
            .enumerate()
            .map(|(i, (player_id, score, _, name))| LeaderboardEntry {
                position: i as u32 + 1,
                player_id,
                name,
                score,
            })
            .collect();
        self.leaderboard_cache = Some(board.clone());
        board
    }

    /// The top `n` leaderboard rows, for panel displays.
    pub fn leaderboard_top(&mut self, n: usize) -> Vec<LeaderboardEntry> {
        let mut board = self.leaderboard();
        board.truncate(n);
        board
    }

    // ---- sweeping ----

    /// Permanently remove players whose disconnected age exceeds `ttl_ms`.
    /// Returns the removed ids so the caller can propagate deletions.
    pub fn sweep_disconnected(&mut self, ttl_ms: u64, now: u64) -> Vec<PlayerId> {
        let expired: Vec<PlayerId> = self
            .players
            .iter()
            .filter(|(_, p)| !p.connected && now.saturating_sub(p.last_seen) > ttl_ms)
            .map(|(&id, _)| id)
            .collect();
        for &id in &expired {
            self.remove_player(id, true, now);
        }
        self.stats.last_cleanup_ms = now;
        expired
    }
}

/// Score a response: zero when wrong, otherwise base points plus a bonus
/// that decays linearly from `MAX_BONUS` to zero across the question's
/// time window. A response at or past the window earns base points only.
pub fn calculate_score(response_time_ms: u64, correct: bool, time_limit_secs: u64) -> u32 {
    if !correct {
        return 0;
    }
    let window_ms = time_limit_secs.saturating_mul(1000);
    if window_ms == 0 {
        return BASE_POINTS;
    }
    let frac = response_time_ms as f64 / window_ms as f64;
    let bonus = (MAX_BONUS as f64 * (1.0 - frac)).max(0.0);
    BASE_POINTS + bonus.round() as u32
}
