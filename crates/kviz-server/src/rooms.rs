//! Active-game bookkeeping and broadcast fan-out. Each PIN owns one
//! `ActiveGame` behind its own mutex; every instance mutation happens
//! under that lock, so cross-PIN traffic never contends. State broadcasts
//! are shaped per role and delta-compressed against the last blob sent to
//! that room.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use kviz_core::SocketId;
use kviz_core::events::{PlayerView, ServerEvent};
use kviz_core::game::{GameInstance, Phase};

use crate::sessions::SessionRegistry;

/// The three per-PIN rooms. Every role room is also implicitly part of the
/// combined `all` fan-out used for shared events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    Players,
    Moderators,
    Panels,
}

impl RoomKind {
    pub const ALL: [RoomKind; 3] = [Self::Players, Self::Moderators, Self::Panels];
}

/// One in-memory game plus its broadcast state and question timer.
pub struct ActiveGame {
    pub instance: GameInstance,
    /// Auto-end timer for the running question.
    timer: Option<JoinHandle<()>>,
    /// Last state blob broadcast per room, the baseline for delta
    /// compression.
    last_broadcast: HashMap<RoomKind, Map<String, Value>>,
}

impl ActiveGame {
    pub fn new(instance: GameInstance) -> Self {
        Self {
            instance,
            timer: None,
            last_broadcast: HashMap::new(),
        }
    }

    /// Replace the question timer, aborting any previous one.
    pub fn arm_timer(&mut self, handle: JoinHandle<()>) {
        if let Some(old) = self.timer.replace(handle) {
            old.abort();
        }
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Detach the timer handle without aborting the task. Used by the
    /// timer itself when it fires, since aborting the running task would
    /// cancel its own follow-up work.
    pub fn take_timer(&mut self) -> Option<JoinHandle<()>> {
        self.timer.take()
    }

    /// Build the authoritative state blob shaped for one room. Players get
    /// the minimum, moderators the full picture, panels display data.
    pub fn shape_state(&mut self, kind: RoomKind) -> Map<String, Value> {
        let view = self.instance.state();
        let question_number = view.current_question_index + 1;
        let total_questions = self.instance.question_count();
        let value = match kind {
            RoomKind::Players => {
                let mut blob = json!({
                    "status": view.status,
                    "questionNumber": question_number,
                    "totalQuestions": total_questions,
                });
                if let Some(remaining) = self.time_remaining_secs() {
                    blob["timeRemaining"] = json!(remaining);
                }
                blob
            },
            RoomKind::Moderators => {
                let mut players: Vec<PlayerView> = self
                    .instance
                    .players()
                    .map(|(id, p)| PlayerView {
                        id,
                        name: p.display_name.clone(),
                        score: p.score,
                        connected: p.connected,
                    })
                    .collect();
                players.sort_by_key(|p| p.id);
                let mut blob = json!({
                    "status": view.status,
                    "currentQuestionIndex": view.current_question_index,
                    "questionNumber": question_number,
                    "totalQuestions": total_questions,
                    "totalPlayers": self.instance.player_count(),
                    "connectedPlayers": self.instance.connected_player_count(),
                    "answeredCount": self.instance.answered_count(),
                    "answerStats": self.instance.answer_stats(),
                    "players": players,
                });
                if self.instance.phase() == Phase::QuestionActive
                    && let Some(q) = self.instance.current_question()
                {
                    blob["correctAnswer"] = json!(q.correct_index);
                }
                blob
            },
            RoomKind::Panels => json!({
                "status": view.status,
                "questionNumber": question_number,
                "totalQuestions": total_questions,
                "totalPlayers": self.instance.player_count(),
                "answeredCount": self.instance.answered_count(),
            }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// Seconds left on the running question, rounded up. `None` outside
    /// `question_active`.
    fn time_remaining_secs(&self) -> Option<u64> {
        if self.instance.phase() != Phase::QuestionActive {
            return None;
        }
        let start = self.instance.question_start()?;
        let limit_ms = self.instance.current_question()?.time_limit_secs * 1000;
        let remaining_ms = (start + limit_ms).saturating_sub(kviz_core::time::now_ms());
        Some(remaining_ms.div_ceil(1000))
    }

    /// Shape the blob for a room and reduce it to the fields that changed
    /// since the last broadcast. `force` transmits the full blob (role
    /// joins, reconnections, phase transitions). `None` means nothing
    /// changed and nothing should be sent.
    pub fn state_delta(&mut self, kind: RoomKind, force: bool) -> Option<Map<String, Value>> {
        let next = self.shape_state(kind);
        let delta = if force {
            next.clone()
        } else {
            let prev = self.last_broadcast.get(&kind);
            diff_fields(prev, &next)
        };
        self.last_broadcast.insert(kind, next);
        if delta.is_empty() { None } else { Some(delta) }
    }

    /// Full state blob for one newly joined socket, also refreshing the
    /// room baseline (the blob equals the current authoritative state).
    pub fn full_state(&mut self, kind: RoomKind) -> Map<String, Value> {
        let blob = self.shape_state(kind);
        self.last_broadcast.insert(kind, blob.clone());
        blob
    }
}

/// Changed top-level fields of `next` relative to `prev`.
fn diff_fields(prev: Option<&Map<String, Value>>, next: &Map<String, Value>) -> Map<String, Value> {
    match prev {
        None => next.clone(),
        Some(prev) => next
            .iter()
            .filter(|(key, value)| prev.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    }
}

/// All active games, one lock per PIN. The outer map lock is held only for
/// lookup and create/destroy.
#[derive(Default)]
pub struct GameRegistry {
    games: RwLock<HashMap<String, Arc<Mutex<ActiveGame>>>>,
}

impl GameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, pin: &str) -> Option<Arc<Mutex<ActiveGame>>> {
        self.games.read().await.get(pin).map(Arc::clone)
    }

    pub async fn insert(&self, pin: String, game: ActiveGame) -> Arc<Mutex<ActiveGame>> {
        let game = Arc::new(Mutex::new(game));
        self.games.write().await.insert(pin, Arc::clone(&game));
        game
    }

    /// Insert unless another task restored the same PIN first; either way
    /// the caller gets the authoritative entry.
    pub async fn get_or_insert(&self, pin: String, game: ActiveGame) -> Arc<Mutex<ActiveGame>> {
        let mut games = self.games.write().await;
        if let Some(existing) = games.get(&pin) {
            return Arc::clone(existing);
        }
        let game = Arc::new(Mutex::new(game));
        games.insert(pin, Arc::clone(&game));
        game
    }

    pub async fn remove(&self, pin: &str) -> Option<Arc<Mutex<ActiveGame>>> {
        self.games.write().await.remove(pin)
    }

    pub async fn contains(&self, pin: &str) -> bool {
        self.games.read().await.contains_key(pin)
    }

    pub async fn pins(&self) -> Vec<String> {
        self.games.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.games.read().await.len()
    }
}

/// Sockets belonging to one room of a game.
pub fn room_sockets(game: &ActiveGame, kind: RoomKind) -> Vec<SocketId> {
    match kind {
        RoomKind::Players => game.instance.player_sockets().collect(),
        RoomKind::Moderators => game.instance.moderator_sockets().collect(),
        RoomKind::Panels => game.instance.panel_sockets().collect(),
    }
}

/// Fan an event out to one room.
pub async fn broadcast_to_room(
    sessions: &RwLock<SessionRegistry>,
    game: &ActiveGame,
    kind: RoomKind,
    event: &ServerEvent,
) {
    let sockets = room_sockets(game, kind);
    if sockets.is_empty() {
        return;
    }
    sessions.read().await.send_to_many(sockets, event);
}

/// Compute per-room deltas of the authoritative state and transmit each as
/// `game_state_update`. Empty deltas send nothing.
pub async fn broadcast_state(
    sessions: &RwLock<SessionRegistry>,
    game: &mut ActiveGame,
    force: bool,
) {
    for kind in RoomKind::ALL {
        let Some(delta) = game.state_delta(kind, force) else {
            continue;
        };
        let sockets = room_sockets(game, kind);
        if sockets.is_empty() {
            continue;
        }
        let event = ServerEvent::GameStateUpdate(Value::Object(delta));
        sessions.read().await.send_to_many(sockets, &event);
    }
}
