//! Durable persistence for games, questions, players, and answers on
//! SQLite. One connection behind a mutex; WAL journaling and foreign keys
//! on; every statement prepared and cached. Gameplay-driven mutations
//! arrive batched through the write queue, admission and reads call in
//! directly.

use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use rusqlite_migration::{M, Migrations};

use kviz_core::question::Question;
use kviz_core::{GameId, PlayerId};

use crate::auth;
use crate::write_queue::DbOp;

const SCHEMA: &str = "
CREATE TABLE games (
    id INTEGER PRIMARY KEY,
    pin TEXT NOT NULL UNIQUE,
    password_hash TEXT,
    moderator_token TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'waiting',
    current_question_index INTEGER NOT NULL DEFAULT 0,
    question_start_time INTEGER,
    player_counter INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE TABLE questions (
    id INTEGER PRIMARY KEY,
    game_id INTEGER NOT NULL REFERENCES games(id) ON DELETE CASCADE,
    order_index INTEGER NOT NULL,
    text TEXT NOT NULL,
    option0 TEXT NOT NULL,
    option1 TEXT NOT NULL,
    option2 TEXT NOT NULL,
    option3 TEXT NOT NULL,
    correct_index INTEGER NOT NULL,
    time_limit_secs INTEGER NOT NULL,
    UNIQUE (game_id, order_index)
);
CREATE TABLE players (
    id INTEGER PRIMARY KEY,
    game_id INTEGER NOT NULL REFERENCES games(id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    display_name TEXT NOT NULL,
    player_token TEXT NOT NULL UNIQUE,
    score INTEGER NOT NULL DEFAULT 0,
    connected INTEGER NOT NULL DEFAULT 1,
    last_seen INTEGER NOT NULL,
    UNIQUE (game_id, ordinal)
);
CREATE TABLE answers (
    id INTEGER PRIMARY KEY,
    game_id INTEGER NOT NULL REFERENCES games(id) ON DELETE CASCADE,
    player_ordinal INTEGER NOT NULL,
    question_id INTEGER NOT NULL REFERENCES questions(id) ON DELETE CASCADE,
    option_index INTEGER NOT NULL,
    correct INTEGER NOT NULL,
    points INTEGER NOT NULL,
    response_time_ms INTEGER NOT NULL,
    submitted_at INTEGER NOT NULL,
    UNIQUE (game_id, player_ordinal, question_id)
);
CREATE TABLE question_templates (
    category TEXT PRIMARY KEY,
    questions TEXT NOT NULL
);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("PIN already in use")]
    PinTaken,
    #[error("Game not found")]
    GameNotFound,
    #[error("Question not found")]
    QuestionNotFound,
    #[error("Player not found")]
    PlayerNotFound,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("corrupt template payload: {0}")]
    Template(#[from] serde_json::Error),
}

/// A persisted game row.
#[derive(Debug, Clone)]
pub struct GameRow {
    pub id: GameId,
    pub pin: String,
    pub password_hash: Option<String>,
    pub moderator_token: String,
    pub status: String,
    pub current_question_index: usize,
    pub question_start_time: Option<u64>,
    pub created_at: u64,
}

/// A game row together with its ordered question set.
#[derive(Debug, Clone)]
pub struct GameRecord {
    pub game: GameRow,
    pub questions: Vec<Question>,
}

/// A persisted player row. `ordinal` is the protocol-visible player id,
/// 1-based in per-game join order.
#[derive(Debug, Clone)]
pub struct PlayerRow {
    pub ordinal: PlayerId,
    pub display_name: String,
    pub token: String,
    pub score: u32,
    pub connected: bool,
    pub last_seen: u64,
}

/// Result of admitting a brand-new player.
#[derive(Debug, Clone)]
pub struct NewPlayer {
    pub ordinal: PlayerId,
    pub display_name: String,
    pub token: String,
}

/// Outcome counters for one batched flush group.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOutcome {
    pub applied: usize,
    pub failed: usize,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path`. `:memory:` yields a fresh
    /// in-memory database, used by tests.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let mut conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Migrations::new(vec![M::up(SCHEMA)]).to_latest(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- games ----

    /// Create a game with its ordered question set in one transaction.
    /// A persisted PIN collision fails with `PinTaken`.
    pub fn create_game(
        &self,
        pin: &str,
        questions: &[Question],
        password_hash: Option<&str>,
        moderator_token: &str,
        now: u64,
    ) -> Result<GameId, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let inserted = tx
            .prepare_cached(
                "INSERT INTO games (pin, password_hash, moderator_token, status, created_at)
                 VALUES (?1, ?2, ?3, 'waiting', ?4)",
            )?
            .execute(params![pin, password_hash, moderator_token, now as i64]);
        match inserted {
            Ok(_) => {},
            Err(e) if is_unique_violation(&e) => return Err(StoreError::PinTaken),
            Err(e) => return Err(e.into()),
        }
        let game_id = tx.last_insert_rowid();
        insert_questions(&tx, game_id, questions)?;
        tx.commit()?;
        Ok(game_id)
    }

    /// Fetch a game and its ordered questions by PIN.
    pub fn get_game_by_pin(&self, pin: &str) -> Result<Option<GameRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let game = conn
            .prepare_cached(
                "SELECT id, pin, password_hash, moderator_token, status,
                        current_question_index, question_start_time, created_at
                 FROM games WHERE pin = ?1",
            )?
            .query_row(params![pin], row_to_game)
            .optional()?;
        let Some(game) = game else {
            return Ok(None);
        };
        let questions = load_questions(&conn, game.id)?;
        Ok(Some(GameRecord { game, questions }))
    }

    /// Atomically replace a game's question set.
    pub fn update_game_questions(
        &self,
        game_id: GameId,
        questions: &[Question],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.prepare_cached("DELETE FROM questions WHERE game_id = ?1")?
            .execute(params![game_id])?;
        insert_questions(&tx, game_id, questions)?;
        tx.commit()?;
        Ok(())
    }

    /// Authenticate a moderator by token or password. Never errors on bad
    /// credentials; `None` simply means rejected.
    pub fn validate_moderator(
        &self,
        pin: &str,
        password: Option<&str>,
        token: Option<&str>,
    ) -> Result<Option<GameRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let game = conn
            .prepare_cached(
                "SELECT id, pin, password_hash, moderator_token, status,
                        current_question_index, question_start_time, created_at
                 FROM games WHERE pin = ?1",
            )?
            .query_row(params![pin], row_to_game)
            .optional()?;
        let Some(game) = game else {
            return Ok(None);
        };
        if let Some(token) = token
            && auth::tokens_match(token, &game.moderator_token)
        {
            return Ok(Some(game));
        }
        if let Some(password) = password
            && let Some(ref hash) = game.password_hash
            && auth::verify_password(hash, password)
        {
            return Ok(Some(game));
        }
        Ok(None)
    }

    /// Persist game status, question index, and question start time.
    pub fn update_game_state(
        &self,
        game_id: GameId,
        status: &str,
        current_question_index: usize,
        question_start_time: Option<u64>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached(
            "UPDATE games SET status = ?2, current_question_index = ?3,
                    question_start_time = ?4
             WHERE id = ?1",
        )?
        .execute(params![
            game_id,
            status,
            current_question_index as i64,
            question_start_time.map(|t| t as i64)
        ])?;
        Ok(())
    }

    /// Delete games created before `cutoff_ms`, cascading to questions,
    /// players, and answers. Returns the number of games removed.
    pub fn cleanup_old_games(&self, cutoff_ms: u64) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .prepare_cached("DELETE FROM games WHERE created_at < ?1")?
            .execute(params![cutoff_ms as i64])?;
        Ok(removed)
    }

    // ---- players ----

    /// Admit a new player: the next per-game ordinal, the default display
    /// name, and a fresh opaque token.
    pub fn add_player(&self, game_id: GameId, now: u64) -> Result<NewPlayer, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let bumped = tx
            .prepare_cached("UPDATE games SET player_counter = player_counter + 1 WHERE id = ?1")?
            .execute(params![game_id])?;
        if bumped == 0 {
            return Err(StoreError::GameNotFound);
        }
        let ordinal: i64 = tx
            .prepare_cached("SELECT player_counter FROM games WHERE id = ?1")?
            .query_row(params![game_id], |row| row.get(0))?;
        let display_name = format!("Hráč {ordinal}");
        let token = auth::generate_token();
        tx.prepare_cached(
            "INSERT INTO players (game_id, ordinal, display_name, player_token, score,
                                  connected, last_seen)
             VALUES (?1, ?2, ?3, ?4, 0, 1, ?5)",
        )?
        .execute(params![game_id, ordinal, display_name, token, now as i64])?;
        tx.commit()?;
        Ok(NewPlayer {
            ordinal,
            display_name,
            token,
        })
    }

    /// Flip a player back to connected by token. `None` when the token does
    /// not belong to this game.
    pub fn reconnect_player(
        &self,
        game_id: GameId,
        token: &str,
        now: u64,
    ) -> Result<Option<PlayerRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .prepare_cached(
                "SELECT ordinal, display_name, player_token, score, connected, last_seen
                 FROM players WHERE game_id = ?1 AND player_token = ?2",
            )?
            .query_row(params![game_id, token], row_to_player)
            .optional()?;
        let Some(mut player) = row else {
            return Ok(None);
        };
        conn.prepare_cached(
            "UPDATE players SET connected = 1, last_seen = ?3
             WHERE game_id = ?1 AND ordinal = ?2",
        )?
        .execute(params![game_id, player.ordinal, now as i64])?;
        player.connected = true;
        player.last_seen = now;
        Ok(Some(player))
    }

    pub fn disconnect_player(
        &self,
        game_id: GameId,
        ordinal: PlayerId,
        last_seen: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached(
            "UPDATE players SET connected = 0, last_seen = ?3
             WHERE game_id = ?1 AND ordinal = ?2",
        )?
        .execute(params![game_id, ordinal, last_seen as i64])?;
        Ok(())
    }

    /// Idempotent absolute score write.
    pub fn update_player_score(
        &self,
        game_id: GameId,
        ordinal: PlayerId,
        score: u32,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("UPDATE players SET score = ?3 WHERE game_id = ?1 AND ordinal = ?2")?
            .execute(params![game_id, ordinal, score])?;
        Ok(())
    }

    /// Permanently delete one player. Answers are immutable history and
    /// stay behind; only deleting the game removes them.
    pub fn remove_player(&self, game_id: GameId, ordinal: PlayerId) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("DELETE FROM players WHERE game_id = ?1 AND ordinal = ?2")?
            .execute(params![game_id, ordinal])?;
        Ok(())
    }

    /// Delete every player of a game. Returns the count removed.
    pub fn remove_all_players_from_game(&self, game_id: GameId) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .prepare_cached("DELETE FROM players WHERE game_id = ?1")?
            .execute(params![game_id])?;
        Ok(removed)
    }

    pub fn get_players_for_game(&self, game_id: GameId) -> Result<Vec<PlayerRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT ordinal, display_name, player_token, score, connected, last_seen
             FROM players WHERE game_id = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt
            .query_map(params![game_id], row_to_player)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- answers ----

    /// Record an answer, first write wins. A duplicate for the same
    /// (game, player, question) returns the existing row id untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn save_answer(
        &self,
        game_id: GameId,
        player_ordinal: PlayerId,
        question_index: usize,
        option_index: usize,
        correct: bool,
        points: u32,
        response_time_ms: u64,
        submitted_at: u64,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let question_id: Option<i64> = conn
            .prepare_cached("SELECT id FROM questions WHERE game_id = ?1 AND order_index = ?2")?
            .query_row(params![game_id, question_index as i64], |row| row.get(0))
            .optional()?;
        let Some(question_id) = question_id else {
            return Err(StoreError::QuestionNotFound);
        };
        conn.prepare_cached(
            "INSERT INTO answers (game_id, player_ordinal, question_id, option_index,
                                  correct, points, response_time_ms, submitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (game_id, player_ordinal, question_id) DO NOTHING",
        )?
        .execute(params![
            game_id,
            player_ordinal,
            question_id,
            option_index as i64,
            correct,
            points,
            response_time_ms as i64,
            submitted_at as i64
        ])?;
        let answer_id: i64 = conn
            .prepare_cached(
                "SELECT id FROM answers
                 WHERE game_id = ?1 AND player_ordinal = ?2 AND question_id = ?3",
            )?
            .query_row(params![game_id, player_ordinal, question_id], |row| {
                row.get(0)
            })?;
        Ok(answer_id)
    }

    /// Answers recorded for one question, for rehydrating a mid-question
    /// game: (player ordinal, option, response time, submitted at).
    pub fn get_answers_for_question(
        &self,
        game_id: GameId,
        question_index: usize,
    ) -> Result<Vec<(PlayerId, usize, u64, u64)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT a.player_ordinal, a.option_index, a.response_time_ms, a.submitted_at
             FROM answers a
             JOIN questions q ON q.id = a.question_id
             WHERE a.game_id = ?1 AND q.order_index = ?2
             ORDER BY a.submitted_at",
        )?;
        let rows = stmt
            .query_map(params![game_id, question_index as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)? as usize,
                    row.get::<_, i64>(2)? as u64,
                    row.get::<_, i64>(3)? as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- templates ----

    pub fn get_template(&self, category: &str) -> Result<Option<Vec<Question>>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .prepare_cached("SELECT questions FROM question_templates WHERE category = ?1")?
            .query_row(params![category], |row| row.get(0))
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn put_template(&self, category: &str, questions: &[Question]) -> Result<(), StoreError> {
        let json = serde_json::to_string(questions)?;
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached(
            "INSERT INTO question_templates (category, questions) VALUES (?1, ?2)
             ON CONFLICT (category) DO UPDATE SET questions = excluded.questions",
        )?
        .execute(params![category, json])?;
        Ok(())
    }

    // ---- batched writes ----

    /// Apply one flush group inside a single transaction. Individual op
    /// failures are logged and counted without aborting the rest of the
    /// group.
    pub fn apply_ops(&self, ops: &[DbOp]) -> Result<BatchOutcome, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut outcome = BatchOutcome::default();
        for op in ops {
            match apply_op(&tx, op) {
                Ok(()) => outcome.applied += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(op = ?op, error = %e, "Batched store operation failed");
                },
            }
        }
        tx.commit()?;
        Ok(outcome)
    }
}

fn apply_op(tx: &Transaction<'_>, op: &DbOp) -> Result<(), StoreError> {
    match op {
        DbOp::UpdatePlayerScore {
            game_id,
            player_id,
            score,
        } => {
            tx.prepare_cached("UPDATE players SET score = ?3 WHERE game_id = ?1 AND ordinal = ?2")?
                .execute(params![game_id, player_id, score])?;
        },
        DbOp::SaveAnswer {
            game_id,
            player_id,
            question_index,
            option_index,
            correct,
            points,
            response_time_ms,
            submitted_at,
        } => {
            let question_id: Option<i64> = tx
                .prepare_cached("SELECT id FROM questions WHERE game_id = ?1 AND order_index = ?2")?
                .query_row(params![game_id, *question_index as i64], |row| row.get(0))
                .optional()?;
            let Some(question_id) = question_id else {
                return Err(StoreError::QuestionNotFound);
            };
            tx.prepare_cached(
                "INSERT INTO answers (game_id, player_ordinal, question_id, option_index,
                                      correct, points, response_time_ms, submitted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (game_id, player_ordinal, question_id) DO NOTHING",
            )?
            .execute(params![
                game_id,
                player_id,
                question_id,
                *option_index as i64,
                correct,
                points,
                *response_time_ms as i64,
                *submitted_at as i64
            ])?;
        },
        DbOp::UpdateGameState {
            game_id,
            status,
            current_question_index,
            question_start_time,
        } => {
            tx.prepare_cached(
                "UPDATE games SET status = ?2, current_question_index = ?3,
                        question_start_time = ?4
                 WHERE id = ?1",
            )?
            .execute(params![
                game_id,
                status,
                *current_question_index as i64,
                question_start_time.map(|t| t as i64)
            ])?;
        },
        DbOp::DisconnectPlayer {
            game_id,
            player_id,
            last_seen,
        } => {
            tx.prepare_cached(
                "UPDATE players SET connected = 0, last_seen = ?3
                 WHERE game_id = ?1 AND ordinal = ?2",
            )?
            .execute(params![game_id, player_id, *last_seen as i64])?;
        },
        DbOp::RemovePlayer { game_id, player_id } => {
            tx.prepare_cached("DELETE FROM players WHERE game_id = ?1 AND ordinal = ?2")?
                .execute(params![game_id, player_id])?;
        },
    }
    Ok(())
}

fn insert_questions(
    tx: &Transaction<'_>,
    game_id: GameId,
    questions: &[Question],
) -> Result<(), StoreError> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO questions (game_id, order_index, text, option0, option1, option2,
                                option3, correct_index, time_limit_secs)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for (i, q) in questions.iter().enumerate() {
        stmt.execute(params![
            game_id,
            i as i64,
            q.text,
            q.options.first().map(String::as_str).unwrap_or(""),
            q.options.get(1).map(String::as_str).unwrap_or(""),
            q.options.get(2).map(String::as_str).unwrap_or(""),
            q.options.get(3).map(String::as_str).unwrap_or(""),
            q.correct_index as i64,
            q.time_limit_secs as i64
        ])?;
    }
    Ok(())
}

fn load_questions(conn: &Connection, game_id: GameId) -> Result<Vec<Question>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT text, option0, option1, option2, option3, correct_index, time_limit_secs
         FROM questions WHERE game_id = ?1 ORDER BY order_index",
    )?;
    let rows = stmt
        .query_map(params![game_id], |row| {
            Ok(Question {
                text: row.get(0)?,
                options: vec![row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?],
                correct_index: row.get::<_, i64>(5)? as usize,
                time_limit_secs: row.get::<_, i64>(6)? as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn row_to_game(row: &rusqlite::Row<'_>) -> rusqlite::Result<GameRow> {
    Ok(GameRow {
        id: row.get(0)?,
        pin: row.get(1)?,
        password_hash: row.get(2)?,
        moderator_token: row.get(3)?,
        status: row.get(4)?,
        current_question_index: row.get::<_, i64>(5)? as usize,
        question_start_time: row.get::<_, Option<i64>>(6)?.map(|t| t as u64),
        created_at: row.get::<_, i64>(7)? as u64,
    })
}

fn row_to_player(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlayerRow> {
    Ok(PlayerRow {
        ordinal: row.get(0)?,
        display_name: row.get(1)?,
        token: row.get(2)?,
        score: row.get(3)?,
        connected: row.get::<_, i64>(4)? != 0,
        last_seen: row.get::<_, i64>(5)? as u64,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> Store {
        Store::open(":memory:").unwrap()
    }

    fn make_questions(n: usize) -> Vec<Question> {
        (0..n)
            .map(|i| Question {
                text: format!("Otázka {}", i + 1),
                options: vec!["A".into(), "B".into(), "C".into(), "D".into()],
                correct_index: i % 4,
                time_limit_secs: 30,
            })
            .collect()
    }

    fn seed_game(store: &Store, pin: &str) -> GameId {
        store
            .create_game(pin, &make_questions(3), None, &auth::generate_token(), 1_000)
            .unwrap()
    }

    #[test]
    fn create_then_get_round_trips_questions_in_order() {
        let store = open_store();
        let questions = make_questions(3);
        let id = store
            .create_game("123456", &questions, None, "tok", 1_000)
            .unwrap();

        let record = store.get_game_by_pin("123456").unwrap().unwrap();
        assert_eq!(record.game.id, id);
        assert_eq!(record.game.status, "waiting");
        assert_eq!(record.game.created_at, 1_000);
        assert_eq!(record.questions, questions);
    }

    #[test]
    fn missing_pin_is_none() {
        let store = open_store();
        assert!(store.get_game_by_pin("999999").unwrap().is_none());
    }

    #[test]
    fn pin_collision_rejected() {
        let store = open_store();
        seed_game(&store, "123456");
        let err = store.create_game("123456", &make_questions(1), None, "tok2", 2_000);
        assert!(matches!(err, Err(StoreError::PinTaken)));
    }

    #[test]
    fn update_questions_replaces_atomically() {
        let store = open_store();
        let id = seed_game(&store, "123456");

        let replacement = make_questions(5);
        store.update_game_questions(id, &replacement).unwrap();

        let record = store.get_game_by_pin("123456").unwrap().unwrap();
        assert_eq!(record.questions, replacement);
    }

    #[test]
    fn add_player_assigns_sequential_ordinals() {
        let store = open_store();
        let id = seed_game(&store, "123456");

        let p1 = store.add_player(id, 1_000).unwrap();
        let p2 = store.add_player(id, 1_001).unwrap();
        assert_eq!(p1.ordinal, 1);
        assert_eq!(p1.display_name, "Hráč 1");
        assert_eq!(p2.ordinal, 2);
        assert_eq!(p2.display_name, "Hráč 2");
        assert_ne!(p1.token, p2.token);
    }

    #[test]
    fn ordinals_never_reused_after_removal() {
        let store = open_store();
        let id = seed_game(&store, "123456");
        let p1 = store.add_player(id, 1_000).unwrap();
        store.remove_player(id, p1.ordinal).unwrap();

        let p2 = store.add_player(id, 2_000).unwrap();
        assert_eq!(p2.ordinal, 2);
    }

    #[test]
    fn add_player_to_missing_game_fails() {
        let store = open_store();
        assert!(matches!(
            store.add_player(999, 1_000),
            Err(StoreError::GameNotFound)
        ));
    }

    #[test]
    fn reconnect_by_token() {
        let store = open_store();
        let id = seed_game(&store, "123456");
        let p = store.add_player(id, 1_000).unwrap();
        store.disconnect_player(id, p.ordinal, 2_000).unwrap();

        let row = store.reconnect_player(id, &p.token, 3_000).unwrap().unwrap();
        assert_eq!(row.ordinal, p.ordinal);
        assert!(row.connected);
        assert_eq!(row.last_seen, 3_000);

        assert!(store.reconnect_player(id, "bogus", 3_000).unwrap().is_none());
    }

    #[test]
    fn score_update_is_idempotent() {
        let store = open_store();
        let id = seed_game(&store, "123456");
        let p = store.add_player(id, 1_000).unwrap();

        store.update_player_score(id, p.ordinal, 1_417).unwrap();
        store.update_player_score(id, p.ordinal, 1_417).unwrap();

        let players = store.get_players_for_game(id).unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].score, 1_417);
    }

    #[test]
    fn save_answer_is_first_write_wins() {
        let store = open_store();
        let id = seed_game(&store, "123456");
        let p = store.add_player(id, 1_000).unwrap();

        let first = store
            .save_answer(id, p.ordinal, 0, 2, true, 1_417, 5_000, 6_000)
            .unwrap();
        let second = store
            .save_answer(id, p.ordinal, 0, 3, false, 0, 9_000, 10_000)
            .unwrap();
        assert_eq!(first, second);

        // The original row is untouched
        let conn = store.conn.lock().unwrap();
        let (option, points): (i64, u32) = conn
            .query_row(
                "SELECT option_index, points FROM answers WHERE id = ?1",
                params![first],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(option, 2);
        assert_eq!(points, 1_417);
    }

    #[test]
    fn save_answer_rejects_bad_question_index() {
        let store = open_store();
        let id = seed_game(&store, "123456");
        let p = store.add_player(id, 1_000).unwrap();
        assert!(matches!(
            store.save_answer(id, p.ordinal, 42, 0, true, 1_000, 500, 600),
            Err(StoreError::QuestionNotFound)
        ));
    }

    #[test]
    fn validate_moderator_by_token_and_password() {
        let store = open_store();
        let hash = auth::hash_password("secret");
        store
            .create_game("123456", &make_questions(1), Some(&hash), "the-token", 1_000)
            .unwrap();

        assert!(store
            .validate_moderator("123456", None, Some("the-token"))
            .unwrap()
            .is_some());
        assert!(store
            .validate_moderator("123456", Some("secret"), None)
            .unwrap()
            .is_some());
        assert!(store
            .validate_moderator("123456", Some("wrong"), None)
            .unwrap()
            .is_none());
        assert!(store
            .validate_moderator("123456", None, Some("wrong-token"))
            .unwrap()
            .is_none());
        assert!(store.validate_moderator("123456", None, None).unwrap().is_none());
        assert!(store
            .validate_moderator("999999", None, Some("the-token"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn password_free_game_rejects_password_login() {
        let store = open_store();
        store
            .create_game("123456", &make_questions(1), None, "tok", 1_000)
            .unwrap();
        assert!(store
            .validate_moderator("123456", Some("anything"), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn game_state_round_trips() {
        let store = open_store();
        let id = seed_game(&store, "123456");
        store
            .update_game_state(id, "question_active", 1, Some(5_000))
            .unwrap();

        let record = store.get_game_by_pin("123456").unwrap().unwrap();
        assert_eq!(record.game.status, "question_active");
        assert_eq!(record.game.current_question_index, 1);
        assert_eq!(record.game.question_start_time, Some(5_000));
    }

    #[test]
    fn remove_all_players_counts_and_keeps_answers() {
        let store = open_store();
        let id = seed_game(&store, "123456");
        let p1 = store.add_player(id, 1_000).unwrap();
        store.add_player(id, 1_001).unwrap();
        store
            .save_answer(id, p1.ordinal, 0, 1, true, 1_300, 800, 2_000)
            .unwrap();

        assert_eq!(store.remove_all_players_from_game(id).unwrap(), 2);
        assert!(store.get_players_for_game(id).unwrap().is_empty());
        assert_eq!(store.get_answers_for_question(id, 0).unwrap().len(), 1);
    }

    #[test]
    fn removing_a_player_preserves_their_answers() {
        let store = open_store();
        let id = seed_game(&store, "123456");
        let p = store.add_player(id, 1_000).unwrap();
        store
            .save_answer(id, p.ordinal, 0, 2, true, 1_417, 5_000, 6_000)
            .unwrap();

        store.remove_player(id, p.ordinal).unwrap();
        assert!(store.get_players_for_game(id).unwrap().is_empty());

        let answers = store.get_answers_for_question(id, 0).unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].0, p.ordinal);
        assert_eq!(answers[0].1, 2);
    }

    #[test]
    fn cleanup_cascades_to_children() {
        let store = open_store();
        let id = seed_game(&store, "123456");
        let p = store.add_player(id, 1_000).unwrap();
        store
            .save_answer(id, p.ordinal, 0, 0, true, 1_500, 100, 1_100)
            .unwrap();
        seed_game(&store, "654321");

        // Only the first game is older than the cutoff
        let conn = store.conn.lock().unwrap();
        conn.execute("UPDATE games SET created_at = 10 WHERE id = ?1", params![id])
            .unwrap();
        drop(conn);

        let removed = store.cleanup_old_games(500).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_game_by_pin("123456").unwrap().is_none());
        assert!(store.get_game_by_pin("654321").unwrap().is_some());

        let conn = store.conn.lock().unwrap();
        let orphans: i64 = conn
            .query_row("SELECT COUNT(*) FROM answers", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
        let players: i64 = conn
            .query_row("SELECT COUNT(*) FROM players", [], |row| row.get(0))
            .unwrap();
        assert_eq!(players, 0);
    }

    #[test]
    fn templates_round_trip_and_overwrite() {
        let store = open_store();
        assert!(store.get_template("veda").unwrap().is_none());

        let first = make_questions(2);
        store.put_template("veda", &first).unwrap();
        assert_eq!(store.get_template("veda").unwrap().unwrap(), first);

        let second = make_questions(4);
        store.put_template("veda", &second).unwrap();
        assert_eq!(store.get_template("veda").unwrap().unwrap(), second);
    }

    #[test]
    fn apply_ops_survives_individual_failures() {
        let store = open_store();
        let id = seed_game(&store, "123456");
        let p = store.add_player(id, 1_000).unwrap();

        let ops = vec![
            DbOp::UpdatePlayerScore {
                game_id: id,
                player_id: p.ordinal,
                score: 100,
            },
            // Bad question index: fails without aborting the group
            DbOp::SaveAnswer {
                game_id: id,
                player_id: p.ordinal,
                question_index: 99,
                option_index: 0,
                correct: true,
                points: 1_000,
                response_time_ms: 500,
                submitted_at: 2_000,
            },
            DbOp::UpdatePlayerScore {
                game_id: id,
                player_id: p.ordinal,
                score: 250,
            },
        ];
        let outcome = store.apply_ops(&ops).unwrap();
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.failed, 1);

        let players = store.get_players_for_game(id).unwrap();
        assert_eq!(players[0].score, 250);
    }

    #[test]
    fn apply_ops_handles_every_variant() {
        let store = open_store();
        let id = seed_game(&store, "123456");
        let p1 = store.add_player(id, 1_000).unwrap();
        let p2 = store.add_player(id, 1_001).unwrap();

        let ops = vec![
            DbOp::SaveAnswer {
                game_id: id,
                player_id: p1.ordinal,
                question_index: 0,
                option_index: 1,
                correct: true,
                points: 1_200,
                response_time_ms: 700,
                submitted_at: 2_000,
            },
            DbOp::UpdatePlayerScore {
                game_id: id,
                player_id: p1.ordinal,
                score: 1_200,
            },
            DbOp::UpdateGameState {
                game_id: id,
                status: "results".to_string(),
                current_question_index: 0,
                question_start_time: None,
            },
            DbOp::DisconnectPlayer {
                game_id: id,
                player_id: p1.ordinal,
                last_seen: 3_000,
            },
            DbOp::RemovePlayer {
                game_id: id,
                player_id: p1.ordinal,
            },
        ];
        let outcome = store.apply_ops(&ops).unwrap();
        assert_eq!(outcome.applied, 5);
        assert_eq!(outcome.failed, 0);

        let record = store.get_game_by_pin("123456").unwrap().unwrap();
        assert_eq!(record.game.status, "results");
        let players = store.get_players_for_game(id).unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].ordinal, p2.ordinal);
        // The removed player's answer is history and survives them
        assert_eq!(store.get_answers_for_question(id, 0).unwrap().len(), 1);
    }
}
