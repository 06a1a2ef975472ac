//! The event dispatcher: one handler per client event. Every handler
//! validates its input, resolves the socket's session to a game, mutates
//! the instance under its per-PIN lock, enqueues durable effects, and asks
//! the room layer to broadcast. Validation failures answer the originating
//! socket with the matching `*_error` event and change nothing; internal
//! failures surface as a generic `server_error` and never drop the
//! connection.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use kviz_core::events::{ClientEvent, PlayerView, QuestionStartedPayload, ServerEvent};
use kviz_core::events::{GameEndedPayload, QuestionEndedPayload};
use kviz_core::game::{GameInstance, GameLimits, Phase, calculate_score};
use kviz_core::question::Question;
use kviz_core::time::now_ms;
use kviz_core::SocketId;

use crate::auth;
use crate::rooms::{ActiveGame, RoomKind, broadcast_state, broadcast_to_room};
use crate::sessions::{Role, SessionInfo};
use crate::state::AppState;
use crate::store::StoreError;
use crate::write_queue::DbOp;

/// Template used when `create_game` names no category.
const DEFAULT_CATEGORY: &str = "default";

/// Leaderboard rows carried by `question_ended` broadcasts.
const QUESTION_END_LEADERBOARD: usize = 10;

/// Route one decoded client event.
pub async fn handle_event(state: &AppState, socket: SocketId, event: ClientEvent) {
    let result = match event {
        ClientEvent::CreateGame {
            category,
            custom_pin,
            moderator_password,
        } => handle_create_game(state, socket, category, custom_pin, moderator_password).await,
        ClientEvent::JoinGame { game_pin } => handle_join_game(state, socket, &game_pin).await,
        ClientEvent::ReconnectPlayer {
            game_pin,
            player_token,
        } => handle_reconnect_player(state, socket, &game_pin, &player_token).await,
        ClientEvent::ReconnectModerator {
            game_pin,
            password,
            moderator_token,
        } => {
            handle_reconnect_moderator(
                state,
                socket,
                &game_pin,
                password.as_deref(),
                moderator_token.as_deref(),
            )
            .await
        },
        ClientEvent::JoinPanel { game_pin } => handle_join_panel(state, socket, &game_pin).await,
        ClientEvent::StartQuestion { game_pin } => {
            handle_start_question(state, socket, &game_pin).await
        },
        ClientEvent::EndQuestion { game_pin } => {
            handle_end_question(state, socket, &game_pin).await
        },
        ClientEvent::NextQuestion { game_pin } => {
            handle_next_question(state, socket, &game_pin).await
        },
        ClientEvent::EndGame { game_pin } => handle_end_game(state, socket, &game_pin).await,
        ClientEvent::ResetGame { game_pin } => handle_reset_game(state, socket, &game_pin).await,
        ClientEvent::SubmitAnswer {
            answer,
            timestamp: _,
        } => handle_submit_answer(state, socket, answer).await,
        ClientEvent::LeaveGame {
            game_pin,
            player_token,
        } => handle_leave_game(state, socket, &game_pin, &player_token).await,
        ClientEvent::LatencyPong(ts) => {
            state.sessions.write().await.record_pong(socket, ts, now_ms());
            Ok(())
        },
    };

    if let Err(e) = result {
        tracing::error!(socket, error = %e, "Internal error while handling client event");
        send(state, socket, &ServerEvent::ServerError {
            message: "Interná chyba servera".to_string(),
        })
        .await;
    }
}

/// Socket-loss cleanup: players are marked disconnected (their slot and
/// score survive for the reconnect window), moderators and panels simply
/// leave their rooms.
pub async fn handle_disconnect(state: &AppState, socket: SocketId) {
    let session = state.sessions.write().await.unregister(socket);
    let Some(session) = session else {
        return;
    };
    let Some(game) = state.games.get(&session.pin).await else {
        return;
    };
    let mut game = game.lock().await;
    game.instance.unbind_socket(socket);
    if session.role == Role::Player
        && let Some(player_id) = session.player_id
    {
        let now = now_ms();
        game.instance.remove_player(player_id, false, now);
        state.write_queue.enqueue(DbOp::DisconnectPlayer {
            game_id: game.instance.id,
            player_id,
            last_seen: now,
        });
        tracing::info!(pin = %session.pin, player_id, "Player disconnected");
    }
    broadcast_state(&state.sessions, &mut game, false).await;
}

// ---- game creation & joining ----

async fn handle_create_game(
    state: &AppState,
    socket: SocketId,
    category: Option<String>,
    custom_pin: Option<String>,
    moderator_password: Option<String>,
) -> Result<(), StoreError> {
    let pin = match custom_pin.filter(|p| !p.is_empty()) {
        Some(custom) => {
            if !auth::is_valid_pin(&custom) {
                send(state, socket, &ServerEvent::CreateGameError {
                    message: "Neplatný PIN, zadajte 6 číslic".to_string(),
                })
                .await;
                return Ok(());
            }
            if state.games.contains(&custom).await {
                send(state, socket, &ServerEvent::CreateGameError {
                    message: "PIN je už obsadený".to_string(),
                })
                .await;
                return Ok(());
            }
            custom
        },
        None => {
            let active: std::collections::HashSet<String> =
                state.games.pins().await.into_iter().collect();
            auth::generate_pin(|p| active.contains(p))
        },
    };

    let category = category.unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
    let questions = state.store.get_template(&category)?.unwrap_or_default();
    let moderator_token = auth::generate_token();
    let password_hash = moderator_password
        .filter(|p| !p.is_empty())
        .map(|p| auth::hash_password(&p));
    let now = now_ms();

    let game_id = match state.store.create_game(
        &pin,
        &questions,
        password_hash.as_deref(),
        &moderator_token,
        now,
    ) {
        Ok(id) => id,
        Err(StoreError::PinTaken) => {
            send(state, socket, &ServerEvent::CreateGameError {
                message: "PIN je už obsadený".to_string(),
            })
            .await;
            return Ok(());
        },
        Err(e) => return Err(e),
    };

    let question_count = questions.len();
    let mut instance = GameInstance::new(game_id, pin.clone(), questions, game_limits(state), now);
    instance.add_moderator_socket(socket);
    state
        .games
        .get_or_insert(pin.clone(), ActiveGame::new(instance))
        .await;
    state.sessions.write().await.bind(socket, SessionInfo {
        role: Role::Moderator,
        pin: pin.clone(),
        player_id: None,
    });

    tracing::info!(pin = %pin, game_id, question_count, "Game created");
    send(state, socket, &ServerEvent::GameCreated {
        game_pin: pin,
        question_count,
        moderator_token,
    })
    .await;
    Ok(())
}

async fn handle_join_game(
    state: &AppState,
    socket: SocketId,
    pin: &str,
) -> Result<(), StoreError> {
    let Some(game) = get_or_restore_game(state, pin).await? else {
        return join_error(state, socket, "Hra neexistuje").await;
    };
    let mut game = game.lock().await;
    match game.instance.phase() {
        Phase::Finished => {
            return join_error(state, socket, "Hra už skončila").await;
        },
        Phase::Waiting => {},
        _ if state.config.game.allow_late_join => {},
        _ => {
            return join_error(state, socket, "Hra už prebieha").await;
        },
    }
    // Reject before the store sees anything, so no player row is created.
    if game.instance.connected_player_count() >= state.config.limits.max_players_per_game {
        return join_error(state, socket, "Hra je plná").await;
    }

    let now = now_ms();
    let new_player = match state.store.add_player(game.instance.id, now) {
        Ok(p) => p,
        Err(StoreError::GameNotFound) => {
            return join_error(state, socket, "Hra neexistuje").await;
        },
        Err(e) => return Err(e),
    };
    if game
        .instance
        .add_player(
            new_player.ordinal,
            Some(new_player.display_name.clone()),
            0,
            new_player.token.clone(),
            now,
        )
        .is_err()
    {
        // Lost a capacity race; undo the row
        state.store.remove_player(game.instance.id, new_player.ordinal)?;
        return join_error(state, socket, "Hra je plná").await;
    }
    game.instance.set_player_socket(new_player.ordinal, socket);
    state.sessions.write().await.bind(socket, SessionInfo {
        role: Role::Player,
        pin: pin.to_string(),
        player_id: Some(new_player.ordinal),
    });

    tracing::info!(pin = %pin, player_id = new_player.ordinal, "Player joined");
    send(state, socket, &ServerEvent::GameJoined {
        game_pin: pin.to_string(),
        player_id: new_player.ordinal,
        player_name: new_player.display_name.clone(),
        player_token: new_player.token,
        players_count: game.instance.connected_player_count(),
    })
    .await;

    let joined = ServerEvent::PlayerJoined {
        player_name: new_player.display_name,
        total_players: game.instance.player_count(),
    };
    broadcast_to_room(&state.sessions, &game, RoomKind::Moderators, &joined).await;
    broadcast_to_room(&state.sessions, &game, RoomKind::Panels, &joined).await;
    broadcast_state(&state.sessions, &mut game, false).await;
    Ok(())
}

async fn handle_reconnect_player(
    state: &AppState,
    socket: SocketId,
    pin: &str,
    player_token: &str,
) -> Result<(), StoreError> {
    let Some(game) = get_or_restore_game(state, pin).await? else {
        send(state, socket, &ServerEvent::ReconnectError {
            message: "Hra neexistuje".to_string(),
        })
        .await;
        return Ok(());
    };
    let mut game = game.lock().await;
    let now = now_ms();
    let Some(row) = state
        .store
        .reconnect_player(game.instance.id, player_token, now)?
    else {
        send(state, socket, &ServerEvent::ReconnectError {
            message: "Neplatný token hráča".to_string(),
        })
        .await;
        return Ok(());
    };

    game.instance
        .add_player(
            row.ordinal,
            Some(row.display_name.clone()),
            row.score,
            row.token,
            now,
        )
        .ok();
    game.instance.set_player_socket(row.ordinal, socket);
    state.sessions.write().await.bind(socket, SessionInfo {
        role: Role::Player,
        pin: pin.to_string(),
        player_id: Some(row.ordinal),
    });

    let phase = game.instance.phase();
    let score = game
        .instance
        .player(row.ordinal)
        .map(|p| p.score)
        .unwrap_or(row.score);
    tracing::info!(pin = %pin, player_id = row.ordinal, "Player reconnected");
    send(state, socket, &ServerEvent::PlayerReconnected {
        game_pin: pin.to_string(),
        player_id: row.ordinal,
        player_name: row.display_name,
        score,
        game_status: phase.as_str().to_string(),
    })
    .await;

    // Mid-question reconnects get the running question so the client can
    // re-render and still answer.
    if phase == Phase::QuestionActive
        && let Some(payload) = question_payload(&game.instance, false)
    {
        send(state, socket, &ServerEvent::QuestionStarted(payload)).await;
    }
    let full = game.full_state(RoomKind::Players);
    send(state, socket, &ServerEvent::GameStateUpdate(Value::Object(full))).await;
    broadcast_state(&state.sessions, &mut game, false).await;
    Ok(())
}

async fn handle_reconnect_moderator(
    state: &AppState,
    socket: SocketId,
    pin: &str,
    password: Option<&str>,
    moderator_token: Option<&str>,
) -> Result<(), StoreError> {
    let Some(row) = state.store.validate_moderator(pin, password, moderator_token)? else {
        send(state, socket, &ServerEvent::ModeratorReconnectError {
            message: "Nesprávne heslo alebo token".to_string(),
        })
        .await;
        return Ok(());
    };
    let Some(game) = get_or_restore_game(state, pin).await? else {
        send(state, socket, &ServerEvent::ModeratorReconnectError {
            message: "Hra neexistuje".to_string(),
        })
        .await;
        return Ok(());
    };
    let mut game = game.lock().await;
    game.instance.add_moderator_socket(socket);
    state.sessions.write().await.bind(socket, SessionInfo {
        role: Role::Moderator,
        pin: pin.to_string(),
        player_id: None,
    });

    let mut players: Vec<PlayerView> = game
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

    tracing::info!(pin = %pin, "Moderator reconnected");
    send(state, socket, &ServerEvent::ModeratorReconnected {
        game_pin: pin.to_string(),
        status: game.instance.phase().as_str().to_string(),
        total_players: players.len(),
        players,
        current_question_index: game.instance.current_index(),
        question_count: game.instance.question_count(),
        moderator_token: row.moderator_token,
    })
    .await;

    if game.instance.phase() == Phase::QuestionActive
        && let Some(payload) = question_payload(&game.instance, true)
    {
        send(state, socket, &ServerEvent::QuestionStartedDashboard(payload)).await;
    }
    let full = game.full_state(RoomKind::Moderators);
    send(state, socket, &ServerEvent::GameStateUpdate(Value::Object(full))).await;
    Ok(())
}

async fn handle_join_panel(
    state: &AppState,
    socket: SocketId,
    pin: &str,
) -> Result<(), StoreError> {
    let Some(game) = get_or_restore_game(state, pin).await? else {
        send(state, socket, &ServerEvent::PanelJoinError {
            message: "Hra neexistuje".to_string(),
        })
        .await;
        return Ok(());
    };
    let mut game = game.lock().await;
    game.instance.add_panel_socket(socket);
    state.sessions.write().await.bind(socket, SessionInfo {
        role: Role::Panel,
        pin: pin.to_string(),
        player_id: None,
    });

    send(state, socket, &ServerEvent::PanelGameJoined {
        game_pin: pin.to_string(),
        question_count: game.instance.question_count(),
        game_status: game.instance.phase().as_str().to_string(),
    })
    .await;
    let leaderboard = game
        .instance
        .leaderboard_top(state.config.limits.panel_leaderboard_size);
    send(state, socket, &ServerEvent::PanelLeaderboardUpdate { leaderboard }).await;
    let full = game.full_state(RoomKind::Panels);
    send(state, socket, &ServerEvent::GameStateUpdate(Value::Object(full))).await;
    Ok(())
}

// ---- moderator-driven question flow ----

async fn handle_start_question(
    state: &AppState,
    socket: SocketId,
    pin: &str,
) -> Result<(), StoreError> {
    let Some(game) = authorized_game(state, socket, pin).await else {
        return Ok(());
    };
    let mut game = game.lock().await;
    let now = now_ms();
    let time_limit_secs = match game.instance.start_question(now) {
        Ok(question) => question.time_limit_secs,
        Err(e) => {
            tracing::debug!(pin = %pin, error = %e, "start_question rejected");
            send(state, socket, &ServerEvent::ServerError {
                message: "Otázku nie je možné spustiť".to_string(),
            })
            .await;
            return Ok(());
        },
    };

    let (Some(public), Some(dashboard)) = (
        question_payload(&game.instance, false),
        question_payload(&game.instance, true),
    ) else {
        return Ok(());
    };
    broadcast_to_room(
        &state.sessions,
        &game,
        RoomKind::Players,
        &ServerEvent::QuestionStarted(public.clone()),
    )
    .await;
    broadcast_to_room(
        &state.sessions,
        &game,
        RoomKind::Panels,
        &ServerEvent::QuestionStarted(public),
    )
    .await;
    broadcast_to_room(
        &state.sessions,
        &game,
        RoomKind::Moderators,
        &ServerEvent::QuestionStartedDashboard(dashboard),
    )
    .await;
    broadcast_state(&state.sessions, &mut game, true).await;

    state.write_queue.enqueue(DbOp::UpdateGameState {
        game_id: game.instance.id,
        status: Phase::QuestionActive.as_str().to_string(),
        current_question_index: game.instance.current_index(),
        question_start_time: Some(now),
    });

    let timer = spawn_question_timer(state, pin, Duration::from_secs(time_limit_secs));
    game.arm_timer(timer);
    tracing::info!(
        pin = %pin,
        question = game.instance.current_index(),
        time_limit_secs,
        "Question started"
    );
    Ok(())
}

async fn handle_end_question(
    state: &AppState,
    socket: SocketId,
    pin: &str,
) -> Result<(), StoreError> {
    let Some(game) = authorized_game(state, socket, pin).await else {
        return Ok(());
    };
    let mut game = game.lock().await;
    if !finish_question(state, &mut game, false).await {
        send(state, socket, &ServerEvent::ServerError {
            message: "Žiadna aktívna otázka".to_string(),
        })
        .await;
    }
    Ok(())
}

/// Shared tail of the moderator's `end_question` and the auto-end timer.
/// Returns false when the question was no longer active (the race loser
/// becomes a no-op).
async fn finish_question(state: &AppState, game: &mut ActiveGame, from_timer: bool) -> bool {
    let now = now_ms();
    if game.instance.end_question(now).is_err() {
        return false;
    }
    if from_timer {
        // The timer task is running this code; aborting it here would
        // cancel the broadcasts below.
        game.take_timer();
    } else {
        game.cancel_timer();
    }

    let correct_answer = game
        .instance
        .current_question()
        .map(|q| q.correct_index)
        .unwrap_or(0);
    let payload = QuestionEndedPayload {
        correct_answer,
        leaderboard: game.instance.leaderboard_top(QUESTION_END_LEADERBOARD),
        answer_stats: game.instance.answer_stats(),
        total_answers: game.instance.answered_count() as u64,
        total_players: game.instance.player_count(),
        can_continue: game.instance.current_index() + 1 < game.instance.question_count(),
    };
    broadcast_to_room(
        &state.sessions,
        game,
        RoomKind::Players,
        &ServerEvent::QuestionEnded(payload.clone()),
    )
    .await;
    broadcast_to_room(
        &state.sessions,
        game,
        RoomKind::Panels,
        &ServerEvent::QuestionEnded(payload.clone()),
    )
    .await;
    broadcast_to_room(
        &state.sessions,
        game,
        RoomKind::Moderators,
        &ServerEvent::QuestionEndedDashboard(payload),
    )
    .await;
    let leaderboard = game
        .instance
        .leaderboard_top(state.config.limits.panel_leaderboard_size);
    broadcast_to_room(
        &state.sessions,
        game,
        RoomKind::Panels,
        &ServerEvent::PanelLeaderboardUpdate { leaderboard },
    )
    .await;
    broadcast_state(&state.sessions, game, true).await;

    state.write_queue.enqueue(DbOp::UpdateGameState {
        game_id: game.instance.id,
        status: Phase::Results.as_str().to_string(),
        current_question_index: game.instance.current_index(),
        question_start_time: None,
    });
    tracing::info!(
        pin = %game.instance.pin,
        question = game.instance.current_index(),
        answers = game.instance.answered_count(),
        "Question ended"
    );
    true
}

async fn handle_submit_answer(
    state: &AppState,
    socket: SocketId,
    answer: usize,
) -> Result<(), StoreError> {
    let session = state.sessions.read().await.session(socket);
    let Some(SessionInfo {
        role: Role::Player,
        pin,
        player_id: Some(player_id),
    }) = session
    else {
        tracing::debug!(socket, "submit_answer from a socket without a player session");
        return Ok(());
    };
    let Some(game) = state.games.get(&pin).await else {
        return Ok(());
    };
    let latency = state.sessions.read().await.latency(socket);
    let mut game = game.lock().await;
    let Some(question) = game.instance.current_question().cloned() else {
        return Ok(());
    };
    let now = now_ms();
    let Some(submitted) = game.instance.submit_answer(player_id, answer, latency, now) else {
        // Duplicate or out-of-phase submissions are dropped silently.
        tracing::debug!(pin = %pin, player_id, "Answer rejected by instance");
        return Ok(());
    };

    let correct = submitted.option_index == question.correct_index;
    let points = calculate_score(submitted.response_time_ms, correct, question.time_limit_secs);
    let total_score = match game.instance.add_points(player_id, points) {
        Ok(total) => total,
        Err(e) => {
            tracing::error!(pin = %pin, player_id, error = %e, "Score update failed");
            return Ok(());
        },
    };

    state.write_queue.enqueue(DbOp::SaveAnswer {
        game_id: game.instance.id,
        player_id,
        question_index: game.instance.current_index(),
        option_index: submitted.option_index,
        correct,
        points,
        response_time_ms: submitted.response_time_ms,
        submitted_at: now,
    });
    state.write_queue.enqueue(DbOp::UpdatePlayerScore {
        game_id: game.instance.id,
        player_id,
        score: total_score,
    });

    send(state, socket, &ServerEvent::AnswerResult {
        correct,
        correct_answer: question.correct_index,
        points,
        total_score,
        response_time: submitted.response_time_ms,
    })
    .await;
    broadcast_to_room(
        &state.sessions,
        &game,
        RoomKind::Moderators,
        &ServerEvent::LiveStats {
            answered_count: game.instance.answered_count(),
            answer_stats: game.instance.answer_stats(),
        },
    )
    .await;
    broadcast_state(&state.sessions, &mut game, false).await;
    Ok(())
}

/// RESULTS → WAITING while questions remain; past the last question the
/// game finishes with the same broadcasts as an explicit end.
async fn handle_next_question(
    state: &AppState,
    socket: SocketId,
    pin: &str,
) -> Result<(), StoreError> {
    let Some(game) = authorized_game(state, socket, pin).await else {
        return Ok(());
    };
    let mut game = game.lock().await;
    let now = now_ms();
    match game.instance.next_question(now) {
        Ok(true) => {
            broadcast_state(&state.sessions, &mut game, true).await;
            state.write_queue.enqueue(DbOp::UpdateGameState {
                game_id: game.instance.id,
                status: Phase::Waiting.as_str().to_string(),
                current_question_index: game.instance.current_index(),
                question_start_time: None,
            });
            tracing::info!(
                pin = %pin,
                question = game.instance.current_index(),
                "Advanced to next question"
            );
        },
        Ok(false) => {
            broadcast_game_over(state, &mut game).await;
            state.write_queue.enqueue(DbOp::UpdateGameState {
                game_id: game.instance.id,
                status: Phase::Finished.as_str().to_string(),
                current_question_index: game.instance.current_index(),
                question_start_time: None,
            });
            tracing::info!(pin = %pin, "Last question done, game finished");
        },
        Err(e) => {
            tracing::debug!(pin = %pin, error = %e, "next_question rejected");
            send(state, socket, &ServerEvent::ServerError {
                message: "Ďalšiu otázku nie je možné spustiť".to_string(),
            })
            .await;
        },
    }
    Ok(())
}

// ---- game end, reset, leave ----

async fn handle_end_game(
    state: &AppState,
    socket: SocketId,
    pin: &str,
) -> Result<(), StoreError> {
    let Some(game) = authorized_game(state, socket, pin).await else {
        return Ok(());
    };
    let mut game = game.lock().await;
    let now = now_ms();
    game.instance.end_game(now);
    broadcast_game_over(state, &mut game).await;

    state.write_queue.enqueue(DbOp::UpdateGameState {
        game_id: game.instance.id,
        status: Phase::Finished.as_str().to_string(),
        current_question_index: game.instance.current_index(),
        question_start_time: None,
    });
    tracing::info!(pin = %pin, "Game ended");
    Ok(())
}

/// Reset a finished game back to a fresh lobby. The roster is wiped in
/// memory and in the store (answers stay for reporting); kicked player
/// sockets are told to rejoin.
async fn handle_reset_game(
    state: &AppState,
    socket: SocketId,
    pin: &str,
) -> Result<(), StoreError> {
    let Some(game) = authorized_game(state, socket, pin).await else {
        return Ok(());
    };
    let mut game = game.lock().await;
    let kicked: Vec<SocketId> = game.instance.player_sockets().collect();
    let now = now_ms();
    if let Err(e) = game.instance.reset_game(now) {
        tracing::debug!(pin = %pin, error = %e, "reset_game rejected");
        send(state, socket, &ServerEvent::ServerError {
            message: "Hru je možné reštartovať až po skončení".to_string(),
        })
        .await;
        return Ok(());
    }
    game.cancel_timer();

    let removed = state.store.remove_all_players_from_game(game.instance.id)?;
    state.write_queue.enqueue(DbOp::UpdateGameState {
        game_id: game.instance.id,
        status: Phase::Waiting.as_str().to_string(),
        current_question_index: 0,
        question_start_time: None,
    });

    // The reset instance no longer owns these sockets, so tell them
    // directly before their sessions are dropped.
    {
        let mut sessions = state.sessions.write().await;
        let notice = ServerEvent::GameStateUpdate(serde_json::json!({
            "status": Phase::Waiting.as_str(),
            "message": "Hra bola reštartovaná, pripojte sa znova",
        }));
        sessions.send_to_many(kicked.iter().copied(), &notice);
        for player_socket in kicked {
            sessions.clear_session(player_socket);
        }
    }

    let leaderboard = game
        .instance
        .leaderboard_top(state.config.limits.panel_leaderboard_size);
    broadcast_to_room(
        &state.sessions,
        &game,
        RoomKind::Panels,
        &ServerEvent::PanelLeaderboardUpdate { leaderboard },
    )
    .await;
    broadcast_state(&state.sessions, &mut game, true).await;
    tracing::info!(pin = %pin, removed, "Game reset to a fresh lobby");
    Ok(())
}

async fn handle_leave_game(
    state: &AppState,
    socket: SocketId,
    pin: &str,
    player_token: &str,
) -> Result<(), StoreError> {
    let Some(game) = state.games.get(pin).await else {
        return Ok(());
    };
    let mut game = game.lock().await;
    let found = game
        .instance
        .players()
        .find(|(_, p)| auth::tokens_match(&p.token, player_token))
        .map(|(id, p)| (id, p.display_name.clone()));
    let Some((player_id, player_name)) = found else {
        tracing::debug!(pin = %pin, "leave_game with unknown token");
        return Ok(());
    };

    let now = now_ms();
    game.instance.remove_player(player_id, true, now);
    state.write_queue.enqueue(DbOp::RemovePlayer {
        game_id: game.instance.id,
        player_id,
    });
    state.sessions.write().await.clear_session(socket);

    let left = ServerEvent::PlayerLeft {
        player_name,
        total_players: game.instance.player_count(),
    };
    broadcast_to_room(&state.sessions, &game, RoomKind::Moderators, &left).await;
    broadcast_to_room(&state.sessions, &game, RoomKind::Panels, &left).await;
    broadcast_state(&state.sessions, &mut game, false).await;
    tracing::info!(pin = %pin, player_id, "Player left");
    Ok(())
}

// ---- helpers ----

/// Final-results broadcasts shared by `end_game` and the last
/// `next_question`: dashboards and panels get the full leaderboard,
/// everyone gets the forced terminal state.
async fn broadcast_game_over(state: &AppState, game: &mut ActiveGame) {
    game.cancel_timer();
    let payload = GameEndedPayload {
        total_players: game.instance.player_count(),
        total_questions: game.instance.question_count(),
        leaderboard: game.instance.leaderboard(),
    };
    broadcast_to_room(
        &state.sessions,
        game,
        RoomKind::Moderators,
        &ServerEvent::GameEndedDashboard(payload.clone()),
    )
    .await;
    broadcast_to_room(
        &state.sessions,
        game,
        RoomKind::Panels,
        &ServerEvent::PanelGameEnded(payload),
    )
    .await;
    broadcast_state(&state.sessions, game, true).await;
}

async fn send(state: &AppState, socket: SocketId, event: &ServerEvent) {
    state.sessions.read().await.send_to(socket, event);
}

async fn join_error(state: &AppState, socket: SocketId, message: &str) -> Result<(), StoreError> {
    send(state, socket, &ServerEvent::JoinError {
        message: message.to_string(),
    })
    .await;
    Ok(())
}

fn game_limits(state: &AppState) -> GameLimits {
    GameLimits {
        max_players: state.config.limits.max_players_per_game,
        max_answer_buffer: state.config.limits.max_answer_buffer,
    }
}

/// Resolve a moderator-only operation: the socket must hold a moderator
/// session for this PIN and the game must be live in memory.
async fn authorized_game(
    state: &AppState,
    socket: SocketId,
    pin: &str,
) -> Option<Arc<Mutex<ActiveGame>>> {
    let session = state.sessions.read().await.session(socket);
    match session {
        Some(SessionInfo {
            role: Role::Moderator,
            pin: session_pin,
            ..
        }) if session_pin == pin => {},
        _ => {
            tracing::debug!(socket, pin = %pin, "Unauthorized moderator operation");
            send(state, socket, &ServerEvent::ServerError {
                message: "Nemáte oprávnenie moderátora".to_string(),
            })
            .await;
            return None;
        },
    }
    let game = state.games.get(pin).await;
    if game.is_none() {
        send(state, socket, &ServerEvent::ServerError {
            message: "Hra neexistuje".to_string(),
        })
        .await;
    }
    game
}

/// Look a game up in memory, rehydrating it from the store when the
/// process restarted or the instance was evicted while idle.
pub async fn get_or_restore_game(
    state: &AppState,
    pin: &str,
) -> Result<Option<Arc<Mutex<ActiveGame>>>, StoreError> {
    if let Some(game) = state.games.get(pin).await {
        return Ok(Some(game));
    }
    let Some(record) = state.store.get_game_by_pin(pin)? else {
        return Ok(None);
    };

    let now = now_ms();
    let mut instance = GameInstance::new(
        record.game.id,
        pin.to_string(),
        record.questions,
        game_limits(state),
        now,
    );
    let phase = Phase::parse(&record.game.status).unwrap_or(Phase::Finished);
    instance.restore_state(
        phase,
        record.game.current_question_index,
        record.game.question_start_time,
    );
    for player in state.store.get_players_for_game(record.game.id)? {
        instance
            .add_player(
                player.ordinal,
                Some(player.display_name),
                player.score,
                player.token,
                player.last_seen,
            )
            .ok();
        if !player.connected {
            instance.remove_player(player.ordinal, false, player.last_seen);
        }
    }
    // Mid-question restarts re-seed the answer buffer so players who
    // already answered stay locked out and the end-of-question stats hold.
    if phase == Phase::QuestionActive {
        for (player_id, option, response_time, submitted_at) in state
            .store
            .get_answers_for_question(record.game.id, record.game.current_question_index)?
        {
            instance.restore_answer(player_id, option, response_time, submitted_at);
        }
    }

    let game = state
        .games
        .get_or_insert(pin.to_string(), ActiveGame::new(instance))
        .await;

    // A question that was running when the process died still has to end.
    if phase == Phase::QuestionActive {
        let mut locked = game.lock().await;
        let deadline = locked
            .instance
            .question_start()
            .zip(locked.instance.current_question())
            .map(|(start, q)| (start + q.time_limit_secs * 1000).saturating_sub(now));
        if let Some(remaining_ms) = deadline {
            let timer = spawn_question_timer(state, pin, Duration::from_millis(remaining_ms));
            locked.arm_timer(timer);
        }
    }
    tracing::info!(pin = %pin, "Game restored from store");
    Ok(Some(game))
}

fn spawn_question_timer(
    state: &AppState,
    pin: &str,
    duration: Duration,
) -> tokio::task::JoinHandle<()> {
    let state = state.clone();
    let pin = pin.to_string();
    tokio::spawn(async move {
        tokio::select! {
            _ = state.shutdown.cancelled() => {},
            _ = tokio::time::sleep(duration) => {
                let Some(game) = state.games.get(&pin).await else {
                    return;
                };
                let mut game = game.lock().await;
                finish_question(&state, &mut game, true).await;
            }
        }
    })
}

fn question_payload(instance: &GameInstance, with_correct: bool) -> Option<QuestionStartedPayload> {
    let question: &Question = instance.current_question()?;
    Some(QuestionStartedPayload {
        question_number: instance.current_index() + 1,
        total_questions: instance.question_count(),
        question: question.text.clone(),
        options: question.options.clone(),
        time_limit_secs: question.time_limit_secs,
        server_time: instance.question_start().unwrap_or_else(now_ms),
        correct_answer: with_correct.then_some(question.correct_index),
    })
}
