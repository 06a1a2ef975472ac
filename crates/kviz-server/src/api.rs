use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use kviz_core::game::Phase;
use kviz_core::question::{Question, validate_questions};

use crate::auth;
use crate::error::AppError;
use crate::state::AppState;

/// Response for `GET /api/game/{pin}` — the pre-join lookup.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub pin: String,
    pub status: String,
    pub question_count: usize,
    pub current_question_index: usize,
}

/// Body shared by the question CRUD and template endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct QuestionsBody {
    pub questions: Vec<Question>,
}

/// GET /api/game/{pin} — lightweight lookup clients use before joining.
/// Prefers the live instance over the (write-batched, slightly lagging)
/// store row.
pub async fn get_game(
    State(state): State<AppState>,
    Path(pin): Path<String>,
) -> Result<Json<GameSummary>, AppError> {
    if let Some(game) = state.games.get(&pin).await {
        let game = game.lock().await;
        return Ok(Json(GameSummary {
            pin,
            status: game.instance.phase().as_str().to_string(),
            question_count: game.instance.question_count(),
            current_question_index: game.instance.current_index(),
        }));
    }
    let record = state
        .store
        .get_game_by_pin(&pin)?
        .ok_or_else(|| AppError::NotFound(format!("No game with PIN {pin}")))?;
    Ok(Json(GameSummary {
        pin,
        status: record.game.status,
        question_count: record.questions.len(),
        current_question_index: record.game.current_question_index,
    }))
}

/// GET /api/games/{pin}/questions — the moderator editor's read side.
pub async fn get_questions(
    State(state): State<AppState>,
    Path(pin): Path<String>,
) -> Result<Json<QuestionsBody>, AppError> {
    let record = state
        .store
        .get_game_by_pin(&pin)?
        .ok_or_else(|| AppError::NotFound(format!("No game with PIN {pin}")))?;
    Ok(Json(QuestionsBody {
        questions: record.questions,
    }))
}

/// PUT /api/games/{pin}/questions — atomic replace of the question set.
/// Requires the game's moderator token as a bearer credential; rejected
/// once the game is past the lobby.
pub async fn put_questions(
    State(state): State<AppState>,
    Path(pin): Path<String>,
    headers: HeaderMap,
    Json(body): Json<QuestionsBody>,
) -> Result<Json<QuestionsBody>, AppError> {
    let record = state
        .store
        .get_game_by_pin(&pin)?
        .ok_or_else(|| AppError::NotFound(format!("No game with PIN {pin}")))?;

    let token = bearer_token(&headers)
        .ok_or_else(|| AppError::Unauthorized("Missing moderator token".to_string()))?;
    if !auth::tokens_match(token, &record.game.moderator_token) {
        return Err(AppError::Unauthorized("Invalid moderator token".to_string()));
    }

    validate_questions(&body.questions).map_err(AppError::BadRequest)?;

    let phase = Phase::parse(&record.game.status).unwrap_or(Phase::Finished);
    match phase {
        Phase::Waiting => {},
        Phase::Finished => {
            return Err(AppError::Conflict("Game already finished".to_string()));
        },
        _ => {
            return Err(AppError::Conflict("Game is running".to_string()));
        },
    }

    state
        .store
        .update_game_questions(record.game.id, &body.questions)?;
    if let Some(game) = state.games.get(&pin).await {
        let mut game = game.lock().await;
        if game.instance.phase() == Phase::Waiting {
            game.instance.set_questions(body.questions.clone());
        }
    }
    Ok(Json(body))
}

/// GET /api/question-templates/{category} — the shared template store.
pub async fn get_template(
    State(state): State<AppState>,
    Path(category): Path<String>,
) -> Result<Json<QuestionsBody>, AppError> {
    let questions = state
        .store
        .get_template(&category)?
        .ok_or_else(|| AppError::NotFound(format!("No template for category {category}")))?;
    Ok(Json(QuestionsBody { questions }))
}

/// PUT /api/question-templates/{category}
pub async fn put_template(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Json(body): Json<QuestionsBody>,
) -> Result<Json<QuestionsBody>, AppError> {
    if category.trim().is_empty() {
        return Err(AppError::BadRequest("Category must not be empty".to_string()));
    }
    validate_questions(&body.questions).map_err(AppError::BadRequest)?;
    state.store.put_template(&category, &body.questions)?;
    Ok(Json(body))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
