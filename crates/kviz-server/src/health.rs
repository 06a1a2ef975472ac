use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

/// Structured health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: usize,
    pub games: GameInfo,
}

#[derive(Serialize)]
pub struct GameInfo {
    pub active: usize,
}

/// Structured health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.connection_count.load(Ordering::Relaxed),
        games: GameInfo {
            active: state.games.count().await,
        },
    })
}

/// Readiness check — verifies the store answers queries.
pub async fn readiness_check(State(state): State<AppState>) -> &'static str {
    match state.store.get_game_by_pin("000000") {
        Ok(_) => "ready",
        Err(_) => "not ready: store unreachable",
    }
}
