pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod health;
pub mod protocol;
pub mod rooms;
pub mod sessions;
pub mod state;
pub mod store;
pub mod write_queue;
pub mod ws;

use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;

use kviz_core::events::ServerEvent;
use kviz_core::time::now_ms;

use config::ServerConfig;
use state::AppState;
use store::StoreError;

/// Build the Axum router and application state from a config.
pub fn build_app(config: ServerConfig) -> Result<(Router<()>, AppState), StoreError> {
    let web_root = config.web_root.clone();
    let state = AppState::new(config)?;

    let api_routes = Router::new()
        .route("/game/{pin}", get(api::get_game))
        .route(
            "/games/{pin}/questions",
            get(api::get_questions).put(api::put_questions),
        )
        .route(
            "/question-templates/{category}",
            get(api::get_template).put(api::put_template),
        )
        .layer(ServiceBuilder::new().layer(TimeoutLayer::with_status_code(
            axum::http::StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        )));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check))
        .nest("/api", api_routes)
        .fallback_service(ServeDir::new(&web_root))
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state.clone());

    Ok((app, state))
}

/// Spawn every background task: the write flusher, the latency sampler,
/// the disconnected-player sweep, the abandoned-game eviction, and the
/// daily store reap. All of them stop on the shared cancellation token.
pub fn spawn_background_tasks(state: &AppState) {
    spawn_write_flusher(state.clone());
    spawn_latency_sampler(state.clone());
    spawn_disconnect_sweep(state.clone());
    spawn_idle_game_cleanup(state.clone());
    spawn_store_reaper(state.clone());
}

/// Drain the batched store mutations on size and timeout triggers.
pub fn spawn_write_flusher(state: AppState) {
    let Some(rx) = state.take_write_rx() else {
        tracing::warn!("Write flusher already running");
        return;
    };
    tokio::spawn(write_queue::run_flusher(
        std::sync::Arc::clone(&state.store),
        rx,
        state.config.limits.write_batch_size,
        state.config.limits.write_batch_timeout_ms,
        state.shutdown.clone(),
    ));
}

/// Periodically ping every live socket; pongs feed the per-socket latency
/// estimates used to compensate answer response times.
pub fn spawn_latency_sampler(state: AppState) {
    let interval_secs = state.config.lifecycle.ping_interval_secs;
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Latency sampler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let now = now_ms();
                    let mut sessions = state.sessions.write().await;
                    for socket in sessions.sockets() {
                        sessions.note_ping(socket, now);
                        sessions.send_to(socket, &ServerEvent::LatencyPing(now));
                    }
                }
            }
        }
    });
}

/// Remove players whose disconnected age exceeded the TTL, propagating the
/// deletions to the store.
pub fn spawn_disconnect_sweep(state: AppState) {
    let interval_secs = state.config.lifecycle.disconnect_sweep_interval_secs;
    let ttl_ms = state.config.lifecycle.disconnect_ttl_secs * 1000;
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Disconnect sweep shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let now = now_ms();
                    for pin in state.games.pins().await {
                        let Some(game) = state.games.get(&pin).await else {
                            continue;
                        };
                        let mut game = game.lock().await;
                        let removed = game.instance.sweep_disconnected(ttl_ms, now);
                        if removed.is_empty() {
                            continue;
                        }
                        for player_id in &removed {
                            state.write_queue.enqueue(write_queue::DbOp::RemovePlayer {
                                game_id: game.instance.id,
                                player_id: *player_id,
                            });
                        }
                        tracing::info!(
                            pin = %pin,
                            removed = removed.len(),
                            "Swept expired disconnected players"
                        );
                        rooms::broadcast_state(&state.sessions, &mut game, false).await;
                    }
                }
            }
        }
    });
}

/// Evict games with no connected subjects from memory once idle long
/// enough. The store row stays until the reap.
pub fn spawn_idle_game_cleanup(state: AppState) {
    let interval_secs = state.config.lifecycle.idle_sweep_interval_secs;
    let idle_ms = state.config.lifecycle.idle_game_timeout_secs * 1000;
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Idle game cleanup shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let now = now_ms();
                    for pin in state.games.pins().await {
                        let Some(game) = state.games.get(&pin).await else {
                            continue;
                        };
                        let evict = {
                            let mut game = game.lock().await;
                            let idle = now.saturating_sub(game.instance.last_activity) > idle_ms;
                            let abandoned = !game.instance.has_connected_subjects();
                            if idle && abandoned {
                                game.cancel_timer();
                            }
                            idle && abandoned
                        };
                        if evict {
                            state.games.remove(&pin).await;
                            tracing::info!(pin = %pin, "Evicted abandoned game from memory");
                        }
                    }
                }
            }
        }
    });
}

/// Daily reap of persisted games past their retention age.
pub fn spawn_store_reaper(state: AppState) {
    let interval_secs = state.config.lifecycle.reap_interval_secs;
    let ttl_ms = state.config.lifecycle.game_ttl_hours * 3_600_000;
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Store reaper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let store = std::sync::Arc::clone(&state.store);
                    let cutoff = now_ms().saturating_sub(ttl_ms);
                    let result = tokio::task::spawn_blocking(move || {
                        store.cleanup_old_games(cutoff)
                    })
                    .await;
                    match result {
                        Ok(Ok(0)) => {},
                        Ok(Ok(removed)) => {
                            tracing::info!(removed, "Reaped expired games from store");
                        },
                        Ok(Err(e)) => tracing::error!(error = %e, "Store reap failed"),
                        Err(e) => tracing::error!(error = %e, "Store reap task panicked"),
                    }
                }
            }
        }
    });
}
