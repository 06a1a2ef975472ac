use tracing_subscriber::EnvFilter;

use kviz_server::config::ServerConfig;
use kviz_server::{build_app, spawn_background_tasks};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ServerConfig::load();
    config.validate();
    let listen_addr = config.listen_addr.clone();

    let (app, state) = match build_app(config) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open database");
            std::process::exit(1);
        },
    };
    spawn_background_tasks(&state);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {listen_addr}: {e}"));

    tracing::info!("kviz server listening on {listen_addr}");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
            // Give the write flusher a moment to drain its final batch
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        })
        .await
        .expect("Server error");
}
