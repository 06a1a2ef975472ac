use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use kviz_core::events::{ServerEvent, decode_client_event, encode_server_event};

use crate::protocol;
use crate::state::{AppState, ConnectionGuard};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    // Admission: over the global cap the socket gets one rejection event
    // and is closed before anything is registered.
    if state.connection_count.load(Ordering::Relaxed) >= state.config.limits.max_connections {
        let (mut sender, _) = socket.split();
        if let Ok(frame) = encode_server_event(&ServerEvent::ConnectionRejected {
            message: "Server je plný, skúste to neskôr".to_string(),
        }) {
            let _ = sender.send(Message::Text(frame.into())).await;
        }
        tracing::warn!("Connection rejected at global cap");
        return;
    }
    let _guard = ConnectionGuard::new(Arc::clone(&state.connection_count));

    let socket_id = state.alloc_socket_id();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<String>(state.config.limits.outbound_buffer);
    state.sessions.write().await.register(socket_id, tx);
    spawn_writer(ws_sender, rx);
    tracing::debug!(socket = socket_id, "Connection opened");

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match decode_client_event(text.as_str()) {
            Ok(event) => protocol::handle_event(&state, socket_id, event).await,
            Err(e) => {
                tracing::debug!(socket = socket_id, error = %e, "Malformed client frame");
                let registry = state.sessions.read().await;
                registry.send_to(socket_id, &ServerEvent::ServerError {
                    message: "Neplatný formát správy".to_string(),
                });
            },
        }
    }

    protocol::handle_disconnect(&state, socket_id).await;
    tracing::debug!(socket = socket_id, "Connection closed");
}

fn spawn_writer(
    mut ws_sender: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });
}
