use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use kviz_core::events::{ClientEvent, ServerEvent};
use kviz_core::question::Question;

use kviz_server::auth;
use kviz_server::config::ServerConfig;
use kviz_server::state::AppState;
use kviz_server::{build_app, spawn_background_tasks};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    _server: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a test server on an ephemeral port with an in-memory store
    /// and a fast latency sampler.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let mut config = ServerConfig {
            database_path: ":memory:".to_string(),
            ..ServerConfig::default()
        };
        config.lifecycle.ping_interval_secs = 1;
        tweak(&mut config);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (app, state) = build_app(config).unwrap();
        spawn_background_tasks(&state);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            state,
            _server: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

/// Build `n` valid questions; option 0 is always the correct one.
pub fn make_questions(n: usize, time_limit_secs: u64) -> Vec<Question> {
    (0..n)
        .map(|i| Question {
            text: format!("Otázka {}", i + 1),
            options: vec![
                "správna".to_string(),
                "zlá".to_string(),
                "horšia".to_string(),
                "najhoršia".to_string(),
            ],
            correct_index: 0,
            time_limit_secs,
        })
        .collect()
}

/// Seed a game straight into the store, returning the moderator token.
/// Joining it over the socket exercises the restore-from-store path.
pub fn seed_game(
    state: &AppState,
    pin: &str,
    questions: &[Question],
    password: Option<&str>,
) -> String {
    let token = auth::generate_token();
    let hash = password.map(auth::hash_password);
    state
        .store
        .create_game(pin, questions, hash.as_deref(), &token, kviz_core::time::now_ms())
        .unwrap();
    token
}

pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

pub async fn send_event(stream: &mut WsStream, event: &ClientEvent) {
    let frame = serde_json::to_string(event).unwrap();
    stream.send(Message::Text(frame.into())).await.unwrap();
}

/// Read the next server event (5s timeout), skipping nothing.
pub async fn read_event(stream: &mut WsStream) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<ServerEvent>(text.as_str())
                        .unwrap_or_else(|e| panic!("Undecodable frame {text}: {e}"));
                },
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for server event")
}

/// Read events until one matches, skipping background noise (latency
/// pings, state deltas, live stats).
pub async fn read_until<F>(stream: &mut WsStream, mut matches: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    for _ in 0..50 {
        let event = read_event(stream).await;
        if matches(&event) {
            return event;
        }
    }
    panic!("No matching event within 50 frames");
}

/// Assert that no matching event arrives within `window_ms`.
pub async fn expect_silence<F>(stream: &mut WsStream, window_ms: u64, mut matches: F)
where
    F: FnMut(&ServerEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(window_ms);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        let next = tokio::time::timeout(remaining, stream.next()).await;
        match next {
            Err(_) => return, // window elapsed quietly
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(event) = serde_json::from_str::<ServerEvent>(text.as_str())
                    && matches(&event)
                {
                    panic!("Unexpected event: {event:?}");
                }
            },
            Ok(_) => continue,
        }
    }
}

/// Connect a moderator socket authenticated by token.
pub async fn connect_moderator(server: &TestServer, pin: &str, token: &str) -> WsStream {
    let mut stream = ws_connect(&server.ws_url()).await;
    send_event(&mut stream, &ClientEvent::ReconnectModerator {
        game_pin: pin.to_string(),
        password: None,
        moderator_token: Some(token.to_string()),
    })
    .await;
    let event = read_until(&mut stream, |e| {
        matches!(
            e,
            ServerEvent::ModeratorReconnected { .. } | ServerEvent::ModeratorReconnectError { .. }
        )
    })
    .await;
    assert!(
        matches!(event, ServerEvent::ModeratorReconnected { .. }),
        "Moderator login failed: {event:?}"
    );
    stream
}

/// Connect a player socket and join. Returns (stream, player_id, token).
pub async fn connect_player(server: &TestServer, pin: &str) -> (WsStream, i64, String) {
    let mut stream = ws_connect(&server.ws_url()).await;
    send_event(&mut stream, &ClientEvent::JoinGame {
        game_pin: pin.to_string(),
    })
    .await;
    let event = read_until(&mut stream, |e| {
        matches!(e, ServerEvent::GameJoined { .. } | ServerEvent::JoinError { .. })
    })
    .await;
    match event {
        ServerEvent::GameJoined {
            player_id,
            player_token,
            ..
        } => (stream, player_id, player_token),
        other => panic!("Join failed: {other:?}"),
    }
}
