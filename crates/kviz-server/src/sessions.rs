use std::collections::HashMap;

use tokio::sync::mpsc;

use kviz_core::events::{ServerEvent, encode_server_event};
use kviz_core::{PlayerId, SocketId};

/// Per-socket sender for outbound JSON text frames. Bounded so a slow
/// client backs up its own channel, never the broadcaster.
pub type OutboundSender = mpsc::Sender<String>;

/// What a connected socket currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Player,
    Moderator,
    Panel,
}

/// The game a socket is attached to, set on join/reconnect.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub role: Role,
    pub pin: String,
    /// Set for players only.
    pub player_id: Option<PlayerId>,
}

struct Connection {
    sender: OutboundSender,
    /// Last half-RTT estimate in milliseconds, 0 until the first pong.
    latency_ms: u64,
    /// Timestamp of the ping currently in flight.
    pending_ping: Option<u64>,
    session: Option<SessionInfo>,
}

/// Maps live sockets to their outbound channels, session bindings, and
/// latency estimates.
#[derive(Default)]
pub struct SessionRegistry {
    connections: HashMap<SocketId, Connection>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, socket: SocketId, sender: OutboundSender) {
        self.connections.insert(
            socket,
            Connection {
                sender,
                latency_ms: 0,
                pending_ping: None,
                session: None,
            },
        );
    }

    /// Drop a socket entirely, returning its session binding if it had one.
    pub fn unregister(&mut self, socket: SocketId) -> Option<SessionInfo> {
        self.connections.remove(&socket).and_then(|c| c.session)
    }

    pub fn bind(&mut self, socket: SocketId, session: SessionInfo) {
        if let Some(conn) = self.connections.get_mut(&socket) {
            conn.session = Some(session);
        }
    }

    pub fn clear_session(&mut self, socket: SocketId) {
        if let Some(conn) = self.connections.get_mut(&socket) {
            conn.session = None;
        }
    }

    pub fn session(&self, socket: SocketId) -> Option<SessionInfo> {
        self.connections.get(&socket).and_then(|c| c.session.clone())
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    // ---- latency tracking ----

    /// Snapshot of the socket's latency estimate, 0 when unknown.
    pub fn latency(&self, socket: SocketId) -> u64 {
        self.connections
            .get(&socket)
            .map(|c| c.latency_ms)
            .unwrap_or(0)
    }

    pub fn note_ping(&mut self, socket: SocketId, ts: u64) {
        if let Some(conn) = self.connections.get_mut(&socket) {
            conn.pending_ping = Some(ts);
        }
    }

    /// Record a pong. The echo must match the pending probe registered by
    /// `note_ping`; a stale or fabricated timestamp is ignored so clients
    /// cannot steer their own latency estimate. On a match, RTT is the gap
    /// between now and the probe timestamp and half of it becomes the
    /// estimate. A missing pong simply leaves the previous estimate in
    /// place.
    pub fn record_pong(&mut self, socket: SocketId, echoed_ts: u64, now: u64) {
        if let Some(conn) = self.connections.get_mut(&socket) {
            if conn.pending_ping != Some(echoed_ts) {
                tracing::debug!(socket, echoed_ts, "Ignoring pong for an unknown probe");
                return;
            }
            let rtt = now.saturating_sub(echoed_ts);
            conn.latency_ms = rtt / 2;
            conn.pending_ping = None;
        }
    }

    /// All live sockets, for the ping sampler.
    pub fn sockets(&self) -> Vec<SocketId> {
        self.connections.keys().copied().collect()
    }

    // ---- outbound ----

    /// Send one event to one socket. Slow or closed channels are skipped
    /// with a debug log, never awaited.
    pub fn send_to(&self, socket: SocketId, event: &ServerEvent) {
        let Some(conn) = self.connections.get(&socket) else {
            return;
        };
        match encode_server_event(event) {
            Ok(frame) => {
                if let Err(e) = conn.sender.try_send(frame) {
                    tracing::debug!(socket, error = %e, "Skipping send to slow client");
                }
            },
            Err(e) => tracing::error!(error = %e, "Failed to encode server event"),
        }
    }

    /// Fan one event out to many sockets, encoding once.
    pub fn send_to_many<I: IntoIterator<Item = SocketId>>(&self, sockets: I, event: &ServerEvent) {
        let frame = match encode_server_event(event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode server event");
                return;
            },
        };
        for socket in sockets {
            if let Some(conn) = self.connections.get(&socket)
                && let Err(e) = conn.sender.try_send(frame.clone())
            {
                tracing::debug!(socket, error = %e, "Skipping broadcast to slow client");
            }
        }
    }
}
