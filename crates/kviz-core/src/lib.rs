pub mod events;
pub mod game;
pub mod question;
pub mod time;

/// Persistent identifier of a player within a game (store rowid).
pub type PlayerId = i64;

/// Persistent identifier of a game (store rowid).
pub type GameId = i64;

/// Ephemeral identifier of one WebSocket connection.
pub type SocketId = u64;
