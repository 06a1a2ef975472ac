//! The wire protocol: named events with JSON payloads. Each frame is a
//! text message of the shape `{"event": "<name>", "data": <payload>}`;
//! event names are snake_case, payload fields camelCase. Payloads are
//! strongly typed here and validated by serde at the boundary.

use serde::{Deserialize, Serialize};

use crate::PlayerId;
use crate::game::{AnswerStat, LeaderboardEntry};

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    CreateGame {
        #[serde(default)]
        category: Option<String>,
        #[serde(default)]
        custom_pin: Option<String>,
        #[serde(default)]
        moderator_password: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    JoinGame { game_pin: String },
    #[serde(rename_all = "camelCase")]
    ReconnectPlayer {
        game_pin: String,
        player_token: String,
    },
    #[serde(rename_all = "camelCase")]
    ReconnectModerator {
        game_pin: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        moderator_token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    JoinPanel { game_pin: String },
    #[serde(rename_all = "camelCase")]
    StartQuestion { game_pin: String },
    #[serde(rename_all = "camelCase")]
    EndQuestion { game_pin: String },
    #[serde(rename_all = "camelCase")]
    NextQuestion { game_pin: String },
    #[serde(rename_all = "camelCase")]
    EndGame { game_pin: String },
    #[serde(rename_all = "camelCase")]
    ResetGame { game_pin: String },
    /// The client-side timestamp is advisory; scoring uses the server
    /// clock minus the socket's measured latency.
    #[serde(rename_all = "camelCase")]
    SubmitAnswer {
        answer: usize,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    LeaveGame {
        game_pin: String,
        player_token: String,
    },
    /// Echo of a `latency_ping` server timestamp.
    LatencyPong(u64),
}

/// A player as shown to moderators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub id: PlayerId,
    pub name: String,
    pub score: u32,
    pub connected: bool,
}

/// Payload shared by `question_ended` and `question_ended_dashboard`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionEndedPayload {
    pub correct_answer: usize,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub answer_stats: Vec<AnswerStat>,
    pub total_answers: u64,
    pub total_players: usize,
    pub can_continue: bool,
}

/// Payload shared by `game_ended_dashboard` and `panel_game_ended`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEndedPayload {
    pub total_players: usize,
    pub total_questions: usize,
    pub leaderboard: Vec<LeaderboardEntry>,
}

/// Payload shared by `question_started` and `question_started_dashboard`;
/// the dashboard variant carries the correct index, players and panels
/// never see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionStartedPayload {
    pub question_number: usize,
    pub total_questions: usize,
    pub question: String,
    pub options: Vec<String>,
    #[serde(rename = "timeLimit")]
    pub time_limit_secs: u64,
    pub server_time: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correct_answer: Option<usize>,
}

/// Events the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    GameCreated {
        game_pin: String,
        question_count: usize,
        moderator_token: String,
    },
    #[serde(rename_all = "camelCase")]
    CreateGameError { message: String },
    #[serde(rename_all = "camelCase")]
    GameJoined {
        game_pin: String,
        player_id: PlayerId,
        player_name: String,
        player_token: String,
        players_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    JoinError { message: String },
    #[serde(rename_all = "camelCase")]
    PlayerReconnected {
        game_pin: String,
        player_id: PlayerId,
        player_name: String,
        score: u32,
        game_status: String,
    },
    #[serde(rename_all = "camelCase")]
    ReconnectError { message: String },
    #[serde(rename_all = "camelCase")]
    ModeratorReconnected {
        game_pin: String,
        status: String,
        players: Vec<PlayerView>,
        total_players: usize,
        current_question_index: usize,
        question_count: usize,
        moderator_token: String,
    },
    #[serde(rename_all = "camelCase")]
    ModeratorReconnectError { message: String },
    #[serde(rename_all = "camelCase")]
    PanelGameJoined {
        game_pin: String,
        question_count: usize,
        game_status: String,
    },
    #[serde(rename_all = "camelCase")]
    PanelJoinError { message: String },
    QuestionStarted(QuestionStartedPayload),
    QuestionStartedDashboard(QuestionStartedPayload),
    QuestionEnded(QuestionEndedPayload),
    QuestionEndedDashboard(QuestionEndedPayload),
    #[serde(rename_all = "camelCase")]
    PlayerJoined {
        player_name: String,
        total_players: usize,
    },
    #[serde(rename_all = "camelCase")]
    PlayerLeft {
        player_name: String,
        total_players: usize,
    },
    #[serde(rename_all = "camelCase")]
    LiveStats {
        answered_count: usize,
        answer_stats: Vec<AnswerStat>,
    },
    #[serde(rename_all = "camelCase")]
    PanelLeaderboardUpdate { leaderboard: Vec<LeaderboardEntry> },
    /// Authoritative state broadcast. The payload is the role-shaped state
    /// blob, or a delta of its changed top-level fields.
    GameStateUpdate(serde_json::Value),
    #[serde(rename_all = "camelCase")]
    AnswerResult {
        correct: bool,
        correct_answer: usize,
        points: u32,
        total_score: u32,
        response_time: u64,
    },
    GameEndedDashboard(GameEndedPayload),
    PanelGameEnded(GameEndedPayload),
    LatencyPing(u64),
    #[serde(rename_all = "camelCase")]
    ConnectionRejected { message: String },
    /// Catch-all for unexpected internal failures; the connection stays up.
    #[serde(rename_all = "camelCase")]
    ServerError { message: String },
}

/// Encode a server event as a JSON text frame.
pub fn encode_server_event(event: &ServerEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

/// Decode a client text frame.
pub fn decode_client_event(text: &str) -> serde_json::Result<ClientEvent> {
    serde_json::from_str(text)
}
