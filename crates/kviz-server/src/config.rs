use serde::Deserialize;

/// Top-level server configuration, loaded from `kviz.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub web_root: String,
    /// SQLite database path. `:memory:` keeps everything in RAM (tests).
    pub database_path: String,
    pub limits: LimitsConfig,
    pub game: GameConfig,
    pub lifecycle: LifecycleConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            web_root: "web".to_string(),
            database_path: "kviz.db".to_string(),
            limits: LimitsConfig::default(),
            game: GameConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

/// Infrastructure limits (connection caps, buffer sizes, batching).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Global cap on concurrent WebSocket connections.
    pub max_connections: usize,
    /// Cap on concurrently connected players per game.
    pub max_players_per_game: usize,
    /// Cap on the per-question answer ring buffer.
    pub max_answer_buffer: usize,
    /// Per-socket outbound message buffer; slow clients past this are skipped.
    pub outbound_buffer: usize,
    /// Flush the write queue when it holds this many operations.
    pub write_batch_size: usize,
    /// Flush the write queue at least this often.
    pub write_batch_timeout_ms: u64,
    /// Leaderboard rows included in panel broadcasts.
    pub panel_leaderboard_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_players_per_game: 300,
            max_answer_buffer: 500,
            outbound_buffer: 256,
            write_batch_size: 50,
            write_batch_timeout_ms: 100,
            panel_leaderboard_size: 10,
        }
    }
}

/// Gameplay policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Admit new players after the first question has started.
    pub allow_late_join: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            allow_late_join: true,
        }
    }
}

/// Periodic task cadence and retention.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Latency ping fan-out interval.
    pub ping_interval_secs: u64,
    /// Disconnected-player sweep interval.
    pub disconnect_sweep_interval_secs: u64,
    /// How long a disconnected player's slot survives before removal.
    pub disconnect_ttl_secs: u64,
    /// Abandoned-game eviction interval.
    pub idle_sweep_interval_secs: u64,
    /// Idle age after which a game with no connected subjects leaves memory.
    pub idle_game_timeout_secs: u64,
    /// Store reap interval.
    pub reap_interval_secs: u64,
    /// Persisted games older than this are deleted by the reap.
    pub game_ttl_hours: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 5,
            disconnect_sweep_interval_secs: 60,
            disconnect_ttl_secs: 600,
            idle_sweep_interval_secs: 300,
            idle_game_timeout_secs: 1800,
            reap_interval_secs: 86_400,
            game_ttl_hours: 24,
        }
    }
}

impl ServerConfig {
    /// Validate configuration, exiting on values the server cannot run with.
    pub fn validate(&self) {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            tracing::error!(
                addr = %self.listen_addr,
                "listen_addr is not a valid socket address"
            );
            std::process::exit(1);
        }
        if self.database_path.is_empty() {
            tracing::error!("database_path must not be empty");
            std::process::exit(1);
        }
        if self.limits.max_connections == 0 {
            tracing::error!("limits.max_connections must be > 0");
            std::process::exit(1);
        }
        if self.limits.max_players_per_game == 0 {
            tracing::error!("limits.max_players_per_game must be > 0");
            std::process::exit(1);
        }
        if self.limits.max_answer_buffer == 0 {
            tracing::error!("limits.max_answer_buffer must be > 0");
            std::process::exit(1);
        }
        if self.limits.outbound_buffer == 0 {
            tracing::error!("limits.outbound_buffer must be > 0");
            std::process::exit(1);
        }
        if self.limits.write_batch_size == 0 {
            tracing::error!("limits.write_batch_size must be > 0");
            std::process::exit(1);
        }
        if self.limits.write_batch_timeout_ms == 0 {
            tracing::error!("limits.write_batch_timeout_ms must be > 0");
            std::process::exit(1);
        }
        if self.lifecycle.ping_interval_secs == 0 {
            tracing::error!("lifecycle.ping_interval_secs must be > 0");
            std::process::exit(1);
        }
        if self.lifecycle.disconnect_sweep_interval_secs == 0 {
            tracing::error!("lifecycle.disconnect_sweep_interval_secs must be > 0");
            std::process::exit(1);
        }
        if self.lifecycle.idle_sweep_interval_secs == 0 {
            tracing::error!("lifecycle.idle_sweep_interval_secs must be > 0");
            std::process::exit(1);
        }
        if self.lifecycle.reap_interval_secs == 0 {
            tracing::error!("lifecycle.reap_interval_secs must be > 0");
            std::process::exit(1);
        }
        if self.lifecycle.game_ttl_hours == 0 {
            tracing::error!("lifecycle.game_ttl_hours must be > 0");
            std::process::exit(1);
        }
    }

    /// Load config from `kviz.toml` if it exists, then apply env overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string("kviz.toml") {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!("Loaded configuration from kviz.toml");
                    cfg
                },
                Err(e) => {
                    tracing::warn!("Failed to parse kviz.toml: {e}, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!("No kviz.toml found, using defaults");
                ServerConfig::default()
            },
        };

        if let Ok(addr) = std::env::var("KVIZ_LISTEN_ADDR")
            && !addr.is_empty()
        {
            config.listen_addr = addr;
        }
        if let Ok(root) = std::env::var("KVIZ_WEB_ROOT")
            && !root.is_empty()
        {
            config.web_root = root;
        }
        if let Ok(path) = std::env::var("KVIZ_DATABASE_PATH")
            && !path.is_empty()
        {
            config.database_path = path;
        }
        if let Ok(val) = std::env::var("KVIZ_MAX_CONNECTIONS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.limits.max_connections = n;
        }
        if let Ok(val) = std::env::var("KVIZ_MAX_PLAYERS_PER_GAME")
            && let Ok(n) = val.parse::<usize>()
        {
            config.limits.max_players_per_game = n;
        }
        if let Ok(val) = std::env::var("KVIZ_WRITE_BATCH_SIZE")
            && let Ok(n) = val.parse::<usize>()
        {
            config.limits.write_batch_size = n;
        }
        if let Ok(val) = std::env::var("KVIZ_GAME_TTL_HOURS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.lifecycle.game_ttl_hours = n;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.database_path, "kviz.db");
        assert_eq!(cfg.limits.max_connections, 1000);
        assert_eq!(cfg.limits.max_players_per_game, 300);
        assert_eq!(cfg.limits.max_answer_buffer, 500);
        assert_eq!(cfg.limits.write_batch_size, 50);
        assert_eq!(cfg.limits.write_batch_timeout_ms, 100);
        assert_eq!(cfg.lifecycle.disconnect_ttl_secs, 600);
        assert_eq!(cfg.lifecycle.game_ttl_hours, 24);
        assert!(cfg.game.allow_late_join);
    }

    #[test]
    fn parse_minimal_toml() {
        let toml_str = r#"
listen_addr = "127.0.0.1:9090"
database_path = "/var/lib/kviz/kviz.db"
"#;
        let cfg: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9090");
        assert_eq!(cfg.database_path, "/var/lib/kviz/kviz.db");
        // Missing sections fall back to defaults
        assert_eq!(cfg.limits.max_connections, 1000);
        assert_eq!(cfg.lifecycle.ping_interval_secs, 5);
    }

    #[test]
    fn parse_full_toml() {
        let toml_str = r#"
listen_addr = "0.0.0.0:3000"

[limits]
max_connections = 2000
max_players_per_game = 100
write_batch_size = 25
write_batch_timeout_ms = 50

[game]
allow_late_join = false

[lifecycle]
disconnect_ttl_secs = 120
game_ttl_hours = 48
"#;
        let cfg: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.limits.max_connections, 2000);
        assert_eq!(cfg.limits.max_players_per_game, 100);
        assert_eq!(cfg.limits.write_batch_size, 25);
        assert_eq!(cfg.limits.write_batch_timeout_ms, 50);
        assert!(!cfg.game.allow_late_join);
        assert_eq!(cfg.lifecycle.disconnect_ttl_secs, 120);
        assert_eq!(cfg.lifecycle.game_ttl_hours, 48);
    }

    #[test]
    fn validate_accepts_defaults() {
        ServerConfig::default().validate();
    }

    #[test]
    fn invalid_addr_detected() {
        let cfg = ServerConfig {
            listen_addr: "not-an-address".to_string(),
            ..ServerConfig::default()
        };
        // validate() exits the process, so assert on the underlying check
        assert!(cfg.listen_addr.parse::<std::net::SocketAddr>().is_err());
    }
}
