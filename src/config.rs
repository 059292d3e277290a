use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::game::constants::{net, session, tick};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Malformed game config blob: {0}")]
    Blob(#[from] serde_json::Error),
}

/// Host process configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the game socket listener to
    pub bind_address: IpAddr,
    /// Game socket port
    pub port: u16,
    /// Metrics HTTP port
    pub metrics_port: u16,
    /// Maximum number of execution units (one instance each)
    pub worker_count: usize,
    /// Simulation step period
    pub tick_interval_ms: u64,
    /// Network flush period
    pub flush_interval_ms: u64,
    /// Idle keep-alive period
    pub keep_alive_interval_ms: u64,
    /// Host-side inbound batching period
    pub host_flush_interval_ms: u64,
    /// Default per-game capacity
    pub max_players_per_game: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8001,
            metrics_port: 9090,
            worker_count: 4,
            tick_interval_ms: tick::TICK_DURATION_MS,
            flush_interval_ms: tick::FLUSH_DURATION_MS,
            keep_alive_interval_ms: tick::KEEP_ALIVE_MS,
            host_flush_interval_ms: tick::HOST_FLUSH_MS,
            max_players_per_game: session::MAX_PLAYERS,
        }
    }
}

/// Parse `name` from the environment into `slot`, keeping the default on
/// a missing, unparsable or out-of-range value
fn env_override<T>(name: &str, slot: &mut T, valid: impl Fn(&T) -> bool)
where
    T: std::str::FromStr,
{
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(parsed) if valid(&parsed) => *slot = parsed,
        Ok(_) => tracing::warn!("{} '{}' out of range, using default", name, raw),
        Err(_) => tracing::warn!("Invalid {} '{}', using default", name, raw),
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        env_override("BIND_ADDRESS", &mut config.bind_address, |_| true);
        env_override("PORT", &mut config.port, |p| *p > 0);
        env_override("METRICS_PORT", &mut config.metrics_port, |p| *p > 0);
        env_override("WORKER_COUNT", &mut config.worker_count, |n| {
            (1..=1024).contains(n)
        });
        env_override("TICK_INTERVAL_MS", &mut config.tick_interval_ms, |ms| {
            (1..=1000).contains(ms)
        });
        env_override("FLUSH_INTERVAL_MS", &mut config.flush_interval_ms, |ms| {
            (1..=1000).contains(ms)
        });
        env_override(
            "KEEP_ALIVE_INTERVAL_MS",
            &mut config.keep_alive_interval_ms,
            |ms| *ms >= 100,
        );
        env_override(
            "HOST_FLUSH_INTERVAL_MS",
            &mut config.host_flush_interval_ms,
            |ms| (1..=1000).contains(ms),
        );
        env_override(
            "MAX_PLAYERS_PER_GAME",
            &mut config.max_players_per_game,
            |n| (1..=session::MAX_PLAYERS * 4).contains(n),
        );

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port cannot be 0".into()));
        }
        if self.port == self.metrics_port {
            return Err(ConfigError::Invalid(
                "port and metrics_port must differ".into(),
            ));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.tick_interval_ms == 0 || self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick and flush intervals must be > 0".into()));
        }
        if self.keep_alive_interval_ms <= self.tick_interval_ms {
            return Err(ConfigError::Invalid(
                "keep_alive_interval_ms must exceed tick_interval_ms".into(),
            ));
        }
        if self.max_players_per_game == 0 {
            return Err(ConfigError::Invalid(
                "max_players_per_game must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn host_flush_interval(&self) -> Duration {
        Duration::from_millis(self.host_flush_interval_ms)
    }

    /// Per-game settings seeded from the host defaults
    pub fn default_game_config(&self) -> GameConfig {
        GameConfig {
            max_players: self.max_players_per_game,
            ..GameConfig::default()
        }
    }
}

/// Per-instance settings, carried as the Create message's JSON blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub map_name: String,
    pub team_mode: u8,
    pub max_players: usize,
    /// Reject joins whose token was never provisioned
    pub require_join_token: bool,
    /// Stop after being empty this long, once someone has joined
    pub empty_timeout_secs: f32,
    /// Stop after this much simulated time
    pub max_duration_secs: f32,
    /// Fixed RNG seed; random when absent
    pub seed: Option<u64>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            map_name: "main".into(),
            team_mode: 1,
            max_players: session::MAX_PLAYERS,
            require_join_token: false,
            empty_timeout_secs: session::EMPTY_TIMEOUT,
            max_duration_secs: session::MAX_DURATION,
            seed: None,
        }
    }
}

impl GameConfig {
    pub fn from_blob(blob: &[u8]) -> Result<Self, ConfigError> {
        let config: GameConfig = serde_json::from_slice(blob)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_blob(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_players == 0 {
            return Err(ConfigError::Invalid("max_players must be at least 1".into()));
        }
        if self.map_name.is_empty() || self.map_name.len() > net::MAX_STRING_LEN {
            return Err(ConfigError::Invalid(format!(
                "map_name must be 1..={} bytes",
                net::MAX_STRING_LEN
            )));
        }
        let positive = |secs: f32| secs.is_finite() && secs > 0.0;
        if !positive(self.empty_timeout_secs) || !positive(self.max_duration_secs) {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        Ok(())
    }
}
