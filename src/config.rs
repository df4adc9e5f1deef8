use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::game::policy::PolicySpec;
use crate::lobby::manager::LobbyConfig;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the game and debug listeners to
    pub bind_address: IpAddr,
    /// Game traffic port
    pub port: u16,
    /// Metrics and debug HTTP port
    pub debug_port: u16,
    /// Total session capacity
    pub max_sessions: usize,
    /// Ticks (and state broadcasts) per second
    pub target_fps: u32,
    /// Upper bound on any session phase
    pub max_game_seconds: u64,
    pub max_players_per_session: usize,
    /// Pending-action bound for human slots
    pub action_buffer_size: usize,
    /// Known layout names; the first is used when a client names none
    pub layouts: Vec<String>,
    /// Root directory for recorded trajectories
    pub data_dir: PathBuf,
    /// NPC kind name -> policy
    pub npc_policies: HashMap<String, PolicySpec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8000,
            debug_port: 9090,
            max_sessions: 10,
            target_fps: 30,
            max_game_seconds: 120,
            max_players_per_session: 2,
            action_buffer_size: 8,
            layouts: vec!["cramped_room".to_string()],
            data_dir: PathBuf::from("./data"),
            npc_policies: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Defaults, then the JSON file at `CONF_PATH`, then environment
    /// overrides. Call [`validate`](Self::validate) afterwards.
    pub fn load_or_default() -> Self {
        let mut config = match std::env::var("CONF_PATH") {
            Ok(path) => Self::from_file(&path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from '{}': {}, using defaults", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Parse a JSON config file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Apply overrides from `lookup`; invalid values are warned about and
    /// ignored
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = parse_var(&lookup, "BIND_ADDRESS", |_: &IpAddr| true, "an IP") {
            self.bind_address = addr;
        }
        if let Some(port) = parse_var(&lookup, "PORT", |p: &u16| *p > 0, "> 0") {
            self.port = port;
        }
        if let Some(port) = parse_var(&lookup, "DEBUG_PORT", |p: &u16| *p > 0, "> 0") {
            self.debug_port = port;
        }
        if let Some(max) = parse_var(
            &lookup,
            "MAX_SESSIONS",
            |n: &usize| (1..=10_000).contains(n),
            "1-10000",
        ) {
            self.max_sessions = max;
        }
        if let Some(fps) = parse_var(
            &lookup,
            "TARGET_FPS",
            |n: &u32| (1..=1_000).contains(n),
            "1-1000",
        ) {
            self.target_fps = fps;
        }
        if let Some(secs) = parse_var(&lookup, "MAX_GAME_SECONDS", |n: &u64| *n > 0, "> 0") {
            self.max_game_seconds = secs;
        }
        if let Some(dir) = lookup("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.debug_port == self.port {
            return Err("debug_port must differ from port".to_string());
        }
        if self.max_sessions == 0 {
            return Err("max_sessions must be at least 1".to_string());
        }
        if self.target_fps == 0 {
            return Err("target_fps must be at least 1".to_string());
        }
        if self.max_game_seconds == 0 {
            return Err("max_game_seconds must be at least 1".to_string());
        }
        if self.max_players_per_session == 0 {
            return Err("max_players_per_session must be at least 1".to_string());
        }
        if self.action_buffer_size == 0 {
            return Err("action_buffer_size must be at least 1".to_string());
        }
        if self.layouts.is_empty() {
            return Err("at least one layout is required".to_string());
        }
        Ok(())
    }

    pub fn lobby(&self) -> LobbyConfig {
        LobbyConfig {
            max_sessions: self.max_sessions,
            target_fps: self.target_fps,
            action_buffer_size: self.action_buffer_size,
            max_players_per_session: self.max_players_per_session,
        }
    }

    pub fn max_game_time(&self) -> Duration {
        Duration::from_secs(self.max_game_seconds)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    accept: impl Fn(&T) -> bool,
    rule: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.parse::<T>() {
        Ok(value) if accept(&value) => Some(value),
        Ok(_) => {
            tracing::warn!("{} must be {}, using default", name, rule);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
