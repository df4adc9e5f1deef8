//! Wire events
//!
//! Every frame carries one JSON object `{"event": <name>, "data": {...}}`.

use serde::{Deserialize, Serialize};

use crate::game::engine::Action;
use crate::game::kinds::CreateParams;
use crate::lobby::room::SessionStatus;

/// Session kind used when a request names none
pub const DEFAULT_GAME_NAME: &str = "standard";

fn default_game_name() -> String {
    DEFAULT_GAME_NAME.to_string()
}

fn default_true() -> bool {
    true
}

/// Events from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Create(CreateRequest),
    Join(JoinRequest),
    Leave,
    Action { action: Action },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(default = "default_game_name")]
    pub game_name: String,
    #[serde(default)]
    pub params: CreateParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(default = "default_game_name")]
    pub game_name: String,
    #[serde(default)]
    pub params: CreateParams,
    /// Create a session when none is waiting
    #[serde(default = "default_true")]
    pub create_if_not_found: bool,
}

/// Events from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Waiting {
        in_game: bool,
    },
    StartGame {
        spectating: bool,
        start_info: serde_json::Value,
    },
    StatePong {
        state: serde_json::Value,
    },
    ResetGame {
        state: serde_json::Value,
        /// Pause before play resumes, in milliseconds
        timeout: u64,
        data: serde_json::Value,
    },
    EndGame {
        status: SessionStatus,
        data: serde_json::Value,
    },
    EndLobby,
    CreationFailed {
        error: String,
    },
}

impl ServerEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Waiting { .. } => "waiting",
            ServerEvent::StartGame { .. } => "start_game",
            ServerEvent::StatePong { .. } => "state_pong",
            ServerEvent::ResetGame { .. } => "reset_game",
            ServerEvent::EndGame { .. } => "end_game",
            ServerEvent::EndLobby => "end_lobby",
            ServerEvent::CreationFailed { .. } => "creation_failed",
        }
    }
}

/// Encode an event as JSON
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec(message).map_err(|e| EncodeError(e.to_string()))
}

/// Decode an event from JSON
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(data).map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);
