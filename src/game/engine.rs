//! Environment engine seam
//!
//! The simulated environment is an external collaborator: it is handed the
//! previous state plus one action per player slot and returns the next state
//! along with the per-slot sparse reward. Everything in this crate treats the
//! state as opaque JSON.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Inline capacity for joint actions; sessions rarely exceed four slots
pub const INLINE_SLOTS: usize = 4;

/// A single player's action for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// No-op. Idle humans and idle NPC slots default to this.
    #[default]
    Stay,
    Up,
    Down,
    Left,
    Right,
    /// Interact with whatever is in front of the player
    #[serde(alias = "SPACE")]
    Interact,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Stay,
        Action::Up,
        Action::Down,
        Action::Left,
        Action::Right,
        Action::Interact,
    ];

    /// Grid displacement for movement actions
    pub fn delta(self) -> (i32, i32) {
        match self {
            Action::Up => (0, -1),
            Action::Down => (0, 1),
            Action::Left => (-1, 0),
            Action::Right => (1, 0),
            Action::Stay | Action::Interact => (0, 0),
        }
    }
}

/// One action per player slot, assembled once per tick
pub type JointAction = SmallVec<[Action; INLINE_SLOTS]>;

/// Opaque environment state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvState(pub serde_json::Value);

impl EnvState {
    pub fn null() -> Self {
        Self(serde_json::Value::Null)
    }
}

/// Result of applying one joint action
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: EnvState,
    /// Sparse reward earned by each slot this tick
    pub rewards: SmallVec<[f64; INLINE_SLOTS]>,
}

impl Transition {
    pub fn total_reward(&self) -> f64 {
        self.rewards.iter().sum()
    }
}

/// The environment's transition function
pub trait Environment: Send {
    /// Load a layout and return its standard start state
    fn start_state(&mut self, layout: &str, num_players: usize) -> Result<EnvState, EngineError>;

    /// Advance `state` by one tick under `joint`
    fn step(&mut self, state: &EnvState, joint: &[Action]) -> Result<Transition, EngineError>;

    /// Static description of the current layout, sent once at game start
    fn terrain(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Builds a fresh environment for each session
pub type EnvironmentFactory = std::sync::Arc<dyn Fn() -> Box<dyn Environment> + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown layout: {0}")]
    UnknownLayout(String),
    #[error("Joint action has {got} entries, expected {expected}")]
    ArityMismatch { expected: usize, got: usize },
    #[error("Malformed state: {0}")]
    MalformedState(String),
}
