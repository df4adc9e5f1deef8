//! Minimal built-in environment
//!
//! Players walk on a bounded grid. Interacting next to the delivery cell
//! earns that player a delivery reward. Real deployments plug their own
//! [`Environment`] in through an [`EnvironmentFactory`].

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::game::engine::{Action, EngineError, EnvState, Environment, Transition};

pub const GRID_WIDTH: i32 = 5;
pub const GRID_HEIGHT: i32 = 4;
pub const DELIVERY_REWARD: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

impl Cell {
    fn adjacent(self, other: Cell) -> bool {
        (self.x - other.x).abs() + (self.y - other.y).abs() == 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GridState {
    layout: String,
    players: Vec<Cell>,
    deliveries: u32,
}

/// Grid environment accepting a fixed set of layout names
pub struct GridWorld {
    layouts: Vec<String>,
    current: Option<String>,
}

impl GridWorld {
    pub fn new(layouts: Vec<String>) -> Self {
        Self {
            layouts,
            current: None,
        }
    }

    pub fn delivery_cell() -> Cell {
        Cell {
            x: GRID_WIDTH - 1,
            y: 0,
        }
    }

    fn decode(state: &EnvState) -> Result<GridState, EngineError> {
        serde_json::from_value(state.0.clone())
            .map_err(|e| EngineError::MalformedState(e.to_string()))
    }

    fn encode(state: &GridState) -> Result<EnvState, EngineError> {
        serde_json::to_value(state)
            .map(EnvState)
            .map_err(|e| EngineError::MalformedState(e.to_string()))
    }
}

impl Environment for GridWorld {
    fn start_state(&mut self, layout: &str, num_players: usize) -> Result<EnvState, EngineError> {
        if !self.layouts.iter().any(|l| l == layout) {
            return Err(EngineError::UnknownLayout(layout.to_string()));
        }
        self.current = Some(layout.to_string());

        // Spread players along the bottom row
        let players = (0..num_players)
            .map(|i| Cell {
                x: (i as i32) % GRID_WIDTH,
                y: GRID_HEIGHT - 1,
            })
            .collect();

        Self::encode(&GridState {
            layout: layout.to_string(),
            players,
            deliveries: 0,
        })
    }

    fn step(&mut self, state: &EnvState, joint: &[Action]) -> Result<Transition, EngineError> {
        let mut grid = Self::decode(state)?;
        if joint.len() != grid.players.len() {
            return Err(EngineError::ArityMismatch {
                expected: grid.players.len(),
                got: joint.len(),
            });
        }

        let delivery = Self::delivery_cell();
        let mut rewards: SmallVec<[f64; 4]> = SmallVec::from_elem(0.0, joint.len());

        for (idx, action) in joint.iter().enumerate() {
            let (dx, dy) = action.delta();
            let target = Cell {
                x: (grid.players[idx].x + dx).clamp(0, GRID_WIDTH - 1),
                y: (grid.players[idx].y + dy).clamp(0, GRID_HEIGHT - 1),
            };

            // Players block each other and the delivery cell
            let occupied = target != grid.players[idx]
                && (target == delivery || grid.players.iter().any(|p| *p == target));
            if !occupied {
                grid.players[idx] = target;
            }

            if *action == Action::Interact && grid.players[idx].adjacent(delivery) {
                rewards[idx] = DELIVERY_REWARD;
                grid.deliveries += 1;
            }
        }

        Ok(Transition {
            state: Self::encode(&grid)?,
            rewards,
        })
    }

    fn terrain(&self) -> serde_json::Value {
        serde_json::json!({
            "layout": self.current,
            "width": GRID_WIDTH,
            "height": GRID_HEIGHT,
            "delivery": Self::delivery_cell(),
        })
    }
}
