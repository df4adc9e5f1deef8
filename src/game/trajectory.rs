//! Trajectory recording
//!
//! Sessions record one transition per tick. Finished records are handed to a
//! [`TrajectorySink`] when data collection is enabled for the session.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::game::engine::Action;

/// One recorded tick
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    /// State the joint action was applied to
    pub state: serde_json::Value,
    pub joint_action: Vec<Action>,
    pub reward: f64,
    pub time_left: f64,
    pub score: f64,
    pub time_elapsed: f64,
    pub cur_gameloop: u64,
    pub layout_name: String,
    pub trial_id: String,
    pub player_ids: Vec<String>,
    pub player_is_human: Vec<bool>,
}

/// A batch of transitions handed back by a session
#[derive(Debug, Clone, Serialize)]
pub struct TrajectoryRecord {
    pub uid: String,
    pub trajectory: Vec<TransitionRecord>,
}

impl TrajectoryRecord {
    pub fn new(trajectory: Vec<TransitionRecord>) -> Self {
        Self {
            uid: chrono::Utc::now().timestamp_millis().to_string(),
            trajectory,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trajectory.is_empty()
    }
}

/// Where and how a session's data is filed
#[derive(Debug, Clone, Serialize)]
pub struct CollectionConfig {
    /// Session creation time, `%Y-%m-%d_%H-%M-%S`
    pub time: String,
    /// One letter per slot: `H` human, `A` automated
    pub game_type: String,
}

impl CollectionConfig {
    pub fn new(human_slots: &[bool]) -> Self {
        Self {
            time: chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string(),
            game_type: human_slots
                .iter()
                .map(|human| if *human { 'H' } else { 'A' })
                .collect(),
        }
    }
}

/// External persistence for finished trajectories
pub trait TrajectorySink: Send + Sync {
    fn write(
        &self,
        layout: &str,
        config: &CollectionConfig,
        record: &TrajectoryRecord,
    ) -> Result<PathBuf, SinkError>;
}

/// Writes `<root>/<layout>/<game_type>/<time>/result.json`
#[derive(Debug, Clone)]
pub struct JsonDirSink {
    root: PathBuf,
}

impl JsonDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TrajectorySink for JsonDirSink {
    fn write(
        &self,
        layout: &str,
        config: &CollectionConfig,
        record: &TrajectoryRecord,
    ) -> Result<PathBuf, SinkError> {
        let dir = self
            .root
            .join(layout)
            .join(&config.game_type)
            .join(&config.time);
        fs::create_dir_all(&dir)?;

        let path = dir.join("result.json");
        let contents =
            serde_json::to_vec(record).map_err(|e| SinkError::Encode(e.to_string()))?;
        fs::write(&path, contents)?;

        info!(
            "Wrote {} transitions to {}",
            record.trajectory.len(),
            path.display()
        );
        Ok(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Encode error: {0}")]
    Encode(String),
}
