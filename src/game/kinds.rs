//! Session kinds
//!
//! [`Game`] is the capability interface the session state machine and tick
//! scheduler depend on. Two kinds ship with the server: [`StandardGame`]
//! plays a list of timed layouts back to back, [`TutorialGame`] walks a new
//! player through goal-gated phases next to a scripted partner.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::error;

use crate::game::engine::{Action, EngineError, EnvState, Environment, EnvironmentFactory};
use crate::game::policy::TUTORIAL_AI;
use crate::game::trajectory::{CollectionConfig, TrajectoryRecord, TrajectorySink, TransitionRecord};

/// Kind name denoting a human-held slot in [`CreateParams`]
pub const HUMAN: &str = "human";

/// Pause after a standard layout change
pub const STANDARD_RESET_TIMEOUT: Duration = Duration::from_millis(3000);
/// Pause between tutorial phases
pub const TUTORIAL_RESET_TIMEOUT: Duration = Duration::from_millis(1);

/// Identity and human flag of every slot, in slot order
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub ids: Vec<String>,
    pub humans: Vec<bool>,
}

/// Capability interface of a session kind
pub trait Game: Send {
    fn kind(&self) -> GameKind;

    fn max_players(&self) -> usize;

    /// Occupied slots required before the session can start
    fn min_players(&self) -> usize {
        self.max_players()
    }

    /// Pause broadcast with a reset event
    fn reset_timeout(&self) -> Duration;

    /// NPC workers receive a fresh state every this many ticks
    fn ticks_per_ai_action(&self) -> u64 {
        1
    }

    /// Start play on the next layout and return its start state
    fn activate(&mut self, roster: &Roster) -> Result<EnvState, GameError>;

    /// Hook run after an internal reset re-activated the game
    fn after_reset(&mut self) {}

    /// Apply one joint action through the environment
    fn apply_joint_action(&mut self, joint: &[Action], roster: &Roster) -> Result<(), GameError>;

    fn current_state(&self) -> Option<&EnvState>;

    fn is_finished(&self) -> bool;

    fn needs_reset(&self) -> bool;

    /// Per-tick broadcast payload
    fn serialize_state(&self) -> serde_json::Value;

    /// Payload sent once when the session starts or resets
    fn start_info(&self) -> serde_json::Value;

    /// Drain recorded telemetry
    fn take_data(&mut self) -> serde_json::Value;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameKind {
    Standard,
    Tutorial,
}

impl GameKind {
    /// Unknown names fall back to the standard kind
    pub fn from_name(name: &str) -> Self {
        match name {
            "tutorial" => GameKind::Tutorial,
            _ => GameKind::Standard,
        }
    }
}

/// Client-supplied creation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateParams {
    pub layouts: Vec<String>,
    /// Seconds per layout
    pub game_time: u64,
    pub player_zero: String,
    pub player_one: String,
    pub num_players: usize,
    pub randomized: bool,
    #[serde(deserialize_with = "on_off")]
    pub data_collection: bool,
    pub ticks_per_ai_action: u64,
    pub phase_two_score: f64,
}

impl Default for CreateParams {
    fn default() -> Self {
        Self {
            layouts: Vec::new(),
            game_time: 30,
            player_zero: HUMAN.to_string(),
            player_one: HUMAN.to_string(),
            num_players: 2,
            randomized: false,
            data_collection: false,
            ticks_per_ai_action: 1,
            phase_two_score: 15.0,
        }
    }
}

impl CreateParams {
    /// Apply the fixed settings of `kind`
    pub fn normalized(mut self, kind: GameKind) -> Self {
        if kind == GameKind::Tutorial {
            self.num_players = 2;
            self.player_one = TUTORIAL_AI.to_string();
            self.ticks_per_ai_action = 1;
            self.data_collection = false;
        }
        self.num_players = self.num_players.max(1);
        self.ticks_per_ai_action = self.ticks_per_ai_action.max(1);
        self
    }

    /// `(slot, kind)` for every slot configured as automated
    pub fn npc_slots(&self) -> Vec<(usize, &str)> {
        [self.player_zero.as_str(), self.player_one.as_str()]
            .into_iter()
            .enumerate()
            .filter(|(slot, kind)| *slot < self.num_players && *kind != HUMAN)
            .collect()
    }

    /// Human flag per slot, for filing collected data
    pub fn human_slots(&self) -> Vec<bool> {
        let npcs = self.npc_slots();
        (0..self.num_players)
            .map(|slot| !npcs.iter().any(|(s, _)| *s == slot))
            .collect()
    }
}

/// Accepts `true`/`false` as well as `"on"`/`"off"`
fn on_off<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Text(s) => s.eq_ignore_ascii_case("on") || s.eq_ignore_ascii_case("true"),
    })
}

/// Server-side inputs for building a game
#[derive(Clone)]
pub struct GameContext {
    pub environment: EnvironmentFactory,
    /// Upper bound on any layout's duration
    pub max_game_time: Duration,
    /// Layouts used when the client names none
    pub default_layouts: Vec<String>,
    pub sink: Option<Arc<dyn TrajectorySink>>,
}

/// Construct the game for `kind`. Params must already be normalized.
pub fn build_game(
    kind: GameKind,
    params: &CreateParams,
    ctx: &GameContext,
) -> Result<Box<dyn Game>, GameError> {
    let mut layouts = if params.layouts.is_empty() {
        ctx.default_layouts.clone()
    } else {
        params.layouts.clone()
    };
    if layouts.is_empty() {
        return Err(GameError::NoLayouts);
    }
    if params.randomized {
        use rand::seq::SliceRandom;
        layouts.shuffle(&mut rand::thread_rng());
    }

    let collection = if params.data_collection {
        ctx.sink
            .clone()
            .map(|sink| (sink, CollectionConfig::new(&params.human_slots())))
    } else {
        None
    };

    let max_time = Duration::from_secs(params.game_time).min(ctx.max_game_time);
    let core = PlayCore::new((ctx.environment)(), layouts, params.num_players, max_time, collection);

    Ok(match kind {
        GameKind::Standard => Box::new(StandardGame {
            core,
            ticks_per_ai_action: params.ticks_per_ai_action,
        }),
        GameKind::Tutorial => Box::new(TutorialGame {
            core,
            phase: 0,
            phase_two_score: params.phase_two_score,
            phase_two_finished: false,
        }),
    })
}

/// Shared play state of both kinds
struct PlayCore {
    environment: Box<dyn Environment>,
    /// Remaining layouts, next one last
    pending_layouts: Vec<String>,
    current_layout: Option<String>,
    num_players: usize,
    max_time: Duration,
    started_at: Instant,
    trial_id: String,
    state: Option<EnvState>,
    score: f64,
    tick: u64,
    trajectory: Vec<TransitionRecord>,
    collection: Option<(Arc<dyn TrajectorySink>, CollectionConfig)>,
}

impl PlayCore {
    fn new(
        environment: Box<dyn Environment>,
        mut layouts: Vec<String>,
        num_players: usize,
        max_time: Duration,
        collection: Option<(Arc<dyn TrajectorySink>, CollectionConfig)>,
    ) -> Self {
        // Play in listed order
        layouts.reverse();
        Self {
            environment,
            pending_layouts: layouts,
            current_layout: None,
            num_players,
            max_time,
            started_at: Instant::now(),
            trial_id: String::new(),
            state: None,
            score: 0.0,
            tick: 0,
            trajectory: Vec::new(),
            collection,
        }
    }

    fn start_next_layout(&mut self) -> Result<EnvState, GameError> {
        let layout = self.pending_layouts.pop().ok_or(GameError::NoLayouts)?;
        let state = self.environment.start_state(&layout, self.num_players)?;

        self.current_layout = Some(layout);
        self.state = Some(state.clone());
        self.started_at = Instant::now();
        self.trial_id = chrono::Utc::now().timestamp_millis().to_string();
        self.score = 0.0;
        self.tick = 0;
        Ok(state)
    }

    fn layouts_exhausted(&self) -> bool {
        self.pending_layouts.is_empty()
    }

    fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn phase_over(&self) -> bool {
        self.elapsed() >= self.max_time
    }

    fn time_left(&self) -> Duration {
        self.max_time.saturating_sub(self.elapsed())
    }

    /// Step the environment and record the transition. Returns the per-slot
    /// rewards.
    fn step(&mut self, joint: &[Action], roster: &Roster) -> Result<Vec<f64>, GameError> {
        let prev = self.state.take().ok_or(GameError::NotStarted)?;
        let transition = match self.environment.step(&prev, joint) {
            Ok(t) => t,
            Err(e) => {
                self.state = Some(prev);
                return Err(e.into());
            }
        };
        self.tick += 1;

        let reward = transition.total_reward();
        self.trajectory.push(TransitionRecord {
            state: prev.0,
            joint_action: joint.to_vec(),
            reward,
            time_left: self.time_left().as_secs_f64(),
            score: self.score + reward,
            time_elapsed: self.elapsed().as_secs_f64(),
            cur_gameloop: self.tick,
            layout_name: self.current_layout.clone().unwrap_or_default(),
            trial_id: self.trial_id.clone(),
            player_ids: roster.ids.clone(),
            player_is_human: roster.humans.clone(),
        });

        self.state = Some(transition.state);
        Ok(transition.rewards.to_vec())
    }

    fn base_state(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state,
            "score": self.score,
            "time_left": self.time_left().as_secs_f64(),
        })
    }

    fn start_info(&self, state: serde_json::Value) -> serde_json::Value {
        if self.state.is_none() {
            return serde_json::json!({ "terrain": null, "state": null });
        }
        serde_json::json!({
            "terrain": self.environment.terrain(),
            "state": state,
        })
    }

    fn take_data(&mut self) -> serde_json::Value {
        let record = TrajectoryRecord::new(std::mem::take(&mut self.trajectory));

        if let (Some((sink, config)), false) = (&self.collection, record.is_empty()) {
            let layout = self.current_layout.as_deref().unwrap_or("unknown");
            if let Err(e) = sink.write(layout, config, &record) {
                error!("Failed to persist trajectory for {}: {}", layout, e);
            }
        }

        serde_json::to_value(&record).unwrap_or(serde_json::Value::Null)
    }
}

/// Timed layouts played back to back
pub struct StandardGame {
    core: PlayCore,
    ticks_per_ai_action: u64,
}

impl Game for StandardGame {
    fn kind(&self) -> GameKind {
        GameKind::Standard
    }

    fn max_players(&self) -> usize {
        self.core.num_players
    }

    fn reset_timeout(&self) -> Duration {
        STANDARD_RESET_TIMEOUT
    }

    fn ticks_per_ai_action(&self) -> u64 {
        self.ticks_per_ai_action
    }

    fn activate(&mut self, _roster: &Roster) -> Result<EnvState, GameError> {
        self.core.start_next_layout()
    }

    fn after_reset(&mut self) {
        // Don't let the reset pause eat into the new layout's clock
        self.core.started_at += self.reset_timeout();
    }

    fn apply_joint_action(&mut self, joint: &[Action], roster: &Roster) -> Result<(), GameError> {
        let rewards = self.core.step(joint, roster)?;
        self.core.score += rewards.iter().sum::<f64>();
        Ok(())
    }

    fn current_state(&self) -> Option<&EnvState> {
        self.core.state.as_ref()
    }

    fn is_finished(&self) -> bool {
        self.core.layouts_exhausted() && self.core.phase_over()
    }

    fn needs_reset(&self) -> bool {
        self.core.phase_over() && !self.is_finished()
    }

    fn serialize_state(&self) -> serde_json::Value {
        self.core.base_state()
    }

    fn start_info(&self) -> serde_json::Value {
        self.core.start_info(self.serialize_state())
    }

    fn take_data(&mut self) -> serde_json::Value {
        self.core.take_data()
    }
}

/// Goal-gated tutorial phases, one layout per phase
pub struct TutorialGame {
    core: PlayCore,
    phase: usize,
    phase_two_score: f64,
    phase_two_finished: bool,
}

impl TutorialGame {
    fn goal_met(&self) -> bool {
        match self.phase {
            0 | 1 => self.core.score > 0.0,
            2 => self.phase_two_finished,
            _ => false,
        }
    }
}

impl Game for TutorialGame {
    fn kind(&self) -> GameKind {
        GameKind::Tutorial
    }

    fn max_players(&self) -> usize {
        2
    }

    fn reset_timeout(&self) -> Duration {
        TUTORIAL_RESET_TIMEOUT
    }

    fn activate(&mut self, _roster: &Roster) -> Result<EnvState, GameError> {
        self.phase_two_finished = false;
        self.core.start_next_layout()
    }

    fn after_reset(&mut self) {
        self.phase += 1;
    }

    fn apply_joint_action(&mut self, joint: &[Action], roster: &Roster) -> Result<(), GameError> {
        let rewards = self.core.step(joint, roster)?;

        // Only the humans' progress counts
        let human_rewards: Vec<f64> = rewards
            .iter()
            .zip(roster.humans.iter())
            .filter(|(_, human)| **human)
            .map(|(r, _)| *r)
            .collect();
        self.core.score += human_rewards.iter().sum::<f64>();

        if self.phase == 2 {
            self.core.score = 0.0;
            if human_rewards.iter().any(|r| *r == self.phase_two_score) {
                self.phase_two_finished = true;
            }
        }
        Ok(())
    }

    fn current_state(&self) -> Option<&EnvState> {
        self.core.state.as_ref()
    }

    fn is_finished(&self) -> bool {
        self.core.layouts_exhausted() && self.goal_met()
    }

    fn needs_reset(&self) -> bool {
        !self.core.layouts_exhausted() && self.goal_met()
    }

    fn serialize_state(&self) -> serde_json::Value {
        let mut state = self.core.base_state();
        state["time_left"] = serde_json::Value::Null;
        state["phase"] = serde_json::json!(self.phase);
        state
    }

    fn start_info(&self) -> serde_json::Value {
        self.core.start_info(self.serialize_state())
    }

    fn take_data(&mut self) -> serde_json::Value {
        self.core.take_data()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GameError {
    #[error("No layouts left to play")]
    NoLayouts,
    #[error("Game has not been started")]
    NotStarted,
    #[error("Environment error: {0}")]
    Engine(#[from] EngineError),
}
