//! Policy providers for automated participants
//!
//! A policy maps the latest environment state to one action. Policies are
//! looked up by kind name in a [`PolicyRegistry`] when a session is created
//! and are reset every time their session activates.

use std::sync::Arc;

use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::game::engine::{Action, EnvState};

/// Kind name of the always-idle policy
pub const STAY_AI: &str = "StayAI";
/// Kind name of the scripted tutorial partner
pub const TUTORIAL_AI: &str = "TutorialAI";

/// Decision function of an automated participant
pub trait Policy: Send {
    fn action(&mut self, state: &EnvState) -> Result<Action, PolicyError>;

    /// Called once per activation, before the first state is delivered
    fn reset(&mut self) {}
}

pub type PolicyFactory = Arc<dyn Fn() -> Box<dyn Policy> + Send + Sync>;

/// Always returns the no-op action
#[derive(Debug, Default, Clone)]
pub struct StayPolicy;

impl Policy for StayPolicy {
    fn action(&mut self, _state: &EnvState) -> Result<Action, PolicyError> {
        Ok(Action::Stay)
    }
}

/// Replays a fixed action loop per phase. `reset` advances to the next phase;
/// phases without a script (or past the end) idle.
#[derive(Debug, Clone)]
pub struct ScriptedPolicy {
    phases: Vec<Vec<Action>>,
    phase: Option<usize>,
    step: usize,
}

impl ScriptedPolicy {
    pub fn new(phases: Vec<Vec<Action>>) -> Self {
        Self {
            phases,
            phase: None,
            step: 0,
        }
    }

    /// Tutorial partner: cooks alone in phase 0, idles in phase 1, and helps
    /// in phase 2
    pub fn tutorial() -> Self {
        use Action::*;

        let cook_loop = vec![
            Left, Left, Left, Interact, // first ingredient
            Right, Up, Interact, // into the pot
            Left, Interact, // second
            Right, Up, Interact,
            Left, Interact, // third
            Right, Up, Interact,
            Interact, // cook
            Right, Down, Interact, // plate
            Left, Up,
            Interact, // serve
            Right, Right, Right, Interact,
            Left,
        ];

        let mut coop_loop = vec![
            Left, Left, Left, Interact,
            Right, Down, Interact,
            Right, Right,
        ];
        coop_loop.extend(std::iter::repeat(Stay).take(9));

        Self::new(vec![cook_loop, Vec::new(), coop_loop])
    }
}

impl Policy for ScriptedPolicy {
    fn action(&mut self, _state: &EnvState) -> Result<Action, PolicyError> {
        let script = match self.phase.and_then(|p| self.phases.get(p)) {
            Some(script) if !script.is_empty() => script,
            _ => return Ok(Action::Stay),
        };
        let action = script[self.step % script.len()];
        self.step += 1;
        Ok(action)
    }

    fn reset(&mut self) {
        self.step = 0;
        self.phase = Some(self.phase.map_or(0, |p| p + 1));
    }
}

/// Uniformly random actions
#[derive(Debug)]
pub struct RandomPolicy {
    rng: StdRng,
}

impl RandomPolicy {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl Policy for RandomPolicy {
    fn action(&mut self, _state: &EnvState) -> Result<Action, PolicyError> {
        Ok(Action::ALL[self.rng.gen_range(0..Action::ALL.len())])
    }
}

/// Configurable policy description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicySpec {
    Stay,
    Random {
        #[serde(default)]
        seed: Option<u64>,
    },
    Script {
        phases: Vec<Vec<Action>>,
    },
}

impl PolicySpec {
    pub fn factory(&self) -> PolicyFactory {
        match self.clone() {
            PolicySpec::Stay => Arc::new(|| Box::new(StayPolicy) as Box<dyn Policy>),
            PolicySpec::Random { seed } => {
                Arc::new(move || Box::new(RandomPolicy::new(seed)) as Box<dyn Policy>)
            }
            PolicySpec::Script { phases } => {
                Arc::new(move || Box::new(ScriptedPolicy::new(phases.clone())) as Box<dyn Policy>)
            }
        }
    }
}

/// Kind name -> policy factory
#[derive(Clone)]
pub struct PolicyRegistry {
    factories: HashMap<String, PolicyFactory>,
}

impl PolicyRegistry {
    /// Registry holding only the built-in kinds
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(STAY_AI, Arc::new(|| Box::new(StayPolicy) as Box<dyn Policy>));
        registry.register(
            TUTORIAL_AI,
            Arc::new(|| Box::new(ScriptedPolicy::tutorial()) as Box<dyn Policy>),
        );
        registry
    }

    /// Built-ins plus every configured kind
    pub fn from_specs<'a>(specs: impl IntoIterator<Item = (&'a String, &'a PolicySpec)>) -> Self {
        let mut registry = Self::new();
        for (name, spec) in specs {
            registry.register(name, spec.factory());
        }
        registry
    }

    pub fn register(&mut self, name: &str, factory: PolicyFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Instantiate a policy of the given kind
    pub fn load(&self, kind: &str) -> Result<Box<dyn Policy>, PolicyError> {
        self.factories
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| PolicyError::Unknown(kind.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    #[error("Error loading agent: unknown policy kind '{0}'")]
    Unknown(String),
    #[error("Policy decision failed: {0}")]
    Decision(String),
}
