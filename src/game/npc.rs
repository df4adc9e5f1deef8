//! NPC producer/consumer bridge
//!
//! One worker thread per automated participant. The worker blocks on the
//! participant's [`LatestSlot`], asks its policy for an action and feeds the
//! result back through the session's normal enqueue path. Workers live
//! exactly as long as one activation of their session.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::game::engine::{Action, EnvState};
use crate::game::input_buffer::ActionInputs;
use crate::game::latest::LatestSlot;
use crate::game::policy::Policy;
use crate::lobby::player::ParticipantId;

struct NpcWorker {
    handle: JoinHandle<()>,
    /// Disconnects when the worker thread returns
    exited: Receiver<()>,
}

/// An automated participant bound to one slot of a session
pub struct NpcBinding {
    participant: ParticipantId,
    slot: usize,
    policy: Arc<Mutex<Box<dyn Policy>>>,
    states: LatestSlot<EnvState>,
    /// A state was delivered and its decision has not been drained yet
    awaiting: bool,
    worker: Option<NpcWorker>,
}

impl NpcBinding {
    pub fn new(participant: ParticipantId, slot: usize, policy: Box<dyn Policy>) -> Self {
        Self {
            participant,
            slot,
            policy: Arc::new(Mutex::new(policy)),
            states: LatestSlot::new(),
            awaiting: false,
            worker: None,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn reset_policy(&self) {
        self.policy.lock().reset();
    }

    /// Hand the worker a new state, overwriting any it has not picked up
    pub fn push_state(&mut self, state: EnvState) {
        if self.states.push(state) {
            debug!("NPC {} skipped a stale state", self.participant);
        }
        self.awaiting = true;
    }

    /// Start the decision loop. `inputs` must already be active.
    pub fn spawn(&mut self, inputs: Arc<ActionInputs>) -> Result<(), NpcError> {
        if self.worker.is_some() {
            return Err(NpcError::AlreadyRunning(self.participant.clone()));
        }

        let (alive_tx, exited) = bounded::<()>(0);
        let participant = self.participant.clone();
        let policy = Arc::clone(&self.policy);
        let states = self.states.clone();

        let handle = thread::Builder::new()
            .name(format!("npc-{}", self.participant))
            .spawn(move || run_worker(participant, policy, states, inputs, alive_tx))
            .map_err(|e| NpcError::Spawn(e.to_string()))?;

        self.worker = Some(NpcWorker { handle, exited });
        Ok(())
    }

    /// Unblock the worker with `final_state` and wait for it to exit.
    /// The session must already be marked inactive.
    pub fn stop(&mut self, final_state: EnvState) {
        self.awaiting = false;
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.states.push(final_state);
        if worker.handle.join().is_err() {
            error!("NPC worker {} panicked", self.participant);
        }
    }

    /// This tick's action for the NPC's slot
    ///
    /// Blocks for the outstanding decision when a state has been delivered;
    /// otherwise behaves like an idle human. Fails if the worker exited while
    /// a decision was outstanding.
    pub fn next_action(&mut self, queue: &Receiver<Action>) -> Result<Action, NpcError> {
        if !self.awaiting {
            return Ok(queue.try_recv().unwrap_or_default());
        }

        let action = match queue.try_recv() {
            Ok(action) => action,
            Err(_) => {
                let worker = self
                    .worker
                    .as_ref()
                    .ok_or_else(|| NpcError::NotRunning(self.participant.clone()))?;
                select! {
                    recv(queue) -> msg => {
                        msg.map_err(|_| NpcError::WorkerExited(self.participant.clone()))?
                    }
                    recv(worker.exited) -> _ => {
                        // A decision may have landed just before the exit
                        queue
                            .try_recv()
                            .map_err(|_| NpcError::WorkerExited(self.participant.clone()))?
                    }
                }
            }
        };

        self.awaiting = false;
        Ok(action)
    }
}

fn run_worker(
    participant: ParticipantId,
    policy: Arc<Mutex<Box<dyn Policy>>>,
    states: LatestSlot<EnvState>,
    inputs: Arc<ActionInputs>,
    _alive: Sender<()>,
) {
    debug!("NPC worker {} started", participant);

    while inputs.is_active() {
        let state = states.recv();
        if !inputs.is_active() {
            break;
        }

        let decision = policy.lock().action(&state);
        match decision {
            Ok(action) => {
                inputs.enqueue(&participant, action);
            }
            Err(e) => {
                warn!("NPC {} policy failed: {}", participant, e);
                break;
            }
        }
    }

    debug!("NPC worker {} stopped", participant);
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NpcError {
    #[error("NPC worker {0} is already running")]
    AlreadyRunning(ParticipantId),
    #[error("NPC worker {0} is not running")]
    NotRunning(ParticipantId),
    #[error("NPC worker {0} exited with a decision outstanding")]
    WorkerExited(ParticipantId),
    #[error("Failed to spawn NPC worker: {0}")]
    Spawn(String),
}
