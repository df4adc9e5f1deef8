//! Session state machine
//!
//! A [`Session`] owns its membership, per-slot action queues, NPC bindings
//! and the [`Game`] being played. Every mutable field lives behind the
//! session lock ([`Session::lock`]); only [`Session::enqueue_action`] bypasses
//! it, going through the shared [`ActionInputs`] instead so connection
//! handlers and NPC workers never contend with a tick in progress.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::game::engine::{Action, EnvState, JointAction};
use crate::game::input_buffer::{slot_queue, ActionInputs, EnqueueOutcome, NPC_QUEUE_CAPACITY};
use crate::game::kinds::{Game, GameError, GameKind, Roster};
use crate::game::npc::{NpcBinding, NpcError};
use crate::game::policy::Policy;
use crate::lobby::allocator::SessionId;
use crate::lobby::player::ParticipantId;

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Not running. Initial, and terminal once a session has been active.
    Inactive,
    Active,
    /// An internal reset happened this tick
    Resetting,
    /// Finished normally
    Done,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Done | SessionStatus::Inactive)
    }
}

/// Where a participant sits in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Player(usize),
    Spectator,
}

/// A session and its lock
pub struct Session {
    id: SessionId,
    kind: GameKind,
    inputs: Arc<ActionInputs>,
    state: Mutex<RoomState>,
}

impl Session {
    pub fn new(id: SessionId, game: Box<dyn Game>, action_buffer_size: usize) -> Self {
        let inputs = Arc::new(ActionInputs::new());
        let kind = game.kind();
        Self {
            id,
            kind,
            inputs: Arc::clone(&inputs),
            state: Mutex::new(RoomState::new(id, game, inputs, action_buffer_size)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> GameKind {
        self.kind
    }

    /// Lock-free view of the active flag
    pub fn is_active(&self) -> bool {
        self.inputs.is_active()
    }

    /// Queue an action for the participant's slot without taking the lock
    pub fn enqueue_action(&self, participant: &ParticipantId, action: Action) -> EnqueueOutcome {
        self.inputs.enqueue(participant, action)
    }

    pub fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock()
    }
}

/// Everything guarded by the session lock
pub struct RoomState {
    id: SessionId,
    status: SessionStatus,
    /// Fixed-length; `None` marks an empty slot
    slots: Vec<Option<ParticipantId>>,
    spectators: Vec<ParticipantId>,
    receivers: Vec<Option<Receiver<Action>>>,
    npcs: Vec<NpcBinding>,
    game: Box<dyn Game>,
    inputs: Arc<ActionInputs>,
    action_buffer_size: usize,
    tick_count: u64,
    /// Activated at least once; cleanup then belongs to the tick loop
    started: bool,
    /// Set once the session has been cleaned up and its ID released
    closed: bool,
}

impl RoomState {
    fn new(
        id: SessionId,
        game: Box<dyn Game>,
        inputs: Arc<ActionInputs>,
        action_buffer_size: usize,
    ) -> Self {
        let max_players = game.max_players();
        Self {
            id,
            status: SessionStatus::Inactive,
            slots: vec![None; max_players],
            spectators: Vec::new(),
            receivers: (0..max_players).map(|_| None).collect(),
            npcs: Vec::new(),
            game,
            inputs,
            action_buffer_size,
            tick_count: 0,
            started: false,
            closed: false,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.inputs.is_active()
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn max_players(&self) -> usize {
        self.slots.len()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn game(&self) -> &dyn Game {
        self.game.as_ref()
    }

    pub fn slots(&self) -> &[Option<ParticipantId>] {
        &self.slots
    }

    pub fn spectators(&self) -> &[ParticipantId] {
        &self.spectators
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_full(&self) -> bool {
        self.occupied() == self.max_players()
    }

    /// Enough occupied slots and at least one human present
    pub fn is_ready(&self) -> bool {
        self.occupied() >= self.game.min_players() && !self.is_empty()
    }

    /// No human players and no spectators
    pub fn is_empty(&self) -> bool {
        self.spectators.is_empty() && !self.slots.iter().flatten().any(|p| p.is_human())
    }

    pub fn membership(&self, participant: &ParticipantId) -> Option<Membership> {
        if let Some(slot) = self.slot_of(participant) {
            return Some(Membership::Player(slot));
        }
        self.spectators
            .contains(participant)
            .then_some(Membership::Spectator)
    }

    fn slot_of(&self, participant: &ParticipantId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref() == Some(participant))
    }

    /// Humans in slots plus spectators
    pub fn members(&self) -> Vec<ParticipantId> {
        self.slots
            .iter()
            .flatten()
            .filter(|p| p.is_human())
            .chain(self.spectators.iter())
            .cloned()
            .collect()
    }

    /// Seat a participant in the first empty slot
    pub fn add_player(&mut self, participant: ParticipantId) -> Result<usize, RoomError> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(RoomError::Full)?;
        if self.is_active() {
            return Err(RoomError::AlreadyActive);
        }
        if self.membership(&participant).is_some() {
            return Err(RoomError::AlreadyMember(participant));
        }

        self.seat(slot, participant, self.action_buffer_size);
        Ok(slot)
    }

    /// Bind an automated participant of `kind` to `slot`
    pub fn add_npc(
        &mut self,
        slot: usize,
        kind: &str,
        policy: Box<dyn Policy>,
    ) -> Result<ParticipantId, RoomError> {
        if self.is_active() {
            return Err(RoomError::AlreadyActive);
        }
        match self.slots.get(slot) {
            None => return Err(RoomError::Full),
            Some(Some(holder)) => {
                return Err(RoomError::Inconsistent(format!(
                    "slot {} already held by {}",
                    slot, holder
                )))
            }
            Some(None) => {}
        }

        let participant = ParticipantId::npc(kind, slot);
        self.seat(slot, participant.clone(), NPC_QUEUE_CAPACITY);
        self.npcs
            .push(NpcBinding::new(participant.clone(), slot, policy));
        Ok(participant)
    }

    fn seat(&mut self, slot: usize, participant: ParticipantId, capacity: usize) {
        let (tx, rx) = slot_queue(capacity);
        self.inputs.bind(slot, participant.clone(), tx);
        self.receivers[slot] = Some(rx);
        self.slots[slot] = Some(participant);
    }

    pub fn add_spectator(&mut self, participant: ParticipantId) -> Result<(), RoomError> {
        if self.membership(&participant).is_some() {
            return Err(RoomError::AlreadyMember(participant));
        }
        self.spectators.push(participant);
        Ok(())
    }

    /// Vacate the participant's slot, leaving an empty marker behind
    pub fn remove_player(&mut self, participant: &ParticipantId) -> Result<usize, RoomError> {
        let slot = self
            .slot_of(participant)
            .ok_or_else(|| RoomError::NotPresent(participant.clone()))?;

        self.inputs.unbind(slot);
        self.receivers[slot] = None;
        self.slots[slot] = None;
        Ok(slot)
    }

    pub fn remove_spectator(&mut self, participant: &ParticipantId) -> Result<(), RoomError> {
        let idx = self
            .spectators
            .iter()
            .position(|p| p == participant)
            .ok_or_else(|| RoomError::NotPresent(participant.clone()))?;
        self.spectators.remove(idx);
        Ok(())
    }

    /// Remove from whichever collection holds the participant
    pub fn remove_participant(&mut self, participant: &ParticipantId) -> Result<Membership, RoomError> {
        match self.membership(participant) {
            Some(Membership::Player(_)) => {
                let slot = self.remove_player(participant)?;
                Ok(Membership::Player(slot))
            }
            Some(Membership::Spectator) => {
                self.remove_spectator(participant)?;
                Ok(Membership::Spectator)
            }
            None => {
                error!("Participant {} not present in session {}", participant, self.id);
                Err(RoomError::NotPresent(participant.clone()))
            }
        }
    }

    pub fn roster(&self) -> Roster {
        Roster {
            ids: self
                .slots
                .iter()
                .map(|slot| slot.as_ref().map(ToString::to_string).unwrap_or_default())
                .collect(),
            humans: self
                .slots
                .iter()
                .map(|slot| slot.as_ref().is_some_and(ParticipantId::is_human))
                .collect(),
        }
    }

    fn check_consistency(&self) -> Result<(), RoomError> {
        for (slot, holder) in self.slots.iter().enumerate() {
            if holder.is_some() != self.receivers[slot].is_some() {
                return Err(RoomError::Inconsistent(format!(
                    "slot {} holder and queue disagree",
                    slot
                )));
            }
        }
        for npc in &self.npcs {
            if self.slots.get(npc.slot()).and_then(Option::as_ref) != Some(npc.participant()) {
                return Err(RoomError::Inconsistent(format!(
                    "NPC {} lost slot {}",
                    npc.participant(),
                    npc.slot()
                )));
            }
        }
        Ok(())
    }

    /// Start play and the NPC workers
    pub fn activate(&mut self) -> Result<(), RoomError> {
        if self.is_active() {
            return Err(RoomError::AlreadyActive);
        }
        if let Err(e) = self.check_consistency() {
            error!("Session {} failed to activate: {}", self.id, e);
            return Err(e);
        }

        let state = self.game.activate(&self.roster())?;
        self.inputs.set_active(true);
        self.status = SessionStatus::Active;
        self.started = true;

        let mut spawn_error = None;
        for npc in &mut self.npcs {
            npc.reset_policy();
            npc.push_state(state.clone());
            if let Err(e) = npc.spawn(Arc::clone(&self.inputs)) {
                spawn_error = Some(e);
                break;
            }
        }
        if let Some(e) = spawn_error {
            self.deactivate();
            return Err(e.into());
        }

        info!("Session {} activated", self.id);
        Ok(())
    }

    /// Stop play, join every NPC worker and discard queued actions
    pub fn deactivate(&mut self) {
        self.inputs.set_active(false);
        self.status = SessionStatus::Inactive;

        let final_state = self
            .game
            .current_state()
            .cloned()
            .unwrap_or_else(EnvState::null);
        for npc in &mut self.npcs {
            npc.stop(final_state.clone());
        }

        for rx in self.receivers.iter().flatten() {
            while rx.try_recv().is_ok() {}
        }
        debug!("Session {} deactivated", self.id);
    }

    /// Deactivate and reactivate with the same participants
    pub fn reset(&mut self) -> Result<(), RoomError> {
        self.deactivate();
        self.activate()?;
        self.game.after_reset();
        info!("Session {} reset", self.id);
        Ok(())
    }

    /// Advance one tick
    pub fn tick(&mut self) -> Result<SessionStatus, RoomError> {
        if self.status == SessionStatus::Done {
            return Ok(SessionStatus::Done);
        }
        if !self.is_active() {
            return Ok(SessionStatus::Inactive);
        }

        if self.game.needs_reset() {
            self.reset()?;
            return Ok(SessionStatus::Resetting);
        }

        self.tick_count += 1;
        let mut joint = JointAction::with_capacity(self.slots.len());
        for (slot, holder) in self.slots.iter().enumerate() {
            let action = match (holder, &self.receivers[slot]) {
                (Some(participant), Some(rx)) if !participant.is_human() => {
                    let npc = self
                        .npcs
                        .iter_mut()
                        .find(|npc| npc.slot() == slot)
                        .ok_or_else(|| {
                            RoomError::Inconsistent(format!("no NPC binding for slot {}", slot))
                        })?;
                    npc.next_action(rx)?
                }
                (Some(_), Some(rx)) => rx.try_recv().unwrap_or_default(),
                _ => Action::Stay,
            };
            joint.push(action);
        }

        let roster = self.roster();
        self.game.apply_joint_action(&joint, &roster)?;

        if self.game.is_finished() {
            self.status = SessionStatus::Done;
            return Ok(SessionStatus::Done);
        }

        if self.tick_count % self.game.ticks_per_ai_action() == 0 {
            if let Some(state) = self.game.current_state().cloned() {
                for npc in &mut self.npcs {
                    npc.push_state(state.clone());
                }
            }
        }
        Ok(SessionStatus::Active)
    }

    pub fn serialize_state(&self) -> serde_json::Value {
        self.game.serialize_state()
    }

    pub fn start_info(&self) -> serde_json::Value {
        self.game.start_info()
    }

    pub fn take_data(&mut self) -> serde_json::Value {
        self.game.take_data()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RoomError {
    #[error("Session is full")]
    Full,
    #[error("Session is already active")]
    AlreadyActive,
    #[error("Participant {0} is already in the session")]
    AlreadyMember(ParticipantId),
    #[error("Participant {0} is not in the session")]
    NotPresent(ParticipantId),
    #[error("Inconsistent session: {0}")]
    Inconsistent(String),
    #[error("NPC error: {0}")]
    Npc(#[from] NpcError),
    #[error("Game error: {0}")]
    Game(#[from] GameError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::engine::{EngineError, Environment, Transition};
    use crate::game::kinds::{build_game, CreateParams, GameContext, HUMAN};
    use crate::game::policy::PolicyError;
    use std::time::Duration;
    use uuid::Uuid;

    /// State is a tick counter; records every joint action it is handed
    struct Counter {
        joints: Arc<Mutex<Vec<Vec<Action>>>>,
    }

    impl Environment for Counter {
        fn start_state(&mut self, _layout: &str, _n: usize) -> Result<EnvState, EngineError> {
            Ok(EnvState(serde_json::json!(0)))
        }

        fn step(&mut self, state: &EnvState, joint: &[Action]) -> Result<Transition, EngineError> {
            self.joints.lock().push(joint.to_vec());
            let n = state.0.as_u64().unwrap_or(0);
            Ok(Transition {
                state: EnvState(serde_json::json!(n + 1)),
                rewards: joint.iter().map(|_| 0.0).collect(),
            })
        }
    }

    /// Right on even states, Left on odd ones
    struct Parity;

    impl Policy for Parity {
        fn action(&mut self, state: &EnvState) -> Result<Action, PolicyError> {
            Ok(match state.0.as_u64() {
                Some(n) if n % 2 == 0 => Action::Right,
                _ => Action::Left,
            })
        }
    }

    fn context(joints: Arc<Mutex<Vec<Vec<Action>>>>) -> GameContext {
        GameContext {
            environment: Arc::new(move || {
                Box::new(Counter {
                    joints: Arc::clone(&joints),
                }) as Box<dyn Environment>
            }),
            max_game_time: Duration::from_secs(60),
            default_layouts: vec!["counter".to_string()],
            sink: None,
        }
    }

    fn session(params: CreateParams, joints: Arc<Mutex<Vec<Vec<Action>>>>) -> Session {
        let game = build_game(GameKind::Standard, &params, &context(joints)).unwrap();
        Session::new(0, game, 8)
    }

    fn human() -> ParticipantId {
        ParticipantId::human(Uuid::new_v4())
    }

    #[test]
    fn test_npc_acts_on_presented_state() {
        let joints = Arc::new(Mutex::new(Vec::new()));
        let params = CreateParams {
            player_one: "Parity".to_string(),
            ..Default::default()
        };
        let session = session(params, Arc::clone(&joints));
        let player = human();

        {
            let mut room = session.lock();
            room.add_npc(1, "Parity", Box::new(Parity)).unwrap();
            room.add_player(player.clone()).unwrap();
            assert!(room.is_ready());
            room.activate().unwrap();
        }

        assert_eq!(session.enqueue_action(&player, Action::Up), EnqueueOutcome::Queued);
        assert_eq!(session.lock().tick().unwrap(), SessionStatus::Active);
        // No input this time: the human idles
        assert_eq!(session.lock().tick().unwrap(), SessionStatus::Active);

        session.lock().deactivate();

        assert_eq!(
            *joints.lock(),
            vec![
                vec![Action::Up, Action::Right],
                vec![Action::Stay, Action::Left],
            ]
        );
    }

    #[test]
    fn test_enqueue_rejected_when_inactive() {
        let session = session(CreateParams::default(), Arc::new(Mutex::new(Vec::new())));
        let player = human();
        session.lock().add_player(player.clone()).unwrap();

        assert_eq!(
            session.enqueue_action(&player, Action::Up),
            EnqueueOutcome::Inactive
        );
        assert_eq!(session.lock().tick().unwrap(), SessionStatus::Inactive);
    }

    #[test]
    fn test_add_fails_when_full_or_active() {
        let session = session(CreateParams::default(), Arc::new(Mutex::new(Vec::new())));
        let mut room = session.lock();

        room.add_player(human()).unwrap();
        assert!(!room.is_full());
        room.add_player(human()).unwrap();
        assert!(room.is_full());
        assert!(matches!(room.add_player(human()), Err(RoomError::Full)));

        let leaver = room.slots()[0].clone().unwrap();
        room.activate().unwrap();
        room.remove_player(&leaver).unwrap();
        assert!(matches!(room.add_player(human()), Err(RoomError::AlreadyActive)));
        room.deactivate();
    }

    #[test]
    fn test_remove_leaves_empty_marker() {
        let session = session(CreateParams::default(), Arc::new(Mutex::new(Vec::new())));
        let mut room = session.lock();
        let first = human();
        let second = human();
        room.add_player(first.clone()).unwrap();
        room.add_player(second.clone()).unwrap();

        assert_eq!(room.remove_player(&first).unwrap(), 0);
        assert_eq!(room.slots()[0], None);
        assert_eq!(room.slots()[1], Some(second));

        // Refills the vacated slot rather than appending
        assert_eq!(room.add_player(human()).unwrap(), 0);
        assert!(matches!(
            room.remove_player(&first),
            Err(RoomError::NotPresent(_))
        ));
    }

    #[test]
    fn test_empty_and_ready_predicates() {
        let params = CreateParams {
            player_zero: HUMAN.to_string(),
            player_one: "Parity".to_string(),
            ..Default::default()
        };
        let session = session(params, Arc::new(Mutex::new(Vec::new())));
        let mut room = session.lock();
        room.add_npc(1, "Parity", Box::new(Parity)).unwrap();

        // NPC-only sessions are empty and never ready
        assert!(room.is_empty());
        assert!(!room.is_ready());

        let watcher = human();
        room.add_spectator(watcher.clone()).unwrap();
        assert!(!room.is_empty());
        assert!(!room.is_ready());

        room.add_player(human()).unwrap();
        assert!(room.is_ready());

        room.remove_participant(&watcher).unwrap();
        assert!(!room.is_empty());
        assert_eq!(room.members().len(), 1);
    }

    #[test]
    fn test_spectator_cannot_double_join() {
        let session = session(CreateParams::default(), Arc::new(Mutex::new(Vec::new())));
        let mut room = session.lock();
        let player = human();
        room.add_player(player.clone()).unwrap();

        assert!(matches!(
            room.add_spectator(player.clone()),
            Err(RoomError::AlreadyMember(_))
        ));
        assert_eq!(room.membership(&player), Some(Membership::Player(0)));
    }

    #[test]
    fn test_reset_then_done() {
        let params = CreateParams {
            layouts: vec!["first".to_string(), "second".to_string()],
            game_time: 0,
            ..Default::default()
        };
        let session = session(params, Arc::new(Mutex::new(Vec::new())));
        let mut room = session.lock();
        room.add_player(human()).unwrap();
        room.add_player(human()).unwrap();
        room.activate().unwrap();

        assert_eq!(room.tick().unwrap(), SessionStatus::Resetting);
        assert!(room.is_active());
        assert_eq!(room.tick().unwrap(), SessionStatus::Done);
        assert_eq!(room.tick().unwrap(), SessionStatus::Done);
        room.deactivate();
    }

    #[test]
    fn test_activate_twice_fails() {
        let session = session(CreateParams::default(), Arc::new(Mutex::new(Vec::new())));
        let mut room = session.lock();
        room.add_player(human()).unwrap();
        room.add_player(human()).unwrap();
        room.activate().unwrap();

        assert!(matches!(room.activate(), Err(RoomError::AlreadyActive)));
        room.deactivate();
        assert_eq!(room.status(), SessionStatus::Inactive);
    }

    #[test]
    fn test_reset_discards_queued_actions() {
        let joints = Arc::new(Mutex::new(Vec::new()));
        let params = CreateParams {
            layouts: vec!["first".to_string(), "second".to_string()],
            game_time: 60,
            ..Default::default()
        };
        let session = session(params, Arc::clone(&joints));
        let player = human();
        {
            let mut room = session.lock();
            room.add_player(player.clone()).unwrap();
            room.add_player(human()).unwrap();
            room.activate().unwrap();
        }

        assert_eq!(session.enqueue_action(&player, Action::Up), EnqueueOutcome::Queued);
        session.lock().reset().unwrap();

        // The new layout starts from idle input, not the old layout's action
        assert_eq!(session.lock().tick().unwrap(), SessionStatus::Active);
        assert_eq!(*joints.lock(), vec![vec![Action::Stay, Action::Stay]]);
        session.lock().deactivate();
    }
}
