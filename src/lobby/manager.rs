//! Lifecycle coordinator
//!
//! [`LobbyManager`] is the world object: it owns the ID allocator, the
//! session registry, the active set, the participant -> room map, per-user
//! locks and the waiting queue, and runs create/join/leave/disconnect as
//! sequences over them.
//!
//! Lock order is session lock first, then at most one registry lock at a
//! time. No registry lock is ever held while waiting on a session lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::game::engine::Action;
use crate::game::input_buffer::EnqueueOutcome;
use crate::game::kinds::{build_game, CreateParams, GameContext, GameError, GameKind};
use crate::game::policy::{PolicyError, PolicyRegistry};
use crate::lobby::allocator::{AllocatorError, SessionId, SlotAllocator};
use crate::lobby::broadcast::Broadcaster;
use crate::lobby::matchmaker::Matchmaker;
use crate::lobby::player::{ParticipantId, UserLock};
use crate::lobby::room::{Membership, RoomError, RoomState, Session, SessionStatus};
use crate::lobby::scheduler::spawn_session_loop;
use crate::metrics::Metrics;
use crate::net::protocol::ServerEvent;

/// Lobby limits, derived from the server config
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Total session capacity
    pub max_sessions: usize,
    /// Ticks per second
    pub target_fps: u32,
    /// Queue bound for human slots
    pub action_buffer_size: usize,
    pub max_players_per_session: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            target_fps: 30,
            action_buffer_size: 8,
            max_players_per_session: 2,
        }
    }
}

impl LobbyConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps.max(1)))
    }
}

/// Result of a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Matched into a waiting session
    Joined(SessionId),
    /// No session was waiting; a new one was created
    Created(SessionId),
    /// No session was waiting and creation was not requested
    Waiting,
    AlreadyInSession(SessionId),
}

pub struct LobbyManager {
    me: Weak<LobbyManager>,
    config: LobbyConfig,
    allocator: SlotAllocator,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    active: RwLock<HashSet<SessionId>>,
    rooms: RwLock<HashMap<ParticipantId, SessionId>>,
    users: RwLock<HashMap<Uuid, UserLock>>,
    matchmaker: Matchmaker,
    policies: PolicyRegistry,
    games: GameContext,
    broadcaster: Arc<dyn Broadcaster>,
    metrics: Arc<Metrics>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl LobbyManager {
    pub fn new(
        config: LobbyConfig,
        policies: PolicyRegistry,
        games: GameContext,
        broadcaster: Arc<dyn Broadcaster>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let allocator = SlotAllocator::new(config.max_sessions);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            allocator,
            sessions: RwLock::new(HashMap::new()),
            active: RwLock::new(HashSet::new()),
            rooms: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            matchmaker: Matchmaker::new(),
            policies,
            games,
            broadcaster,
            metrics,
            loops: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn tick_interval(&self) -> Duration {
        self.config.tick_interval()
    }

    pub fn broadcaster(&self) -> &Arc<dyn Broadcaster> {
        &self.broadcaster
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn allocator(&self) -> &SlotAllocator {
        &self.allocator
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn room_of(&self, participant: &ParticipantId) -> Option<SessionId> {
        self.rooms.read().get(participant).copied()
    }

    pub fn is_connected(&self, conn: Uuid) -> bool {
        self.users.read().contains_key(&conn)
    }

    fn user_lock(&self, conn: Uuid) -> Result<UserLock, ManagerError> {
        self.users
            .read()
            .get(&conn)
            .cloned()
            .ok_or(ManagerError::UnknownParticipant(conn))
    }

    /// Register a connection
    pub fn connect(&self, conn: Uuid) {
        self.users.write().entry(conn).or_default();
        debug!("Participant {} connected", conn);
    }

    /// Create a session for `conn`. Failures are also reported to the
    /// participant as `creation_failed`.
    pub fn create(
        &self,
        conn: Uuid,
        game_name: &str,
        params: CreateParams,
    ) -> Result<SessionId, ManagerError> {
        let user = self.user_lock(conn)?;
        let _guard = user.lock();

        let participant = ParticipantId::human(conn);
        if let Some(id) = self.room_of(&participant) {
            debug!("{} already in session {}, ignoring create", participant, id);
            return Ok(id);
        }
        self.create_reporting(&participant, game_name, params)
    }

    /// Match `conn` into a waiting session, creating one if allowed
    pub fn join(
        &self,
        conn: Uuid,
        game_name: &str,
        params: CreateParams,
        create_if_not_found: bool,
    ) -> Result<JoinOutcome, ManagerError> {
        let user = self.user_lock(conn)?;
        let _guard = user.lock();

        let participant = ParticipantId::human(conn);
        if let Some(id) = self.room_of(&participant) {
            return Ok(JoinOutcome::AlreadyInSession(id));
        }

        while let Some(id) = self.matchmaker.dequeue_waiting(&self.allocator) {
            let Some(session) = self.session(id) else {
                continue;
            };
            let mut room = session.lock();
            if room.is_closed() || room.has_started() {
                continue;
            }

            if let Err(e) = self.seat(&mut room, id, &participant) {
                error!("Failed to seat {} in session {}: {}", participant, id, e);
                self.matchmaker.enqueue_waiting(id);
                return Err(e);
            }
            if let Err(e) = self.start_or_wait(&mut room, &session) {
                error!("Session {} failed to start: {}", id, e);
                self.abandon(&mut room, id);
                return Err(e);
            }
            info!("{} joined session {}", participant, id);
            return Ok(JoinOutcome::Joined(id));
        }

        if create_if_not_found {
            return self
                .create_reporting(&participant, game_name, params)
                .map(JoinOutcome::Created);
        }

        self.broadcaster
            .to_participant(&participant, &ServerEvent::Waiting { in_game: false });
        Ok(JoinOutcome::Waiting)
    }

    /// Leave the current session. Emits `end_game` to the leaver if the
    /// session was active, `end_lobby` otherwise. Returns whether it was
    /// active.
    pub fn leave(&self, conn: Uuid) -> Result<bool, ManagerError> {
        let user = self.user_lock(conn)?;
        let _guard = user.lock();

        let participant = ParticipantId::human(conn);
        let was_active = self.leave_locked(&participant)?;

        let event = if was_active {
            ServerEvent::EndGame {
                status: SessionStatus::Done,
                data: serde_json::json!({}),
            }
        } else {
            ServerEvent::EndLobby
        };
        self.broadcaster.to_participant(&participant, &event);
        Ok(was_active)
    }

    /// Leave, then forget the connection entirely
    pub fn disconnect(&self, conn: Uuid) -> Result<(), ManagerError> {
        let user = self.user_lock(conn)?;
        {
            let _guard = user.lock();
            if let Err(e) = self.leave_locked(&ParticipantId::human(conn)) {
                error!("Leave on disconnect of {} failed: {}", conn, e);
            }
        }
        self.users.write().remove(&conn);
        debug!("Participant {} disconnected", conn);
        Ok(())
    }

    /// Route an action to the participant's session, ignored if none
    pub fn submit_action(&self, conn: Uuid, action: Action) -> EnqueueOutcome {
        let participant = ParticipantId::human(conn);
        let Some(session) = self.room_of(&participant).and_then(|id| self.session(id)) else {
            return EnqueueOutcome::NotAPlayer;
        };

        let outcome = session.enqueue_action(&participant, action);
        match outcome {
            EnqueueOutcome::Queued => Metrics::incr(&self.metrics.actions_queued),
            EnqueueOutcome::Dropped => Metrics::incr(&self.metrics.actions_dropped),
            EnqueueOutcome::Inactive | EnqueueOutcome::NotAPlayer => {}
        }
        outcome
    }

    /// Free a session: evict its members, drop it from every registry and
    /// return its ID. Fails loudly on a second call for the same session.
    pub fn cleanup(&self, id: SessionId) -> Result<(), ManagerError> {
        let Some(session) = self.session(id) else {
            if self.allocator.is_free(id) {
                error!("Double free of session {}", id);
                return Err(AllocatorError::DoubleFree(id).into());
            }
            return Err(ManagerError::UnknownSession(id));
        };
        let mut room = session.lock();
        self.cleanup_locked(&mut room, id)
    }

    /// Stop every session and wait for all tick loops to exit
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);

        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            let mut room = session.lock();
            if room.is_closed() {
                continue;
            }
            if room.has_started() {
                if room.is_active() {
                    room.deactivate();
                }
                continue;
            }

            let members = room.members();
            if let Err(e) = self.cleanup_locked(&mut room, session.id()) {
                error!("Cleanup of waiting session {} failed: {}", session.id(), e);
            }
            for member in members {
                self.broadcaster.to_participant(&member, &ServerEvent::EndLobby);
            }
        }

        let handles = std::mem::take(&mut *self.loops.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("Session loop panicked");
            }
        }
        info!("Lobby shut down");
    }

    /// Read-only view of every registry
    pub fn debug_snapshot(&self) -> DebugSnapshot {
        let mut active_ids: Vec<SessionId> = self.active.read().iter().copied().collect();
        active_ids.sort_unstable();
        let mut all_game_ids: Vec<SessionId> = self.sessions.read().keys().copied().collect();
        all_game_ids.sort_unstable();

        let active_games = active_ids
            .into_iter()
            .filter_map(|id| self.session(id))
            .map(|session| {
                let room = session.lock();
                SessionView::of(session.id(), &room)
            })
            .collect();

        let waiting_games = self
            .matchmaker
            .snapshot()
            .into_iter()
            .map(|id| WaitingView {
                id,
                state: if self.allocator.is_free(id) {
                    None
                } else {
                    self.session(id).map(|session| {
                        let state = session.lock().serialize_state();
                        state
                    })
                },
            })
            .collect();

        let participant_rooms = self
            .rooms
            .read()
            .iter()
            .map(|(p, id)| (p.to_string(), *id))
            .collect();

        DebugSnapshot {
            active_games,
            waiting_games,
            all_game_ids,
            participant_rooms,
            free_ids: self.allocator.free_ids(),
            free_map: self.allocator.free_map(),
        }
    }

    fn create_reporting(
        &self,
        participant: &ParticipantId,
        game_name: &str,
        params: CreateParams,
    ) -> Result<SessionId, ManagerError> {
        self.create_session(participant, game_name, params)
            .inspect_err(|e| {
                if e.is_capacity() {
                    warn!("Rejected create from {}: {}", participant, e);
                } else {
                    error!("Create from {} failed: {}", participant, e);
                }
                Metrics::incr(&self.metrics.creation_failures);
                self.broadcaster.to_participant(
                    participant,
                    &ServerEvent::CreationFailed {
                        error: e.to_string(),
                    },
                );
            })
    }

    fn create_session(
        &self,
        participant: &ParticipantId,
        game_name: &str,
        params: CreateParams,
    ) -> Result<SessionId, ManagerError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ManagerError::ShuttingDown);
        }

        let kind = GameKind::from_name(game_name);
        let mut params = params.normalized(kind);
        if kind == GameKind::Standard {
            params.num_players = params.num_players.min(self.config.max_players_per_session);
        }

        // Everything that can fail runs before an ID is taken
        let npcs = params
            .npc_slots()
            .into_iter()
            .map(|(slot, npc_kind)| Ok((slot, npc_kind.to_string(), self.policies.load(npc_kind)?)))
            .collect::<Result<Vec<_>, PolicyError>>()?;
        let game = build_game(kind, &params, &self.games)?;

        let id = self.allocator.acquire()?;
        let session = Arc::new(Session::new(id, game, self.config.action_buffer_size));
        let mut room = session.lock();

        for (slot, npc_kind, policy) in npcs {
            if let Err(e) = room.add_npc(slot, &npc_kind, policy) {
                room.mark_closed();
                if let Err(release) = self.allocator.release(id) {
                    error!("Failed to release session {}: {}", id, release);
                }
                return Err(e.into());
            }
        }

        self.sessions.write().insert(id, Arc::clone(&session));
        Metrics::incr(&self.metrics.sessions_created);
        info!("Created {:?} session {} for {}", kind, id, participant);

        let started = self
            .seat(&mut room, id, participant)
            .and_then(|_| self.start_or_wait(&mut room, &session));
        if let Err(e) = started {
            self.abandon(&mut room, id);
            return Err(e);
        }
        Ok(id)
    }

    /// Add as player, or as spectator when no slot can be taken
    fn seat(
        &self,
        room: &mut RoomState,
        id: SessionId,
        participant: &ParticipantId,
    ) -> Result<Membership, ManagerError> {
        let membership = if room.is_full() || room.is_active() {
            room.add_spectator(participant.clone())?;
            Membership::Spectator
        } else {
            Membership::Player(room.add_player(participant.clone())?)
        };

        self.rooms.write().insert(participant.clone(), id);
        self.broadcaster.join_room(participant, id);
        debug!("{} seated in session {} as {:?}", participant, id, membership);
        Ok(membership)
    }

    fn start_or_wait(&self, room: &mut RoomState, session: &Arc<Session>) -> Result<(), ManagerError> {
        if room.is_ready() {
            return self.activate_locked(room, session);
        }

        let id = session.id();
        self.matchmaker.enqueue_waiting(id);
        self.broadcaster
            .to_room(id, &ServerEvent::Waiting { in_game: true });
        self.refresh_gauges();
        Ok(())
    }

    fn activate_locked(&self, room: &mut RoomState, session: &Arc<Session>) -> Result<(), ManagerError> {
        let id = session.id();
        room.activate()?;
        self.active.write().insert(id);

        let start_info = room.start_info();
        for member in room.members() {
            let spectating = room.membership(&member) == Some(Membership::Spectator);
            self.broadcaster.to_participant(
                &member,
                &ServerEvent::StartGame {
                    spectating,
                    start_info: start_info.clone(),
                },
            );
        }

        let manager = self.me.upgrade().ok_or(ManagerError::ShuttingDown)?;
        let handle = spawn_session_loop(manager, Arc::clone(session))
            .map_err(|e| ManagerError::Spawn(e.to_string()))?;
        {
            let mut loops = self.loops.lock();
            loops.retain(|h| !h.is_finished());
            loops.push(handle);
        }

        self.refresh_gauges();
        info!("Session {} started", id);
        Ok(())
    }

    fn leave_locked(&self, participant: &ParticipantId) -> Result<bool, ManagerError> {
        let Some(id) = self.room_of(participant) else {
            return Ok(false);
        };
        let Some(session) = self.session(id) else {
            error!("{} mapped to missing session {}", participant, id);
            self.forget_room(participant, id);
            return Ok(false);
        };

        let mut room = session.lock();
        if room.is_closed() {
            self.forget_room(participant, id);
            return Ok(false);
        }

        let was_active = room.is_active();
        room.remove_participant(participant)?;
        self.forget_room(participant, id);

        if room.has_started() {
            // The tick loop frees started sessions
            if was_active && !room.is_ready() {
                info!("Session {} lost its quorum, stopping", id);
                room.deactivate();
            }
        } else if room.is_empty() {
            self.cleanup_locked(&mut room, id)?;
        } else {
            self.broadcaster
                .to_room(id, &ServerEvent::Waiting { in_game: true });
        }
        Ok(was_active)
    }

    fn forget_room(&self, participant: &ParticipantId, id: SessionId) {
        {
            let mut rooms = self.rooms.write();
            if rooms.get(participant) == Some(&id) {
                rooms.remove(participant);
            }
        }
        self.broadcaster.leave_room(participant, id);
    }

    fn cleanup_locked(&self, room: &mut RoomState, id: SessionId) -> Result<(), ManagerError> {
        if room.is_closed() || self.allocator.is_free(id) {
            error!("Double free of session {}", id);
            return Err(AllocatorError::DoubleFree(id).into());
        }

        let members = room.members();
        {
            let mut rooms = self.rooms.write();
            for member in &members {
                if rooms.get(member) == Some(&id) {
                    rooms.remove(member);
                }
            }
        }
        for member in &members {
            self.broadcaster.leave_room(member, id);
        }
        self.broadcaster.close_room(id);

        self.sessions.write().remove(&id);
        self.active.write().remove(&id);
        room.mark_closed();
        self.allocator.release(id)?;

        self.refresh_gauges();
        info!("Session {} cleaned up", id);
        Ok(())
    }

    /// Tear down a session whose setup failed part way
    fn abandon(&self, room: &mut RoomState, id: SessionId) {
        if room.is_active() {
            room.deactivate();
        }
        if let Err(e) = self.cleanup_locked(room, id) {
            error!("Failed to abandon session {}: {}", id, e);
        }
    }

    fn refresh_gauges(&self) {
        let total = self.sessions.read().len() as u64;
        let active = self.active.read().len() as u64;
        self.metrics.sessions_active.store(active, Ordering::Relaxed);
        self.metrics
            .sessions_waiting
            .store(total.saturating_sub(active), Ordering::Relaxed);
    }
}

/// Introspection payload for `/debug`
#[derive(Debug, Serialize)]
pub struct DebugSnapshot {
    pub active_games: Vec<SessionView>,
    /// Queue contents; stale IDs show a null state
    pub waiting_games: Vec<WaitingView>,
    pub all_game_ids: Vec<SessionId>,
    pub participant_rooms: BTreeMap<String, SessionId>,
    pub free_ids: Vec<SessionId>,
    pub free_map: Vec<bool>,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: SessionId,
    pub kind: GameKind,
    pub status: SessionStatus,
    pub players: Vec<Option<String>>,
    pub spectators: Vec<String>,
    pub state: serde_json::Value,
}

impl SessionView {
    fn of(id: SessionId, room: &RoomState) -> Self {
        Self {
            id,
            kind: room.game().kind(),
            status: room.status(),
            players: room
                .slots()
                .iter()
                .map(|slot| slot.as_ref().map(ToString::to_string))
                .collect(),
            spectators: room.spectators().iter().map(ToString::to_string).collect(),
            state: room.serialize_state(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WaitingView {
    pub id: SessionId,
    pub state: Option<serde_json::Value>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ManagerError {
    #[error("Unknown participant {0}")]
    UnknownParticipant(Uuid),
    #[error("Session {0} not found")]
    UnknownSession(SessionId),
    #[error("{0}")]
    Allocator(#[from] AllocatorError),
    #[error("{0}")]
    Policy(#[from] PolicyError),
    #[error("Game setup failed: {0}")]
    Game(#[from] GameError),
    #[error("Room error: {0}")]
    Room(#[from] RoomError),
    #[error("Failed to start session loop: {0}")]
    Spawn(String),
    #[error("Server is shutting down")]
    ShuttingDown,
}

impl ManagerError {
    pub fn is_capacity(&self) -> bool {
        matches!(self, ManagerError::Allocator(e) if e.is_capacity())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::game::engine::Environment;
    use crate::game::policy::STAY_AI;
    use crate::game::sandbox::GridWorld;
    use crate::lobby::broadcast::recording::RecordingBroadcaster;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    pub(crate) fn test_manager(capacity: usize) -> (Arc<LobbyManager>, Arc<RecordingBroadcaster>) {
        test_manager_with(capacity, PolicyRegistry::new())
    }

    pub(crate) fn test_manager_with(
        capacity: usize,
        policies: PolicyRegistry,
    ) -> (Arc<LobbyManager>, Arc<RecordingBroadcaster>) {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let games = GameContext {
            environment: Arc::new(|| {
                Box::new(GridWorld::new(vec!["cramped_room".to_string()])) as Box<dyn Environment>
            }),
            max_game_time: Duration::from_secs(120),
            default_layouts: vec!["cramped_room".to_string()],
            sink: None,
        };
        let config = LobbyConfig {
            max_sessions: capacity,
            target_fps: 200,
            ..Default::default()
        };
        let manager = LobbyManager::new(
            config,
            policies,
            games,
            broadcaster.clone(),
            Arc::new(Metrics::new()),
        );
        (manager, broadcaster)
    }

    pub(crate) fn connected(manager: &LobbyManager) -> (Uuid, ParticipantId) {
        let conn = Uuid::new_v4();
        manager.connect(conn);
        (conn, ParticipantId::human(conn))
    }

    pub(crate) fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn with_npc(kind: &str) -> CreateParams {
        CreateParams {
            player_one: kind.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_capacity_one_end_to_end() {
        let (manager, events) = test_manager(1);
        let (a, pa) = connected(&manager);
        let (b, pb) = connected(&manager);

        assert_eq!(manager.create(a, "standard", CreateParams::default()).unwrap(), 0);
        assert_eq!(manager.session(0).unwrap().lock().slots()[0], Some(pa.clone()));

        let err = manager.create(b, "standard", CreateParams::default()).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(
            events.events_for(&pb),
            vec![ServerEvent::CreationFailed {
                error: "Server at max capacity".to_string()
            }]
        );

        assert!(!manager.leave(a).unwrap());
        assert_eq!(events.names_for(&pa), vec!["waiting", "end_lobby"]);
        assert!(manager.allocator().is_free(0));

        assert_eq!(manager.create(b, "standard", CreateParams::default()).unwrap(), 0);
        assert_eq!(manager.room_of(&pb), Some(0));
    }

    #[test]
    fn test_two_player_join_flow() {
        let (manager, events) = test_manager(2);
        let (a, pa) = connected(&manager);
        let (b, pb) = connected(&manager);

        assert_eq!(
            manager.join(a, "standard", CreateParams::default(), true).unwrap(),
            JoinOutcome::Created(0)
        );
        assert_eq!(
            events.events_for(&pa),
            vec![ServerEvent::Waiting { in_game: true }]
        );
        assert_eq!(manager.debug_snapshot().waiting_games.len(), 1);

        assert_eq!(
            manager.join(b, "standard", CreateParams::default(), true).unwrap(),
            JoinOutcome::Joined(0)
        );
        for participant in [&pa, &pb] {
            let start = events
                .events_for(participant)
                .into_iter()
                .find(|e| e.name() == "start_game")
                .expect("start_game");
            assert!(matches!(start, ServerEvent::StartGame { spectating: false, .. }));
        }

        let snapshot = manager.debug_snapshot();
        assert_eq!(snapshot.active_games.len(), 1);
        assert_eq!(snapshot.active_games[0].status, SessionStatus::Active);

        wait_until("first state broadcast", || {
            events.names_for(&pa).contains(&"state_pong")
        });

        manager.shutdown();
        assert!(events.events_for(&pb).iter().any(|e| matches!(
            e,
            ServerEvent::EndGame {
                status: SessionStatus::Inactive,
                ..
            }
        )));
        assert_eq!(manager.allocator().available(), 2);
        assert!(manager.room_of(&pa).is_none());
    }

    #[test]
    fn test_concurrent_create_race() {
        for _ in 0..20 {
            let (manager, _) = test_manager(1);
            let barrier = Arc::new(Barrier::new(2));
            let conns: Vec<Uuid> = (0..2).map(|_| connected(&manager).0).collect();

            let handles: Vec<_> = conns
                .into_iter()
                .map(|conn| {
                    let manager = Arc::clone(&manager);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        manager.create(conn, "standard", CreateParams::default())
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(e) if e.is_capacity())));
            assert_eq!(manager.debug_snapshot().all_game_ids, vec![0]);
        }
    }

    #[test]
    fn test_leave_active_session_frees_once() {
        let (manager, events) = test_manager(2);
        let (a, pa) = connected(&manager);
        let (b, pb) = connected(&manager);
        manager.join(a, "standard", CreateParams::default(), true).unwrap();
        manager.join(b, "standard", CreateParams::default(), true).unwrap();

        // Both leave before the tick loop has a chance to clean up
        assert!(manager.leave(a).unwrap());
        assert!(!manager.leave(b).unwrap());

        wait_until("session freed", || manager.allocator().is_free(0));
        manager.shutdown();

        assert_eq!(manager.allocator().available(), 2);
        let mut free = manager.allocator().free_ids();
        free.sort_unstable();
        assert_eq!(free, vec![0, 1]);
        assert!(manager.debug_snapshot().participant_rooms.is_empty());

        assert_eq!(
            events.events_for(&pa).last(),
            Some(&ServerEvent::EndGame {
                status: SessionStatus::Done,
                data: serde_json::json!({})
            })
        );
        assert_eq!(events.names_for(&pb).last(), Some(&"end_lobby"));
    }

    #[test]
    fn test_demotion_ends_session_for_remaining_player() {
        let (manager, events) = test_manager(1);
        let (a, _) = connected(&manager);
        let (b, pb) = connected(&manager);
        manager.join(a, "standard", CreateParams::default(), true).unwrap();
        manager.join(b, "standard", CreateParams::default(), true).unwrap();

        manager.leave(a).unwrap();
        wait_until("session freed", || manager.allocator().is_free(0));

        assert!(events.events_for(&pb).iter().any(|e| matches!(
            e,
            ServerEvent::EndGame {
                status: SessionStatus::Inactive,
                ..
            }
        )));
        assert!(manager.room_of(&pb).is_none());
        manager.shutdown();
    }

    #[test]
    fn test_double_cleanup_fails() {
        let (manager, _) = test_manager(2);
        let (a, _) = connected(&manager);
        let id = manager.create(a, "standard", CreateParams::default()).unwrap();

        manager.cleanup(id).unwrap();
        assert!(matches!(
            manager.cleanup(id),
            Err(ManagerError::Allocator(AllocatorError::DoubleFree(_)))
        ));
        assert_eq!(manager.allocator().available(), 2);
    }

    #[test]
    fn test_actions_routed_to_players_only() {
        let (manager, _) = test_manager(2);
        let (a, _) = connected(&manager);
        let (b, _) = connected(&manager);
        let (c, _) = connected(&manager);

        // Not yet active
        manager.join(a, "standard", CreateParams::default(), true).unwrap();
        assert_eq!(manager.submit_action(a, Action::Up), EnqueueOutcome::Inactive);

        manager.join(b, "standard", CreateParams::default(), true).unwrap();
        assert_eq!(manager.submit_action(b, Action::Left), EnqueueOutcome::Queued);
        assert_eq!(manager.submit_action(c, Action::Left), EnqueueOutcome::NotAPlayer);

        manager.shutdown();
    }

    #[test]
    fn test_npc_session_starts_immediately() {
        let (manager, events) = test_manager(1);
        let (a, pa) = connected(&manager);

        manager.create(a, "standard", with_npc(STAY_AI)).unwrap();
        assert!(matches!(
            events.events_for(&pa).first(),
            Some(ServerEvent::StartGame {
                spectating: false,
                ..
            })
        ));
        assert_eq!(
            manager.session(0).unwrap().lock().slots()[1],
            Some(ParticipantId::npc(STAY_AI, 1))
        );

        wait_until("ticks", || events.names_for(&pa).len() > 3);
        manager.shutdown();
        assert!(manager.allocator().is_free(0));
    }

    #[test]
    fn test_npc_only_session_is_spectated() {
        let (manager, events) = test_manager(1);
        let (a, pa) = connected(&manager);
        let params = CreateParams {
            player_zero: STAY_AI.to_string(),
            player_one: STAY_AI.to_string(),
            ..Default::default()
        };

        manager.create(a, "standard", params).unwrap();
        assert!(matches!(
            events.events_for(&pa).first(),
            Some(ServerEvent::StartGame {
                spectating: true,
                ..
            })
        ));

        // The spectator leaving empties the session
        manager.leave(a).unwrap();
        wait_until("session freed", || manager.allocator().is_free(0));
        manager.shutdown();
    }

    #[test]
    fn test_unknown_policy_fails_creation() {
        let (manager, events) = test_manager(1);
        let (a, pa) = connected(&manager);

        let err = manager.create(a, "standard", with_npc("Ghost")).unwrap_err();
        assert!(matches!(err, ManagerError::Policy(PolicyError::Unknown(_))));
        assert_eq!(events.names_for(&pa), vec!["creation_failed"]);
        assert_eq!(manager.allocator().available(), 1);
        assert!(manager.room_of(&pa).is_none());
    }

    #[test]
    fn test_join_without_create() {
        let (manager, events) = test_manager(1);
        let (a, pa) = connected(&manager);

        assert_eq!(
            manager.join(a, "standard", CreateParams::default(), false).unwrap(),
            JoinOutcome::Waiting
        );
        assert_eq!(
            events.events_for(&pa),
            vec![ServerEvent::Waiting { in_game: false }]
        );
        assert_eq!(manager.allocator().available(), 1);
    }

    #[test]
    fn test_join_skips_stale_waiting_entry() {
        let (manager, _) = test_manager(2);
        let (a, _) = connected(&manager);
        let (b, _) = connected(&manager);

        manager.join(a, "standard", CreateParams::default(), true).unwrap();
        manager.leave(a).unwrap();
        assert_eq!(manager.debug_snapshot().waiting_games[0].state, None);

        // Stale entry for the freed session is skipped; b gets a new one
        assert!(matches!(
            manager.join(b, "standard", CreateParams::default(), true).unwrap(),
            JoinOutcome::Created(_)
        ));
    }

    #[test]
    fn test_disconnect_forgets_participant() {
        let (manager, _) = test_manager(1);
        let (a, pa) = connected(&manager);
        manager.join(a, "standard", CreateParams::default(), true).unwrap();

        manager.disconnect(a).unwrap();
        assert!(!manager.is_connected(a));
        assert!(manager.room_of(&pa).is_none());
        assert!(manager.allocator().is_free(0));
        assert!(matches!(
            manager.create(a, "standard", CreateParams::default()),
            Err(ManagerError::UnknownParticipant(_))
        ));
        assert!(manager.disconnect(a).is_err());
    }

    #[test]
    fn test_tutorial_pairs_with_scripted_partner() {
        let (manager, events) = test_manager(1);
        let (a, pa) = connected(&manager);

        manager.create(a, "tutorial", CreateParams::default()).unwrap();
        assert_eq!(events.names_for(&pa).first(), Some(&"start_game"));
        assert_eq!(
            manager.debug_snapshot().active_games[0].kind,
            GameKind::Tutorial
        );
        manager.shutdown();
    }
}
