//! Tick scheduler
//!
//! One OS thread per active session. Each iteration locks the session,
//! advances it one tick, releases the lock, broadcasts and sleeps. The loop
//! is the sole owner of an activated session's teardown: on exit it
//! broadcasts `end_game`, deactivates the session if needed and hands the ID
//! back through [`LobbyManager::cleanup`].

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info};

use crate::lobby::manager::LobbyManager;
use crate::lobby::room::{Session, SessionStatus};
use crate::metrics::Metrics;
use crate::net::protocol::ServerEvent;

pub fn spawn_session_loop(
    manager: Arc<LobbyManager>,
    session: Arc<Session>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("session-{}", session.id()))
        .spawn(move || run_session_loop(&manager, &session))
}

fn run_session_loop(manager: &LobbyManager, session: &Session) {
    let id = session.id();
    let interval = manager.tick_interval();
    let broadcaster = manager.broadcaster();
    let metrics = manager.metrics();

    debug!("Session {} loop started", id);

    let mut status = SessionStatus::Active;
    while !status.is_terminal() {
        let started = Instant::now();

        let outgoing = {
            let mut room = session.lock();
            match room.tick() {
                Ok(SessionStatus::Resetting) => {
                    status = SessionStatus::Resetting;
                    let pause = room.game().reset_timeout();
                    Metrics::incr(&metrics.resets);
                    let event = ServerEvent::ResetGame {
                        state: room.start_info(),
                        timeout: pause.as_millis() as u64,
                        data: room.take_data(),
                    };
                    Some((event, pause))
                }
                Ok(SessionStatus::Inactive) => {
                    status = SessionStatus::Inactive;
                    None
                }
                Ok(next) => {
                    status = next;
                    let event = ServerEvent::StatePong {
                        state: room.serialize_state(),
                    };
                    Some((event, interval))
                }
                Err(e) => {
                    error!("Session {} failed mid-play: {}", id, e);
                    status = SessionStatus::Inactive;
                    None
                }
            }
        };

        metrics.record_tick_time(started.elapsed());

        if let Some((event, pause)) = outgoing {
            broadcaster.to_room(id, &event);
            thread::sleep(pause);
        }
    }

    let data = {
        let mut room = session.lock();
        let data = room.take_data();
        if room.is_active() {
            room.deactivate();
        }
        data
    };

    broadcaster.to_room(id, &ServerEvent::EndGame { status, data });
    match status {
        SessionStatus::Done => Metrics::incr(&metrics.sessions_completed),
        _ => Metrics::incr(&metrics.sessions_aborted),
    }
    info!("Session {} ended with {:?}", id, status);

    if let Err(e) = manager.cleanup(id) {
        error!("Cleanup of session {} failed: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use crate::game::engine::{Action, EnvState};
    use crate::game::kinds::CreateParams;
    use crate::game::policy::{Policy, PolicyError, PolicyRegistry, STAY_AI};
    use crate::lobby::manager::tests::{connected, test_manager, test_manager_with, wait_until};
    use crate::lobby::room::SessionStatus;
    use crate::net::protocol::ServerEvent;
    use std::sync::Arc;

    struct Broken;

    impl Policy for Broken {
        fn action(&mut self, _state: &EnvState) -> Result<Action, PolicyError> {
            Err(PolicyError::Decision("no decision".to_string()))
        }
    }

    fn timed_out_game(layouts: usize) -> CreateParams {
        CreateParams {
            layouts: vec!["cramped_room".to_string(); layouts],
            game_time: 0,
            player_one: STAY_AI.to_string(),
            ..Default::default()
        }
    }

    fn end_status(events: &[ServerEvent]) -> Option<SessionStatus> {
        events.iter().find_map(|event| match event {
            ServerEvent::EndGame { status, .. } => Some(*status),
            _ => None,
        })
    }

    #[test]
    fn test_finished_session_ends_done_and_frees_id() {
        let (manager, events) = test_manager(1);
        let (a, pa) = connected(&manager);

        manager.create(a, "standard", timed_out_game(1)).unwrap();
        wait_until("end_game", || events.names_for(&pa).contains(&"end_game"));

        let names = events.names_for(&pa);
        assert_eq!(names.first(), Some(&"start_game"));
        assert_eq!(names.last(), Some(&"end_game"));
        assert!(!names.contains(&"reset_game"));
        assert_eq!(end_status(&events.events_for(&pa)), Some(SessionStatus::Done));

        wait_until("session freed", || manager.allocator().is_free(0));
        assert_eq!(manager.room_of(&pa), None);
        assert_eq!(
            manager.metrics().sessions_completed.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_layout_change_broadcasts_reset_then_pauses() {
        let (manager, events) = test_manager(1);
        let (a, pa) = connected(&manager);

        manager.create(a, "standard", timed_out_game(2)).unwrap();
        wait_until("reset_game", || events.names_for(&pa).contains(&"reset_game"));

        let reset = events
            .events_for(&pa)
            .into_iter()
            .find(|event| matches!(event, ServerEvent::ResetGame { .. }));
        assert!(matches!(reset, Some(ServerEvent::ResetGame { timeout: 3000, .. })));
        // Still paused: no tick has run on the second layout yet
        assert!(!events.names_for(&pa).contains(&"end_game"));

        wait_until("end_game", || events.names_for(&pa).contains(&"end_game"));
        let names: Vec<&str> = events
            .names_for(&pa)
            .into_iter()
            .filter(|name| *name != "state_pong")
            .collect();
        assert_eq!(names, vec!["start_game", "reset_game", "end_game"]);
        assert_eq!(end_status(&events.events_for(&pa)), Some(SessionStatus::Done));

        wait_until("session freed", || manager.allocator().is_free(0));
        assert_eq!(manager.room_of(&pa), None);
    }

    #[test]
    fn test_failed_tick_tears_session_down_inactive() {
        let mut policies = PolicyRegistry::new();
        policies.register("Broken", Arc::new(|| Box::new(Broken) as Box<dyn Policy>));
        let (manager, events) = test_manager_with(1, policies);
        let (a, pa) = connected(&manager);

        let params = CreateParams {
            player_one: "Broken".to_string(),
            ..Default::default()
        };
        manager.create(a, "standard", params).unwrap();
        wait_until("end_game", || events.names_for(&pa).contains(&"end_game"));

        let received = events.events_for(&pa);
        assert!(matches!(received.first(), Some(ServerEvent::StartGame { .. })));
        match received.last() {
            Some(ServerEvent::EndGame { status, data }) => {
                assert_eq!(*status, SessionStatus::Inactive);
                assert_eq!(data["trajectory"], serde_json::json!([]));
            }
            other => panic!("expected end_game, got {:?}", other),
        }

        wait_until("session freed", || manager.allocator().is_free(0));
        assert_eq!(manager.room_of(&pa), None);
        assert_eq!(
            manager.metrics().sessions_aborted.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
