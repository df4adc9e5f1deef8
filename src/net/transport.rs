//! TCP transport
//!
//! One reader loop and one writer task per connection. Opening a connection
//! is `connect`, closing it is `disconnect`. Lobby calls take blocking locks,
//! so they run on the blocking pool; events from one connection are still
//! handled strictly in order.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::lobby::manager::LobbyManager;
use crate::metrics::Metrics;
use crate::net::framing::{read_frame, write_frame, FramingError};
use crate::net::hub::RoomHub;
use crate::net::protocol::{decode, ClientEvent};

/// TCP server
pub struct TcpServer {
    listener: TcpListener,
    manager: Arc<LobbyManager>,
    hub: Arc<RoomHub>,
    metrics: Arc<Metrics>,
}

impl TcpServer {
    /// Bind the listener
    pub async fn bind(
        config: &ServerConfig,
        manager: Arc<LobbyManager>,
        hub: Arc<RoomHub>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let addr = SocketAddr::new(config.bind_address, config.port);
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            manager,
            hub,
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> anyhow::Result<()> {
        info!("Listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = self.listener.accept().await?;
            let _ = stream.set_nodelay(true);

            let manager = self.manager.clone();
            let hub = self.hub.clone();
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, manager, hub, metrics).await {
                    warn!("Connection error from {}: {}", peer, e);
                }
            });
        }
    }
}

/// Serve one connection until it closes
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<LobbyManager>,
    hub: Arc<RoomHub>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let conn = Uuid::new_v4();
    let (mut reader, mut writer) = stream.into_split();

    let mut outbound = hub.register(conn);
    manager.connect(conn);
    Metrics::incr(&metrics.connections_active);
    info!("Connection {} opened from {}", conn, peer);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("Write to {} failed: {}", conn, e);
                break;
            }
        }
    });

    let result = loop {
        let bytes = match read_frame(&mut reader).await {
            Ok(bytes) => bytes,
            Err(FramingError::ConnectionClosed) => break Ok(()),
            Err(e) => break Err(anyhow::Error::from(e)),
        };
        Metrics::incr(&metrics.messages_received);

        match decode::<ClientEvent>(&bytes) {
            Ok(event) => dispatch(&manager, conn, event).await,
            Err(e) => warn!("Dropping malformed event from {}: {}", conn, e),
        }
    };

    let teardown = manager.clone();
    match tokio::task::spawn_blocking(move || teardown.disconnect(conn)).await {
        Ok(Err(e)) => error!("Disconnect of {} failed: {}", conn, e),
        Err(e) => error!("Disconnect task for {} panicked: {}", conn, e),
        Ok(Ok(())) => {}
    }

    hub.unregister(conn);
    let _ = writer_task.await;
    Metrics::decr(&metrics.connections_active);
    info!("Connection {} closed", conn);

    result
}

async fn dispatch(manager: &Arc<LobbyManager>, conn: Uuid, event: ClientEvent) {
    if let ClientEvent::Action { action } = event {
        // Only touches the input queues, never the session lock
        manager.submit_action(conn, action);
        return;
    }

    let manager = manager.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || handle_event(&manager, conn, event)).await
    {
        error!("Event handler for {} panicked: {}", conn, e);
    }
}

fn handle_event(manager: &LobbyManager, conn: Uuid, event: ClientEvent) {
    match event {
        ClientEvent::Create(request) => {
            if let Err(e) = manager.create(conn, &request.game_name, request.params) {
                debug!("Create for {} failed: {}", conn, e);
            }
        }
        ClientEvent::Join(request) => {
            match manager.join(
                conn,
                &request.game_name,
                request.params,
                request.create_if_not_found,
            ) {
                Ok(outcome) => debug!("Join for {}: {:?}", conn, outcome),
                Err(e) => debug!("Join for {} failed: {}", conn, e),
            }
        }
        ClientEvent::Leave => {
            if let Err(e) = manager.leave(conn) {
                warn!("Leave for {} failed: {}", conn, e);
            }
        }
        ClientEvent::Action { action } => {
            manager.submit_action(conn, action);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    use super::*;
    use crate::game::engine::Environment;
    use crate::game::kinds::GameContext;
    use crate::game::policy::PolicyRegistry;
    use crate::game::sandbox::GridWorld;
    use crate::lobby::manager::LobbyConfig;
    use crate::net::protocol::{encode, ServerEvent};

    async fn start_server(capacity: usize) -> (SocketAddr, Arc<LobbyManager>) {
        let metrics = Arc::new(Metrics::new());
        let hub = Arc::new(RoomHub::new(metrics.clone()));
        let games = GameContext {
            environment: Arc::new(|| {
                Box::new(GridWorld::new(vec!["cramped_room".to_string()])) as Box<dyn Environment>
            }),
            max_game_time: Duration::from_secs(120),
            default_layouts: vec!["cramped_room".to_string()],
            sink: None,
        };
        let lobby = LobbyConfig {
            max_sessions: capacity,
            target_fps: 100,
            ..Default::default()
        };
        let manager = LobbyManager::new(
            lobby,
            PolicyRegistry::new(),
            games,
            hub.clone(),
            metrics.clone(),
        );

        let config = ServerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Default::default()
        };
        let server = TcpServer::bind(&config, manager.clone(), hub, metrics)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, manager)
    }

    async fn send(writer: &mut OwnedWriteHalf, json: &str) {
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        write_frame(writer, &encode(&event).unwrap()).await.unwrap();
    }

    async fn next_event(reader: &mut OwnedReadHalf) -> ServerEvent {
        let bytes = tokio::time::timeout(Duration::from_secs(5), read_frame(reader))
            .await
            .expect("timed out waiting for event")
            .unwrap();
        decode(&bytes).unwrap()
    }

    async fn wait_for(reader: &mut OwnedReadHalf, name: &str) -> ServerEvent {
        loop {
            let event = next_event(reader).await;
            if event.name() == name {
                return event;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_clients_matched() {
        let (addr, manager) = start_server(1).await;

        let (mut a_read, mut a_write) = TcpStream::connect(addr).await.unwrap().into_split();
        send(&mut a_write, r#"{"event": "join", "data": {}}"#).await;
        assert_eq!(
            next_event(&mut a_read).await,
            ServerEvent::Waiting { in_game: true }
        );

        let (mut b_read, mut b_write) = TcpStream::connect(addr).await.unwrap().into_split();
        send(&mut b_write, r#"{"event": "join", "data": {}}"#).await;

        for reader in [&mut a_read, &mut b_read] {
            match wait_for(reader, "start_game").await {
                ServerEvent::StartGame { spectating, .. } => assert!(!spectating),
                other => panic!("unexpected {:?}", other),
            }
        }

        // A third client finds the single slot taken
        let (mut c_read, mut c_write) = TcpStream::connect(addr).await.unwrap().into_split();
        send(&mut c_write, r#"{"event": "create", "data": {}}"#).await;
        assert!(matches!(
            next_event(&mut c_read).await,
            ServerEvent::CreationFailed { .. }
        ));

        // Dropping B ends the session for A and frees the slot
        drop(b_write);
        drop(b_read);
        match wait_for(&mut a_read, "end_game").await {
            ServerEvent::EndGame { status, .. } => {
                assert_eq!(status, crate::lobby::room::SessionStatus::Inactive)
            }
            other => panic!("unexpected {:?}", other),
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.allocator().available() != 1 {
            assert!(tokio::time::Instant::now() < deadline, "slot never freed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::task::spawn_blocking(move || manager.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_event_ignored() {
        let (addr, _manager) = start_server(1).await;
        let (mut read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();

        write_frame(&mut write, b"{not json").await.unwrap();
        send(&mut write, r#"{"event": "leave"}"#).await;
        assert_eq!(next_event(&mut read).await, ServerEvent::EndLobby);
    }
}
