//! Room hub
//!
//! Tracks one outbound channel per connection plus room membership, and
//! implements [`Broadcaster`] on top of them. Events are encoded once per
//! broadcast and shared between recipients.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tracing::{debug, error};
use uuid::Uuid;

use crate::lobby::allocator::SessionId;
use crate::lobby::broadcast::Broadcaster;
use crate::lobby::player::ParticipantId;
use crate::metrics::Metrics;
use crate::net::protocol::{encode, ServerEvent};

/// An encoded event, shared by every recipient
pub type Frame = Arc<[u8]>;

/// Frames queued per connection before new ones are dropped. A client that
/// stops reading loses state updates rather than growing the queue.
pub const OUTBOUND_CAPACITY: usize = 256;

pub struct RoomHub {
    connections: RwLock<HashMap<Uuid, Sender<Frame>>>,
    rooms: RwLock<HashMap<SessionId, HashSet<Uuid>>>,
    metrics: Arc<Metrics>,
}

impl RoomHub {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Open the outbound channel for a connection
    pub fn register(&self, conn: Uuid) -> Receiver<Frame> {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.connections.write().insert(conn, tx);
        rx
    }

    /// Drop the outbound channel; the writer task drains and exits
    pub fn unregister(&self, conn: Uuid) {
        self.connections.write().remove(&conn);
        let mut rooms = self.rooms.write();
        for members in rooms.values_mut() {
            members.remove(&conn);
        }
        rooms.retain(|_, members| !members.is_empty());
    }

    pub fn room_size(&self, room: SessionId) -> usize {
        self.rooms.read().get(&room).map_or(0, HashSet::len)
    }

    fn frame(event: &ServerEvent) -> Option<Frame> {
        match encode(event) {
            Ok(bytes) => Some(bytes.into()),
            Err(e) => {
                error!("Failed to encode {}: {}", event.name(), e);
                None
            }
        }
    }

    fn send(&self, conns: impl IntoIterator<Item = Uuid>, frame: &Frame) {
        let connections = self.connections.read();
        for conn in conns {
            let Some(tx) = connections.get(&conn) else {
                continue;
            };
            match tx.try_send(Arc::clone(frame)) {
                Ok(()) => Metrics::incr(&self.metrics.messages_sent),
                Err(TrySendError::Full(_)) => {
                    Metrics::incr(&self.metrics.messages_dropped);
                    debug!("Outbound queue full for {}, frame dropped", conn);
                }
                Err(TrySendError::Closed(_)) => debug!("Connection {} already closed", conn),
            }
        }
    }
}

impl Broadcaster for RoomHub {
    fn to_room(&self, room: SessionId, event: &ServerEvent) {
        let members: Vec<Uuid> = match self.rooms.read().get(&room) {
            Some(members) => members.iter().copied().collect(),
            None => return,
        };
        if let Some(frame) = Self::frame(event) {
            self.send(members, &frame);
        }
    }

    fn to_participant(&self, participant: &ParticipantId, event: &ServerEvent) {
        let Some(conn) = participant.connection() else {
            return;
        };
        if let Some(frame) = Self::frame(event) {
            self.send([conn], &frame);
        }
    }

    fn join_room(&self, participant: &ParticipantId, room: SessionId) {
        if let Some(conn) = participant.connection() {
            self.rooms.write().entry(room).or_default().insert(conn);
        }
    }

    fn leave_room(&self, participant: &ParticipantId, room: SessionId) {
        let Some(conn) = participant.connection() else {
            return;
        };
        let mut rooms = self.rooms.write();
        if let Some(members) = rooms.get_mut(&room) {
            members.remove(&conn);
            if members.is_empty() {
                rooms.remove(&room);
            }
        }
    }

    fn close_room(&self, room: SessionId) {
        self.rooms.write().remove(&room);
    }
}
