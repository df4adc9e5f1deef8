use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Serialize, Serializer};
use uuid::Uuid;

/// Identity of anything that can occupy a slot or spectate
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParticipantId {
    /// A connected client
    Human(Uuid),
    /// A synthetic automated participant, bound to one slot of one session
    Npc { kind: String, slot: usize },
}

impl ParticipantId {
    pub fn human(id: Uuid) -> Self {
        ParticipantId::Human(id)
    }

    pub fn npc(kind: &str, slot: usize) -> Self {
        ParticipantId::Npc {
            kind: kind.to_string(),
            slot,
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, ParticipantId::Human(_))
    }

    /// Connection ID for humans
    pub fn connection(&self) -> Option<Uuid> {
        match self {
            ParticipantId::Human(id) => Some(*id),
            ParticipantId::Npc { .. } => None,
        }
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantId::Human(id) => write!(f, "{}", id),
            ParticipantId::Npc { kind, slot } => write!(f, "{}_{}", kind, slot),
        }
    }
}

impl Serialize for ParticipantId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<Uuid> for ParticipantId {
    fn from(id: Uuid) -> Self {
        ParticipantId::Human(id)
    }
}

/// Per-connection lock serializing one user's create/join/leave against
/// themselves
#[derive(Debug, Clone, Default)]
pub struct UserLock(Arc<Mutex<()>>);

impl UserLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock()
    }
}
