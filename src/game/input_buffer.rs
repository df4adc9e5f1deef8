//! Per-slot action queues
//!
//! Uses crossbeam-channel so connection handlers and NPC workers can submit
//! actions without touching the session lock. Each player slot owns one
//! bounded queue; the tick loop drains at most one action per slot per tick.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;

use crate::game::engine::Action;
use crate::lobby::player::ParticipantId;

/// Queue bound for NPC slots: at most one decision in flight
pub const NPC_QUEUE_CAPACITY: usize = 1;

/// Create a fresh bounded queue for one slot
pub fn slot_queue(capacity: usize) -> (Sender<Action>, Receiver<Action>) {
    // A zero-capacity channel would be a rendezvous channel and always drop
    bounded(capacity.max(1))
}

struct SlotInput {
    owner: ParticipantId,
    sender: Sender<Action>,
}

/// Shared enqueue path for a session
///
/// Holds the sender side of each slot queue plus the session's active flag.
/// Human actions and NPC decisions both go through [`ActionInputs::enqueue`].
pub struct ActionInputs {
    active: AtomicBool,
    slots: RwLock<Vec<Option<SlotInput>>>,
}

impl ActionInputs {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            slots: RwLock::new(Vec::new()),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Clearing the flag waits out any enqueue already past its check, so
    /// nothing lands in a queue after this returns.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
        if !active {
            // Enqueues hold the read lock from the flag check through the send
            drop(self.slots.write());
        }
    }

    /// Route `slot` to `owner`, replacing any previous binding
    pub fn bind(&self, slot: usize, owner: ParticipantId, sender: Sender<Action>) {
        let mut slots = self.slots.write();
        if slots.len() <= slot {
            slots.resize_with(slot + 1, || None);
        }
        slots[slot] = Some(SlotInput { owner, sender });
    }

    pub fn unbind(&self, slot: usize) {
        if let Some(entry) = self.slots.write().get_mut(slot) {
            *entry = None;
        }
    }

    /// Submit an action (non-blocking)
    ///
    /// Rejected when the session is inactive or the participant holds no
    /// slot; dropped when the slot's queue is full (backpressure).
    pub fn enqueue(&self, participant: &ParticipantId, action: Action) -> EnqueueOutcome {
        let slots = self.slots.read();
        if !self.is_active() {
            return EnqueueOutcome::Inactive;
        }

        let Some(input) = slots.iter().flatten().find(|s| &s.owner == participant) else {
            return EnqueueOutcome::NotAPlayer;
        };

        match input.sender.try_send(action) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(TrySendError::Full(_)) => EnqueueOutcome::Dropped,
            Err(TrySendError::Disconnected(_)) => EnqueueOutcome::Inactive,
        }
    }
}

impl Default for ActionInputs {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to a submitted action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queue full, action discarded
    Dropped,
    /// Session not active
    Inactive,
    /// Participant does not hold a player slot
    NotAPlayer,
}
