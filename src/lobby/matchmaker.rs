//! FIFO of sessions waiting for more participants
//!
//! Entries can go stale: a waiting session may be emptied and freed through
//! another path while its ID is still queued. Consumers skip any entry whose
//! ID is currently free. A live ID is never queued twice.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;

use crate::lobby::allocator::{SessionId, SlotAllocator};

#[derive(Default)]
pub struct Matchmaker {
    waiting: Mutex<VecDeque<SessionId>>,
}

impl Matchmaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_waiting(&self, id: SessionId) {
        self.waiting.lock().push_back(id);
    }

    /// Pop until a live waiting session is found
    ///
    /// The queue lock is released before each allocator lookup so the two
    /// locks are never held together.
    pub fn dequeue_waiting(&self, allocator: &SlotAllocator) -> Option<SessionId> {
        loop {
            let id = self.waiting.lock().pop_front()?;
            if !allocator.is_free(id) {
                return Some(id);
            }
            debug!("Skipping stale waiting entry {}", id);
        }
    }

    /// Queue contents, front first
    pub fn snapshot(&self) -> Vec<SessionId> {
        self.waiting.lock().iter().copied().collect()
    }
}
