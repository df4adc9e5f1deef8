//! Bounded session ID pool
//!
//! IDs are integers in `[0, capacity)`. Each is owned by exactly one of the
//! free pool, the waiting queue or the active set; this pool tracks the first.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::error;

pub type SessionId = usize;

struct Pool {
    /// Free IDs in hand-out order
    free: VecDeque<SessionId>,
    /// `free_map[id]` is true iff `id` is currently unowned
    free_map: Vec<bool>,
}

/// Thread-safe pool of session IDs
pub struct SlotAllocator {
    pool: Mutex<Pool>,
}

impl SlotAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: Mutex::new(Pool {
                free: (0..capacity).collect(),
                free_map: vec![true; capacity],
            }),
        }
    }

    /// Take a free ID (non-blocking)
    pub fn acquire(&self) -> Result<SessionId, AllocatorError> {
        let mut pool = self.pool.lock();
        let id = pool.free.pop_front().ok_or(AllocatorError::Exhausted)?;

        if !pool.free_map[id] {
            error!("Session ID {} was queued as free while in use", id);
            return Err(AllocatorError::AlreadyInUse(id));
        }
        pool.free_map[id] = false;
        Ok(id)
    }

    /// Return an ID to the pool. Releasing a free ID is a bug in the caller.
    pub fn release(&self, id: SessionId) -> Result<(), AllocatorError> {
        let mut pool = self.pool.lock();
        match pool.free_map.get(id).copied() {
            None => {
                error!("Release of unknown session ID {}", id);
                Err(AllocatorError::UnknownId(id))
            }
            Some(true) => {
                error!("Double free of session ID {}", id);
                Err(AllocatorError::DoubleFree(id))
            }
            Some(false) => {
                pool.free_map[id] = true;
                pool.free.push_back(id);
                Ok(())
            }
        }
    }

    /// Unknown IDs report as free so they are never mistaken for live sessions
    pub fn is_free(&self, id: SessionId) -> bool {
        self.pool.lock().free_map.get(id).copied().unwrap_or(true)
    }

    pub fn available(&self) -> usize {
        self.pool.lock().free.len()
    }

    /// Free IDs in the order they will be handed out
    pub fn free_ids(&self) -> Vec<SessionId> {
        self.pool.lock().free.iter().copied().collect()
    }

    pub fn free_map(&self) -> Vec<bool> {
        self.pool.lock().free_map.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    #[error("Server at max capacity")]
    Exhausted,
    #[error("Double free of session {0}")]
    DoubleFree(SessionId),
    #[error("Session {0} is not managed by this pool")]
    UnknownId(SessionId),
    #[error("Session {0} was handed out while already in use")]
    AlreadyInUse(SessionId),
}

impl AllocatorError {
    /// Capacity exhaustion is expected; everything else is an invariant breach
    pub fn is_capacity(&self) -> bool {
        matches!(self, AllocatorError::Exhausted)
    }
}
