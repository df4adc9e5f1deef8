//! Single-slot, last-write-wins hand-off
//!
//! The tick loop pushes the newest environment state; an NPC worker blocks
//! until a state is available and always reads the freshest one. Unconsumed
//! values are overwritten rather than queued.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

/// Cloneable handle to a shared single-value slot
pub struct LatestSlot<T> {
    inner: Arc<Inner<T>>,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                value: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// Store `value`, replacing any unconsumed one. Returns true if a value
    /// was overwritten.
    pub fn push(&self, value: T) -> bool {
        let replaced = self.inner.value.lock().replace(value).is_some();
        self.inner.ready.notify_one();
        replaced
    }

    /// Block until a value is present and take it
    pub fn recv(&self) -> T {
        let mut slot = self.inner.value.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.inner.ready.wait(&mut slot);
        }
    }
}

impl<T> Clone for LatestSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
