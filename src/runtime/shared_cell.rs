//! A single-slot mailbox for "latest value" hand-off between threads.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

/// One writer slot with notify-on-write and blocking first read. Subsequent
/// reads return the most recent value; there is no queueing.
pub struct SharedCell<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SharedCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for SharedCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedCell<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Stores a new value, waking any blocked readers, and returns the
    /// previous value if one existed.
    pub fn swap(&self, value: T) -> Option<T> {
        let mut slot = self.inner.slot.lock();
        let old = slot.replace(value);
        self.inner.cond.notify_all();
        old
    }
}

impl<T: Clone> SharedCell<T> {
    /// Blocks until the first `swap`, then returns a copy of the most
    /// recent value.
    pub fn read(&self) -> T {
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.inner.cond.wait(&mut slot);
        }
    }

    /// Non-blocking read of the latest value, if any.
    pub fn try_read(&self) -> Option<T> {
        self.inner.slot.lock().clone()
    }
}
