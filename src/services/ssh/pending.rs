//! Handoff queue between the manager thread and one handler thread.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// FIFO of items produced on one thread and consumed on another.
///
/// The manager pushes freshly accepted client streams; the handler drains
/// them at the top of every loop iteration. Neither side holds the lock
/// while doing I/O.
pub struct PendingQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
    }

    /// Take everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
