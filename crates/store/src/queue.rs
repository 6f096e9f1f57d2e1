use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dds_rules::Origin;
use tokio::sync::Notify;

/// Unbounded FIFO of snapshots waiting for one connection's dispatch worker.
///
/// There is a single consumer per queue. A slow client blocks every later item
/// behind its outstanding push, regardless of kind.
pub struct PushQueue {
    items: Mutex<VecDeque<Arc<Origin>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Default for PushQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PushQueue {
    pub fn new() -> Self {
        Self { items: Mutex::new(VecDeque::new()), notify: Notify::new(), closed: AtomicBool::new(false) }
    }

    /// Append `origin`. Returns false once the queue is shut down.
    pub fn push(&self, origin: Arc<Origin>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.lock().push_back(origin);
        self.notify.notify_one();
        true
    }

    /// Next snapshot in arrival order, or `None` after shutdown. Items still
    /// queued at shutdown are discarded.
    pub async fn pop(&self) -> Option<Arc<Origin>> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let next = self.lock().pop_front();
            if let Some(o) = next {
                return Some(o);
            }
            self.notify.notified().await;
        }
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock().clear();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<Origin>>> {
        // Poisoning only follows a panic while pushing or popping; the deque is still usable.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}
