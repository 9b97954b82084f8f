//! FIFO queue for removals deferred to the start of the next frame.
//!
//! Removals requested mid-frame must not invalidate command buffers already recorded
//! against the removed object. They are queued here and applied by the next `update`,
//! which only drains the entries that were pending when it started: callbacks run during
//! the drain may queue further removals, and those wait for the following frame.

use parking_lot::Mutex;
use std::collections::VecDeque;

pub struct RemovalQueue<K> {
    pending: Mutex<VecDeque<K>>,
    name: &'static str,
}

impl<K> std::fmt::Debug for RemovalQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalQueue")
            .field("name", &self.name)
            .field("count", &self.len())
            .finish()
    }
}

impl<K> RemovalQueue<K> {
    pub fn new(name: &'static str) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            name,
        }
    }

    pub fn push(&self, key: K) {
        let mut pending = self.pending.lock();
        pending.push_back(key);
        log::trace!(
            "[RemovalQueue] Added to '{}' (now has {} items)",
            self.name,
            pending.len()
        );
    }

    /// Applies `remove` to the entries pending at call time, oldest first.
    ///
    /// The lock is released around each callback so it may push new entries.
    /// Returns how many entries were drained.
    pub fn drain_pending(&self, mut remove: impl FnMut(K)) -> usize {
        let count = self.len();
        if count == 0 {
            return 0;
        }

        log::debug!("[RemovalQueue] Draining '{}' ({} items)", self.name, count);
        let mut drained = 0;
        while drained < count {
            let Some(key) = self.pending.lock().pop_front() else {
                break;
            };
            remove(key);
            drained += 1;
        }
        drained
    }

    pub fn contains(&self, key: &K) -> bool
    where
        K: PartialEq,
    {
        self.pending.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_fifo_order() {
        let queue = RemovalQueue::new("test_fifo");
        queue.push(1);
        queue.push(2);
        queue.push(3);

        let mut seen = Vec::new();
        assert_eq!(queue.drain_pending(|key| seen.push(key)), 3);
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn entries_queued_during_drain_wait() {
        let queue = RemovalQueue::new("test_requeue");
        queue.push(1);
        queue.push(2);

        let mut seen = Vec::new();
        let drained = queue.drain_pending(|key| {
            seen.push(key);
            queue.push(key + 10);
        });
        assert_eq!(drained, 2);
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(queue.len(), 2);

        let mut next = Vec::new();
        queue.drain_pending(|key| next.push(key));
        assert_eq!(next, vec![11, 12]);
    }

    #[test]
    fn contains_sees_only_pending_entries() {
        let queue = RemovalQueue::new("test_contains");
        queue.push(7);
        assert!(queue.contains(&7));
        assert!(!queue.contains(&8));
        queue.drain_pending(|_| {});
        assert!(!queue.contains(&7));
    }
}
