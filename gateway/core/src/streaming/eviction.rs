//! Deadline queue for closed-session eviction
//!
//! A min-heap of `(deadline, session id)`. The registry pushes an entry when a
//! session closes and drains due entries on each sweep; draining takes an
//! explicit `now`, so eviction is deterministic under test.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tokio::time::Instant;

/// Min-heap of pending evictions
#[derive(Debug, Default)]
pub struct EvictionQueue {
    heap: BinaryHeap<Reverse<(Instant, String)>>,
}

impl EvictionQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `id` for eviction at `deadline`
    pub fn schedule(&mut self, id: String, deadline: Instant) {
        self.heap.push(Reverse((deadline, id)));
    }

    /// Remove and return every entry whose deadline is at or before `now`
    pub fn drain_due(&mut self, now: Instant) -> Vec<String> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, _))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            if let Some(Reverse((_, id))) = self.heap.pop() {
                due.push(id);
            }
        }
        due
    }

    /// Earliest pending deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Number of pending entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_drains_in_deadline_order() {
        let base = Instant::now();
        let mut queue = EvictionQueue::new();
        queue.schedule("late".to_string(), base + Duration::from_secs(30));
        queue.schedule("early".to_string(), base + Duration::from_secs(10));
        queue.schedule("mid".to_string(), base + Duration::from_secs(20));

        assert_eq!(queue.next_deadline(), Some(base + Duration::from_secs(10)));
        assert!(queue.drain_due(base).is_empty());
        assert_eq!(
            queue.drain_due(base + Duration::from_secs(20)),
            vec!["early".to_string(), "mid".to_string()]
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain_due(base + Duration::from_secs(60)), vec!["late".to_string()]);
        assert!(queue.is_empty());
    }
}
