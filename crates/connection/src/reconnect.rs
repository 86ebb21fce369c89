//! Reconnect scheduling.

use std::cmp::Reverse;
use std::time::{Duration, Instant};

use corelib::NodeId;
use priority_queue::PriorityQueue;

/// Exponential backoff: `min(max, 2^attempt)` seconds.
pub fn backoff_delay(attempt: u32, max: Duration) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(max)
}

/// Nodes waiting for a reconnect attempt, ordered by deadline.
///
/// A node appears at most once. Scheduling a node that is already queued
/// keeps the earlier deadline.
#[derive(Debug, Default)]
pub struct ReconnectQueue {
    queue: PriorityQueue<NodeId, Reverse<Instant>>,
}

impl ReconnectQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, node: NodeId, deadline: Instant) {
        self.queue.push_increase(node, Reverse(deadline));
    }

    pub fn remove(&mut self, node: &NodeId) -> bool {
        self.queue.remove(node).is_some()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.queue.get(node).is_some()
    }

    pub fn deadline(&self, node: &NodeId) -> Option<Instant> {
        self.queue.get_priority(node).map(|Reverse(deadline)| *deadline)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|(_, Reverse(deadline))| *deadline)
    }

    /// Remove and return every node whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<NodeId> {
        let mut due = Vec::new();
        while let Some((_, Reverse(deadline))) = self.queue.peek() {
            if *deadline > now {
                break;
            }
            if let Some((node, _)) = self.queue.pop() {
                due.push(node);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let max = Duration::from_secs(30);
        let delays: Vec<Duration> = (0..40).map(|a| backoff_delay(a, max)).collect();

        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[4], Duration::from_secs(16));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), max);
        assert_eq!(backoff_delay(u32::MAX, max), max);
    }

    #[test]
    fn test_schedule_keeps_earlier_deadline() {
        let now = Instant::now();
        let node = NodeId(1);
        let mut queue = ReconnectQueue::new();

        queue.schedule(node, now + Duration::from_secs(8));
        queue.schedule(node, now + Duration::from_secs(2));
        queue.schedule(node, now + Duration::from_secs(4));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.deadline(&node), Some(now + Duration::from_secs(2)));
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let now = Instant::now();
        let mut queue = ReconnectQueue::new();
        queue.schedule(NodeId(1), now + Duration::from_secs(3));
        queue.schedule(NodeId(2), now + Duration::from_secs(1));
        queue.schedule(NodeId(3), now + Duration::from_secs(10));

        assert!(queue.pop_due(now).is_empty());
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));

        let due = queue.pop_due(now + Duration::from_secs(5));
        assert_eq!(due, vec![NodeId(2), NodeId(1)]);
        assert_eq!(queue.len(), 1);
        assert!(queue.remove(&NodeId(3)));
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_pop_due_yields_each_node_once_in_order(
            offsets in proptest::collection::vec((0u128..32, 0u64..100), 1..64)
        ) {
            let now = Instant::now();
            let mut queue = ReconnectQueue::new();
            let mut earliest = std::collections::HashMap::new();
            for (node, secs) in &offsets {
                let deadline = now + Duration::from_secs(*secs);
                queue.schedule(NodeId(*node), deadline);
                let entry = earliest.entry(NodeId(*node)).or_insert(deadline);
                *entry = (*entry).min(deadline);
            }

            let due = queue.pop_due(now + Duration::from_secs(100));
            prop_assert_eq!(due.len(), earliest.len());
            prop_assert!(queue.is_empty());
            let deadlines: Vec<Instant> = due.iter().map(|n| earliest[n]).collect();
            prop_assert!(deadlines.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
