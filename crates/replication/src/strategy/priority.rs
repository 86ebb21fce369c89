//! Read-priority replica selection.
//!
//! Writes are always served by the master. Reads are served according to a
//! [`ReadPriority`]:
//!
//! - `Master`: the master, like writes
//! - `Slave`: the first slave, or the master if the group has no slave
//! - `RoundRobin`: every member in turn, master included
//!
//! # Performance
//!
//! - **Time**: O(1); round robin uses a single relaxed atomic counter shared
//!   by all groups

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::group::{ReplicaGroup, ReplicaMember};
use crate::strategy::{Intent, ReadPriority, ReplicationStrategy};

#[derive(Debug)]
pub struct PriorityStrategy {
    priority: ReadPriority,
    next: AtomicUsize,
}

impl PriorityStrategy {
    pub fn new(priority: ReadPriority) -> Self {
        Self {
            priority,
            next: AtomicUsize::new(0),
        }
    }

    pub fn priority(&self) -> ReadPriority {
        self.priority
    }
}

impl Default for PriorityStrategy {
    fn default() -> Self {
        Self::new(ReadPriority::Master)
    }
}

impl ReplicationStrategy for PriorityStrategy {
    fn select<'g>(&self, group: &'g ReplicaGroup, intent: Intent) -> Option<&'g ReplicaMember> {
        if intent == Intent::Write {
            return group.master.as_ref();
        }
        match self.priority {
            ReadPriority::Master => group.master.as_ref(),
            ReadPriority::Slave => group.slaves.first().or(group.master.as_ref()),
            ReadPriority::RoundRobin => {
                let count = group.members().count();
                if count == 0 {
                    return None;
                }
                let turn = self.next.fetch_add(1, Ordering::Relaxed) % count;
                group.members().nth(turn)
            }
        }
    }

    fn name(&self) -> &'static str {
        "PriorityStrategy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::ReplicaMember;

    fn group() -> ReplicaGroup {
        let members: Vec<ReplicaMember> = ["g0^M^a:1", "g0^S^b:1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ReplicaGroup::from_members(&members).unwrap().remove("g0").unwrap()
    }

    #[test]
    fn test_writes_always_hit_master() {
        let g = group();
        for priority in [ReadPriority::Master, ReadPriority::Slave, ReadPriority::RoundRobin] {
            let strategy = PriorityStrategy::new(priority);
            assert_eq!(strategy.select(&g, Intent::Write).unwrap().addr, "a:1");
        }
    }

    #[test]
    fn test_read_priorities() {
        let g = group();
        assert_eq!(
            PriorityStrategy::new(ReadPriority::Master).select(&g, Intent::Read).unwrap().addr,
            "a:1"
        );
        assert_eq!(
            PriorityStrategy::new(ReadPriority::Slave).select(&g, Intent::Read).unwrap().addr,
            "b:1"
        );

        let rr = PriorityStrategy::new(ReadPriority::RoundRobin);
        let picks: Vec<String> = (0..4)
            .map(|_| rr.select(&g, Intent::Read).unwrap().addr.clone())
            .collect();
        assert_eq!(picks, vec!["a:1", "b:1", "a:1", "b:1"]);
    }

    #[test]
    fn test_slave_priority_without_slaves_uses_master() {
        let mut g = group();
        g.slaves.clear();
        let strategy = PriorityStrategy::new(ReadPriority::Slave);
        assert_eq!(strategy.select(&g, Intent::Read).unwrap().addr, "a:1");

        g.master = None;
        assert!(strategy.select(&g, Intent::Write).is_none());
    }
}
