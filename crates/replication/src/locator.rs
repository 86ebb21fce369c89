//! Key to replica resolution.
//!
//! The ring is built over group names; a key first resolves to a group and
//! then to a member of it through the [`ReplicationStrategy`]. Ring and group
//! table are published together as one snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use corelib::{HashRing, Node, NodeId};
use parking_lot::RwLock;

use crate::group::{ReplicaGroup, ReplicaMember};
use crate::strategy::{Intent, ReplicationStrategy};

#[derive(Debug)]
struct ReplicaState {
    ring: Arc<HashRing>,
    groups: BTreeMap<String, ReplicaGroup>,
    by_ring_id: HashMap<NodeId, String>,
}

impl ReplicaState {
    fn group_for(&self, key: &[u8]) -> Option<&ReplicaGroup> {
        let ring_id = self.ring.lookup(key)?;
        self.groups.get(self.by_ring_id.get(&ring_id)?)
    }
}

pub struct ReplicaLocator {
    state: RwLock<Arc<ReplicaState>>,
    strategy: Box<dyn ReplicationStrategy>,
}

impl ReplicaLocator {
    /// Create a locator with an empty table. `ring` supplies the partitioner
    /// and vnode count; its nodes are ignored.
    pub fn new(ring: HashRing, strategy: Box<dyn ReplicationStrategy>) -> Self {
        let ring = ring.with_changes(&[], &ring.node_ids());
        Self {
            state: RwLock::new(Arc::new(ReplicaState {
                ring: Arc::new(ring),
                groups: BTreeMap::new(),
                by_ring_id: HashMap::new(),
            })),
            strategy,
        }
    }

    fn snapshot(&self) -> Arc<ReplicaState> {
        Arc::clone(&self.state.read())
    }

    /// The installed group table.
    pub fn groups(&self) -> BTreeMap<String, ReplicaGroup> {
        self.snapshot().groups.clone()
    }

    pub fn group(&self, name: &str) -> Option<ReplicaGroup> {
        self.snapshot().groups.get(name).cloned()
    }

    /// The group that owns `key`.
    pub fn group_for(&self, key: &[u8]) -> Option<ReplicaGroup> {
        self.snapshot().group_for(key).cloned()
    }

    /// The member that should serve `intent` on `key`.
    pub fn select(&self, key: &[u8], intent: Intent) -> Option<NodeId> {
        let state = self.snapshot();
        let group = state.group_for(key)?;
        self.strategy.select(group, intent).map(ReplicaMember::node_id)
    }

    /// The members of the key's group, master first. Replicas of other groups
    /// hold different data and are never fallbacks.
    pub fn members_for(&self, key: &[u8]) -> Vec<NodeId> {
        self.snapshot()
            .group_for(key)
            .map(|g| g.members().map(ReplicaMember::node_id).collect())
            .unwrap_or_default()
    }

    /// Replace the group table, rebuilding the ring from the new group names.
    pub fn install(&self, groups: BTreeMap<String, ReplicaGroup>) {
        let mut state = self.state.write();
        *state = Arc::new(Self::rebuild(&state, groups));
    }

    /// Promote the first slave of `group` locally. Returns the old and new
    /// master, or `None` if the group cannot switch over.
    pub fn switchover(&self, group: &str) -> Option<(ReplicaMember, ReplicaMember)> {
        let mut state = self.state.write();
        let current = state.groups.get(group)?;
        let next = current.switched_over()?;
        let old = current.master.clone()?;
        let new = next.master.clone()?;
        let mut groups = state.groups.clone();
        groups.insert(group.to_string(), next);
        *state = Arc::new(Self::rebuild(&state, groups));
        Some((old, new))
    }

    fn rebuild(current: &ReplicaState, groups: BTreeMap<String, ReplicaGroup>) -> ReplicaState {
        let added: Vec<Node> = groups
            .values()
            .filter(|g| !current.groups.contains_key(&g.name))
            .map(ReplicaGroup::ring_node)
            .collect();
        let removed: Vec<NodeId> = current
            .groups
            .values()
            .filter(|g| !groups.contains_key(&g.name))
            .map(|g| g.ring_node().id)
            .collect();
        let ring = current.ring.with_changes(&added, &removed);
        let by_ring_id = groups
            .values()
            .map(|g| (g.ring_node().id, g.name.clone()))
            .collect();
        ReplicaState {
            ring: Arc::new(ring),
            groups,
            by_ring_id,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }
}

impl fmt::Debug for ReplicaLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.snapshot();
        f.debug_struct("ReplicaLocator")
            .field("groups", &state.groups.keys().collect::<Vec<_>>())
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{PriorityStrategy, ReadPriority};

    fn locator(priority: ReadPriority, members: &[&str]) -> ReplicaLocator {
        let locator = ReplicaLocator::new(HashRing::new(), Box::new(PriorityStrategy::new(priority)));
        let members: Vec<ReplicaMember> = members.iter().map(|s| s.parse().unwrap()).collect();
        locator.install(ReplicaGroup::from_members(&members).unwrap());
        locator
    }

    #[test]
    fn test_select_by_intent() {
        let locator = locator(ReadPriority::Slave, &["g0^M^a:1", "g0^S^b:1"]);
        assert_eq!(locator.select(b"k", Intent::Write), Some(NodeId::from_name("a:1")));
        assert_eq!(locator.select(b"k", Intent::Read), Some(NodeId::from_name("b:1")));
        assert_eq!(
            locator.members_for(b"k"),
            vec![NodeId::from_name("a:1"), NodeId::from_name("b:1")]
        );
    }

    #[test]
    fn test_keys_stay_in_group_across_switchover() {
        let locator = locator(
            ReadPriority::Master,
            &["g0^M^a:1", "g0^S^b:1", "g1^M^c:1", "g1^S^d:1"],
        );
        let before: Vec<String> = (0..100)
            .map(|i| locator.group_for(format!("k{}", i).as_bytes()).unwrap().name)
            .collect();

        let (old, new) = locator.switchover("g0").unwrap();
        assert_eq!(old.addr, "a:1");
        assert_eq!(new.addr, "b:1");

        let after: Vec<String> = (0..100)
            .map(|i| locator.group_for(format!("k{}", i).as_bytes()).unwrap().name)
            .collect();
        assert_eq!(before, after);
        assert_eq!(locator.group("g0").unwrap().master.unwrap().addr, "b:1");
    }

    #[test]
    fn test_empty_locator() {
        let locator = locator(ReadPriority::Master, &[]);
        assert_eq!(locator.select(b"k", Intent::Write), None);
        assert!(locator.members_for(b"k").is_empty());
        assert!(locator.switchover("g0").is_none());
    }

    #[test]
    fn test_concurrent_switchovers_all_apply() {
        let members: Vec<String> = (0..8)
            .flat_map(|g| [format!("g{}^M^m{}:1", g, g), format!("g{}^S^s{}:1", g, g)])
            .collect();
        let members: Vec<&str> = members.iter().map(String::as_str).collect();
        let locator = Arc::new(locator(ReadPriority::Master, &members));

        let handles: Vec<_> = (0..8)
            .map(|g| {
                let locator = Arc::clone(&locator);
                std::thread::spawn(move || locator.switchover(&format!("g{}", g)).is_some())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        for g in 0..8 {
            let master = locator.group(&format!("g{}", g)).unwrap().master.unwrap();
            assert_eq!(master.addr, format!("s{}:1", g));
        }
    }
}
