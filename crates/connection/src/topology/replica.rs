//! Replica-group aware routing.
//!
//! Keys hash to groups; the member is picked by the configured read
//! priority. A new server list is compared group by group so that a master
//! change is applied as a move of queued operations rather than as the
//! removal of one server and the addition of another.

use std::fmt;

use corelib::{HashRing, NodeId};
use replication::{
    GroupDiff, Intent, PriorityStrategy, ReadPriority, ReplicaGroup, ReplicaLocator,
    ReplicaMember, ReplicaRole, RoleChangeKind,
};

use super::{NodeSpec, ReplicaTask, TopologyPlan, TopologyStrategy};
use crate::error::{ConnectionError, Result};

pub struct ReplicaStrategy {
    locator: ReplicaLocator,
}

impl ReplicaStrategy {
    /// `ring` supplies the hash and vnode count; it should be empty.
    pub fn new(ring: HashRing, priority: ReadPriority) -> Self {
        Self {
            locator: ReplicaLocator::new(ring, Box::new(PriorityStrategy::new(priority))),
        }
    }

    pub fn locator(&self) -> &ReplicaLocator {
        &self.locator
    }
}

fn members_of(next: &[NodeSpec]) -> Result<Vec<ReplicaMember>> {
    next.iter()
        .map(|spec| {
            spec.replica.clone().ok_or_else(|| {
                ConnectionError::Topology(format!("{} has no replica group", spec.addr))
            })
        })
        .collect()
}

impl TopologyStrategy for ReplicaStrategy {
    fn name(&self) -> &'static str {
        "replica"
    }

    fn primary(&self, key: &[u8], intent: Intent) -> Option<NodeId> {
        self.locator.select(key, intent)
    }

    /// The selected member first, then the rest of the key's group.
    fn sequence(&self, key: &[u8], intent: Intent) -> Vec<NodeId> {
        let mut seq: Vec<NodeId> = self.locator.select(key, intent).into_iter().collect();
        for id in self.locator.members_for(key) {
            if !seq.contains(&id) {
                seq.push(id);
            }
        }
        seq
    }

    fn plan(&self, next: &[NodeSpec]) -> Result<TopologyPlan> {
        let members = members_of(next)?;
        let groups = ReplicaGroup::from_members(&members)?;
        let diff = GroupDiff::between(&self.locator.groups(), &groups);

        let tasks = diff
            .role_changes
            .iter()
            .map(|change| ReplicaTask::MoveOperations {
                group: change.group.clone(),
                from: change.old_master.node_id(),
                to: change.new_master.node_id(),
                cancel_non_idempotent: change.kind == RoleChangeKind::Failover,
            })
            .collect();

        Ok(TopologyPlan {
            next: members.iter().cloned().map(NodeSpec::from).collect(),
            added: diff.added_members.into_iter().map(NodeSpec::from).collect(),
            removed: diff.removed_members.iter().map(ReplicaMember::node_id).collect(),
            tasks,
            roles: members.iter().map(|m| (m.node_id(), m.role)).collect(),
        })
    }

    fn install(&self, plan: &TopologyPlan) -> Result<()> {
        let members = members_of(&plan.next)?;
        self.locator.install(ReplicaGroup::from_members(&members)?);
        Ok(())
    }

    fn servers(&self) -> Vec<NodeSpec> {
        self.locator
            .groups()
            .values()
            .flat_map(|g| g.members().cloned().collect::<Vec<_>>())
            .map(NodeSpec::from)
            .collect()
    }

    fn switchover(&self, group: &str) -> Option<(NodeId, NodeId)> {
        let (old, new) = self.locator.switchover(group)?;
        Some((old.node_id(), new.node_id()))
    }

    fn role_of(&self, node: NodeId) -> Option<(String, ReplicaRole)> {
        self.locator
            .groups()
            .values()
            .flat_map(|g| g.members().cloned().collect::<Vec<_>>())
            .find(|m| m.node_id() == node)
            .map(|m| (m.group, m.role))
    }
}

impl fmt::Debug for ReplicaStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaStrategy")
            .field("locator", &self.locator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(strategy: &ReplicaStrategy, list: &str) -> TopologyPlan {
        let plan = strategy.plan(&NodeSpec::parse_list(list).unwrap()).unwrap();
        strategy.install(&plan).unwrap();
        plan
    }

    #[test]
    fn test_switchover_plans_a_move() {
        let strategy = ReplicaStrategy::new(HashRing::new(), ReadPriority::Master);
        apply(&strategy, "g0^M^a:1 g0^S^b:1");

        let plan = apply(&strategy, "g0^M^b:1 g0^S^a:1");
        assert!(plan.added.is_empty());
        assert!(plan.removed.is_empty());
        assert_eq!(
            plan.tasks,
            vec![ReplicaTask::MoveOperations {
                group: "g0".into(),
                from: NodeId::from_name("a:1"),
                to: NodeId::from_name("b:1"),
                cancel_non_idempotent: false,
            }]
        );
        assert_eq!(plan.roles[&NodeId::from_name("a:1")], ReplicaRole::Slave);
        assert_eq!(strategy.primary(b"k", Intent::Write), Some(NodeId::from_name("b:1")));
    }

    #[test]
    fn test_failover_cancels_non_idempotent() {
        let strategy = ReplicaStrategy::new(HashRing::new(), ReadPriority::Master);
        apply(&strategy, "g0^M^a:1 g0^S^b:1");

        let plan = apply(&strategy, "g0^M^b:1");
        assert_eq!(plan.removed, vec![NodeId::from_name("a:1")]);
        assert!(matches!(
            plan.tasks[0],
            ReplicaTask::MoveOperations { cancel_non_idempotent: true, .. }
        ));
    }

    #[test]
    fn test_sequence_stays_in_group() {
        let strategy = ReplicaStrategy::new(HashRing::new(), ReadPriority::Slave);
        apply(&strategy, "g0^M^a:1 g0^S^b:1 g1^M^c:1");

        for i in 0..50 {
            let key = format!("key-{}", i);
            let seq = strategy.sequence(key.as_bytes(), Intent::Read);
            let group = strategy.locator().group_for(key.as_bytes()).unwrap();
            assert_eq!(seq.len(), group.members().count());
            assert_eq!(Some(seq[0]), strategy.primary(key.as_bytes(), Intent::Read));
        }
    }

    #[test]
    fn test_local_switchover_and_roles() {
        let strategy = ReplicaStrategy::new(HashRing::new(), ReadPriority::Master);
        apply(&strategy, "g0^M^a:1 g0^S^b:1");

        assert_eq!(
            strategy.switchover("g0"),
            Some((NodeId::from_name("a:1"), NodeId::from_name("b:1")))
        );
        assert_eq!(
            strategy.role_of(NodeId::from_name("a:1")),
            Some(("g0".to_string(), ReplicaRole::Slave))
        );
        assert!(strategy.plan(&NodeSpec::parse_list("a:1").unwrap()).is_err());
    }
}
