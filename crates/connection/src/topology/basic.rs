//! Plain consistent hashing over server addresses.

use std::collections::BTreeMap;
use std::fmt;

use corelib::{HashRing, KetamaLocator, Node, NodeId, NodeLocator};
use parking_lot::RwLock;
use replication::Intent;

use super::{plan_plain, NodeSpec, TopologyPlan, TopologyStrategy};
use crate::error::Result;

pub struct BasicStrategy {
    locator: KetamaLocator,
    installed: RwLock<BTreeMap<NodeId, NodeSpec>>,
}

impl BasicStrategy {
    /// `ring` supplies the hash and vnode count; it should be empty.
    pub fn new(ring: HashRing) -> Self {
        Self {
            locator: KetamaLocator::new(ring),
            installed: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn locator(&self) -> &KetamaLocator {
        &self.locator
    }
}

impl TopologyStrategy for BasicStrategy {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn primary(&self, key: &[u8], _intent: Intent) -> Option<NodeId> {
        self.locator.primary(key)
    }

    fn sequence(&self, key: &[u8], _intent: Intent) -> Vec<NodeId> {
        self.locator.sequence(key)
    }

    fn plan(&self, next: &[NodeSpec]) -> Result<TopologyPlan> {
        plan_plain(&self.installed.read(), next)
    }

    fn install(&self, plan: &TopologyPlan) -> Result<()> {
        let added: Vec<Node> = plan.added.iter().map(NodeSpec::node).collect();
        let mut installed = self.installed.write();
        self.locator.update(&added, &plan.removed);
        *installed = plan.next.iter().map(|s| (s.id(), s.clone())).collect();
        Ok(())
    }

    fn servers(&self) -> Vec<NodeSpec> {
        self.installed.read().values().cloned().collect()
    }
}

impl fmt::Debug for BasicStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicStrategy")
            .field("servers", &self.installed.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(strategy: &BasicStrategy, list: &str) -> TopologyPlan {
        let plan = strategy.plan(&NodeSpec::parse_list(list).unwrap()).unwrap();
        strategy.install(&plan).unwrap();
        plan
    }

    #[test]
    fn test_same_list_twice_is_noop() {
        let strategy = BasicStrategy::new(HashRing::new());
        let first = installed(&strategy, "a:1 b:1 c:1");
        assert_eq!(first.added.len(), 3);

        let second = installed(&strategy, "c:1 a:1 b:1");
        assert!(second.is_noop());
        assert_eq!(strategy.servers().len(), 3);
    }

    #[test]
    fn test_routing_follows_install() {
        let strategy = BasicStrategy::new(HashRing::new());
        assert_eq!(strategy.primary(b"k", Intent::Read), None);

        installed(&strategy, "a:1 b:1");
        let seq = strategy.sequence(b"k", Intent::Read);
        assert_eq!(seq.len(), 2);
        assert_eq!(Some(seq[0]), strategy.primary(b"k", Intent::Write));

        let plan = installed(&strategy, "a:1");
        assert_eq!(plan.removed, vec![NodeId::from_name("b:1")]);
        assert_eq!(strategy.primary(b"k", Intent::Read), Some(NodeId::from_name("a:1")));
    }

    #[test]
    fn test_rejects_replica_members() {
        let strategy = BasicStrategy::new(HashRing::new());
        assert!(strategy.plan(&NodeSpec::parse_list("g0^M^a:1").unwrap()).is_err());
    }
}
