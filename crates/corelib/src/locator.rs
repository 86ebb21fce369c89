//! Node locators: key to node resolution over a published ring snapshot.
//!
//! A locator owns the current ring behind a lock that is only held long
//! enough to clone or swap an `Arc`. Readers work on the snapshot they
//! cloned, so a concurrent update is never observed half-applied.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::node::{Node, NodeId};
use crate::ring::HashRing;

/// Maps keys to nodes.
///
/// Implementations must make `primary` a pure function of the installed
/// topology and the key.
pub trait NodeLocator: Send + Sync + fmt::Debug {
    /// The node the key currently hashes to, or `None` for an empty ring.
    fn primary(&self, key: &[u8]) -> Option<NodeId>;

    /// Distinct nodes in failover order; the first element is the primary.
    fn sequence(&self, key: &[u8]) -> Vec<NodeId>;

    /// Atomically install a ring with `to_add` inserted and `to_remove`
    /// deleted.
    fn update(&self, to_add: &[Node], to_remove: &[NodeId]);

    /// Every node the locator can currently route to.
    fn nodes(&self) -> Vec<Node>;
}

/// Plain consistent-hash locator over a single ring.
pub struct KetamaLocator {
    ring: RwLock<Arc<HashRing>>,
}

impl KetamaLocator {
    pub fn new(ring: HashRing) -> Self {
        Self {
            ring: RwLock::new(Arc::new(ring)),
        }
    }

    /// The ring currently installed.
    pub fn snapshot(&self) -> Arc<HashRing> {
        Arc::clone(&self.ring.read())
    }
}

impl NodeLocator for KetamaLocator {
    fn primary(&self, key: &[u8]) -> Option<NodeId> {
        self.snapshot().lookup(key)
    }

    fn sequence(&self, key: &[u8]) -> Vec<NodeId> {
        self.snapshot().sequence(key).collect()
    }

    fn update(&self, to_add: &[Node], to_remove: &[NodeId]) {
        let mut ring = self.ring.write();
        let next = ring.with_changes(to_add, to_remove);
        *ring = Arc::new(next);
    }

    fn nodes(&self) -> Vec<Node> {
        self.snapshot().nodes()
    }
}

impl fmt::Debug for KetamaLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KetamaLocator")
            .field("ring", &*self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_locator_has_no_primary() {
        let locator = KetamaLocator::new(HashRing::new());
        assert_eq!(locator.primary(b"k"), None);
        assert!(locator.sequence(b"k").is_empty());
    }

    #[test]
    fn test_snapshot_survives_update() {
        let locator = KetamaLocator::new(HashRing::new());
        locator.update(&[Node::new("a:1"), Node::new("b:1")], &[]);

        let before = locator.snapshot();
        locator.update(&[], &[NodeId::from_name("a:1")]);

        // The old snapshot is still whole; the new one has a single node.
        assert_eq!(before.node_count(), 2);
        assert_eq!(locator.nodes().len(), 1);
        assert_eq!(locator.primary(b"k"), Some(NodeId::from_name("b:1")));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let locator = Arc::new(KetamaLocator::new(HashRing::new()));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let locator = Arc::clone(&locator);
                std::thread::spawn(move || {
                    for i in 0..8 {
                        locator.update(&[Node::new(format!("n{}-{}:1", t, i))], &[]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(locator.nodes().len(), 64);
    }
}
