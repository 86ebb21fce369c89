//! Virtual node abstractions.
//!
//! # Virtual Nodes (VNodes) Concept
//!
//! Instead of each physical node having a single token on the ring, each node
//! has multiple tokens (virtual nodes). This gives:
//!
//! 1. **Better Load Distribution**: More tokens = smoother distribution of keys
//! 2. **Gradual Rebalancing**: When nodes join/leave, only a fraction of keys move
//! 3. **Fault Tolerance**: Failure of one node spreads its keys over many successors
//!
//! # Performance Characteristics
//!
//! - **Memory**: O(v) where v = number of vnodes per node
//! - **Lookup**: O(log n) where n = total vnodes (not affected by vnode count per node)
//! - **Rebalancing**: O(k/v) keys move when a node joins/leaves (k = total keys, v = vnodes/node)
//!
//! The client default of 160 positions per node follows the ketama convention
//! used by memcached clients.

use crate::node::{Node, NodeId};
use crate::partitioner::Partitioner;
use crate::token::{RingToken, Token};

/// A virtual node on the hash ring.
///
/// Represents a single token position owned by a physical node (or replica
/// group).
///
/// # Invariants
///
/// - A virtual node's token is a pure function of its owner's name and index,
///   so every client derives the same positions for the same node.
/// - Every `VirtualNode` belongs to exactly one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualNode {
    /// Token position on the ring.
    pub token: RingToken,

    /// The node that owns this virtual node.
    pub node_id: NodeId,
}

impl VirtualNode {
    /// Create a new virtual node.
    #[inline]
    pub fn new(token: RingToken, node_id: NodeId) -> Self {
        Self { token, node_id }
    }

    /// Create a virtual node from a node and vnode index.
    ///
    /// # Algorithm
    ///
    /// 1. Format the label `"<name>-<index>"`
    /// 2. Hash the label with the ring's partitioner
    /// 3. Create VirtualNode with that token and the node's id
    ///
    /// # Performance
    /// - **Time**: O(k) where k = length of the formatted label
    /// - **Space**: O(k) temporary for the label
    pub fn from_index<P>(node: &Node, vnode_index: usize, partitioner: &P) -> Self
    where
        P: Partitioner<TokenType = RingToken> + ?Sized,
    {
        let label = format!("{}-{}", node.name, vnode_index);
        Self::new(partitioner.partition(label.as_bytes()), node.id)
    }

    #[inline]
    pub fn token(&self) -> RingToken {
        self.token
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Clockwise distance to another virtual node.
    #[inline]
    pub fn distance_to(&self, other: &Self) -> RingToken {
        self.token.distance_to(&other.token)
    }
}

impl std::fmt::Display for VirtualNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VNode(token={:016x}, node={})", self.token.0, self.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioner::Sip13Partitioner;

    #[test]
    fn test_vnode_creation() {
        let vnode = VirtualNode::new(RingToken(100), NodeId(1));
        assert_eq!(vnode.token(), RingToken(100));
        assert_eq!(vnode.node_id(), NodeId(1));
    }

    #[test]
    fn test_vnode_from_index() {
        let node = Node::new("10.0.0.1:11211");
        let vnode0 = VirtualNode::from_index(&node, 0, &Sip13Partitioner);
        let vnode1 = VirtualNode::from_index(&node, 1, &Sip13Partitioner);

        // Should have different tokens
        assert_ne!(vnode0.token(), vnode1.token());

        // But same node_id
        assert_eq!(vnode0.node_id(), vnode1.node_id());

        // And be reproducible
        assert_eq!(vnode0, VirtualNode::from_index(&node, 0, &Sip13Partitioner));
    }

    #[test]
    fn test_vnode_distance() {
        let vnode1 = VirtualNode::new(RingToken(100), NodeId(1));
        let vnode2 = VirtualNode::new(RingToken(200), NodeId(2));

        assert_eq!(vnode1.distance_to(&vnode2), RingToken(100));
        assert!(vnode1 < vnode2); // Ordered by token
    }
}
