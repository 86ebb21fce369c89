//! Node abstractions for the consistent hash ring.
//!
//! Nodes represent logical participants in the ring: a single server in a
//! plain deployment, or a whole replica group in a replicated one. They are
//! identified by a compact `NodeId` derived from the node's name, so every
//! process that observes the same membership agrees on identities.

use std::fmt;

use xxhash_rust::xxh3::xxh3_128;

/// Compact identifier for a node in the cluster.
///
/// Newtype over `u128` so comparisons and hashing are very fast while giving
/// plenty of space for uniqueness.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub u128);

impl NodeId {
    /// Derive the identifier from a node name (an address or group name).
    ///
    /// The derivation is a pure function of the name, so the same server is
    /// given the same id by every client process.
    pub fn from_name(name: &str) -> Self {
        NodeId(xxh3_128(name.as_bytes()))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Logical node participating in the ring.
///
/// Keep this struct small and cheap to clone; heavy mutable state (sockets,
/// queues, counters) lives in the connection engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    pub id: NodeId,
    /// Ring identity: `host:port` for a server, the group name for a replica
    /// group. Virtual node positions are derived from it.
    pub name: String,
}

impl Node {
    /// Construct a node whose id is derived from `name`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: NodeId::from_name(&name),
            name,
        }
    }

    /// Construct a node with an explicit id.
    pub fn with_id(id: NodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_derived_from_name() {
        let a = Node::new("10.0.0.1:11211");
        let b = Node::new("10.0.0.1:11211");
        let c = Node::new("10.0.0.2:11211");

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.id, NodeId::from_name("10.0.0.1:11211"));
    }

    #[test]
    fn test_display_uses_name() {
        assert_eq!(Node::new("cache-1:11211").to_string(), "cache-1:11211");
        assert_eq!(NodeId(1).to_string().len(), 32);
    }
}
