//! Hash ring data structure.
//!
//! A `HashRing` is an immutable snapshot: token positions sorted in a
//! `BTreeMap<RingToken, NodeId>` plus the node metadata they point at.
//! Membership changes go through [`HashRing::with_changes`], which returns a
//! new ring; a locator publishes it by swapping a single `Arc`, so concurrent
//! readers never see a half-updated ring.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::{Excluded, Unbounded};

use crate::node::{Node, NodeId};
use crate::partitioner::{HashAlgorithm, SharedPartitioner};
use crate::ring::sequence::Sequence;
use crate::token::RingToken;
use crate::vnode::VirtualNode;

/// Ring positions per node unless configured otherwise.
pub const DEFAULT_VNODES: usize = 160;

/// Consistent hash ring.
///
/// # Invariants
///
/// - Token positions are a pure function of (node set, vnode counts,
///   partitioner). They are recomputed from scratch on every change, so a
///   ring reached through any sequence of adds/removes equals the ring built
///   directly from the final node set.
/// - On a token collision the node with the smaller id keeps the position.
#[derive(Clone)]
pub struct HashRing {
    tokens: BTreeMap<RingToken, NodeId>,
    nodes: BTreeMap<NodeId, Node>,
    vnodes: BTreeMap<NodeId, usize>,
    partitioner: SharedPartitioner,
    default_vnodes: usize,
}

impl HashRing {
    /// Create an empty ring using SipHash-1-3 and [`DEFAULT_VNODES`].
    pub fn new() -> Self {
        Self::with_partitioner(HashAlgorithm::default().partitioner(), DEFAULT_VNODES)
    }

    /// Create an empty ring with an explicit partitioner and vnode count.
    pub fn with_partitioner(partitioner: SharedPartitioner, default_vnodes: usize) -> Self {
        Self {
            tokens: BTreeMap::new(),
            nodes: BTreeMap::new(),
            vnodes: BTreeMap::new(),
            partitioner,
            default_vnodes: default_vnodes.max(1),
        }
    }

    /// Hash a key to its ring token.
    #[inline]
    pub fn hash(&self, key: &[u8]) -> RingToken {
        self.partitioner.partition(key)
    }

    /// Find the node responsible for a key.
    ///
    /// # Algorithm
    ///
    /// 1. Hash the key to a token
    /// 2. Take the first position `>=` the token
    /// 3. Wrap to the smallest position if none is found
    ///
    /// # Performance
    /// - **Time**: O(log n) where n = total vnodes
    ///
    /// Returns `None` only for an empty ring.
    pub fn lookup(&self, key: &[u8]) -> Option<NodeId> {
        self.owner_of(self.hash(key)).map(|(_, id)| id)
    }

    /// Same as [`lookup`](Self::lookup) but returns the node metadata.
    pub fn lookup_node(&self, key: &[u8]) -> Option<&Node> {
        self.lookup(key).and_then(|id| self.nodes.get(&id))
    }

    /// Position and owner responsible for `token`.
    pub fn owner_of(&self, token: RingToken) -> Option<(RingToken, NodeId)> {
        self.tokens
            .range(token..)
            .next()
            .or_else(|| self.tokens.iter().next())
            .map(|(position, id)| (*position, *id))
    }

    /// The position counter-clockwise of `position` (wrapping).
    ///
    /// The range owned by `position` is `(predecessor, position]`.
    pub fn predecessor(&self, position: RingToken) -> Option<RingToken> {
        self.tokens
            .range(..position)
            .next_back()
            .or_else(|| self.tokens.iter().next_back())
            .map(|(token, _)| *token)
    }

    /// Distinct nodes in ring order starting with the key's primary.
    pub fn sequence(&self, key: &[u8]) -> Sequence<'_> {
        self.sequence_from(self.hash(key))
    }

    /// Distinct nodes in ring order starting with the owner of `token`.
    pub fn sequence_from(&self, token: RingToken) -> Sequence<'_> {
        let walk = self
            .tokens
            .range(token..)
            .chain(self.tokens.range((Unbounded, Excluded(token))));
        Sequence::new(walk, self.nodes.len())
    }

    /// Build the ring that results from adding `to_add` and removing
    /// `to_remove`.
    ///
    /// Adding a node that is already present replaces its metadata; removing
    /// an unknown id is a no-op.
    ///
    /// # Performance
    /// - **Time**: O(N * v * log(N * v)); the ring is rebuilt from its node set
    pub fn with_changes(&self, to_add: &[Node], to_remove: &[NodeId]) -> HashRing {
        let mut next = self.clone();
        for id in to_remove {
            next.nodes.remove(id);
            next.vnodes.remove(id);
        }
        for node in to_add {
            next.vnodes.insert(node.id, next.default_vnodes);
            next.nodes.insert(node.id, node.clone());
        }
        next.rebuild();
        next
    }

    fn rebuild(&mut self) {
        self.tokens.clear();
        // BTreeMap iteration is ordered by id, so on collision the first
        // (smaller) id is the one kept.
        for (id, node) in &self.nodes {
            let count = self.vnodes.get(id).copied().unwrap_or(self.default_vnodes);
            for index in 0..count {
                let vnode = VirtualNode::from_index(node, index, self.partitioner.as_ref());
                if let Entry::Vacant(slot) = self.tokens.entry(vnode.token) {
                    slot.insert(vnode.node_id);
                }
            }
        }
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// All nodes, ordered by id.
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All `(token, node)` pairs in ring order (for debugging and tests).
    pub fn tokens(&self) -> Vec<(RingToken, NodeId)> {
        self.tokens.iter().map(|(t, id)| (*t, *id)).collect()
    }

    pub fn partitioner_name(&self) -> &'static str {
        self.partitioner.name()
    }

    pub fn vnodes_per_node(&self) -> usize {
        self.default_vnodes
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HashRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashRing")
            .field("nodes", &self.nodes.values().map(|n| &n.name).collect::<Vec<_>>())
            .field("tokens", &self.tokens.len())
            .field("partitioner", &self.partitioner.name())
            .finish()
    }
}

/// Builder for a ring with a known initial membership.
///
/// # Example
///
/// ```rust
/// use corelib::{HashAlgorithm, Node, RingBuilder};
///
/// let ring = RingBuilder::new()
///     .with_hash(HashAlgorithm::Xxh3)
///     .with_vnodes(40)
///     .add_node(Node::new("10.0.0.1:11211"))
///     .add_node(Node::new("10.0.0.2:11211"))
///     .build();
/// assert_eq!(ring.token_count(), 80);
/// ```
#[derive(Debug)]
pub struct RingBuilder {
    hash: HashAlgorithm,
    vnodes: usize,
    nodes: Vec<(Node, Option<usize>)>,
}

impl RingBuilder {
    pub fn new() -> Self {
        Self {
            hash: HashAlgorithm::default(),
            vnodes: DEFAULT_VNODES,
            nodes: Vec::new(),
        }
    }

    pub fn with_hash(mut self, hash: HashAlgorithm) -> Self {
        self.hash = hash;
        self
    }

    /// Default number of positions for nodes added without an explicit count.
    pub fn with_vnodes(mut self, vnodes: usize) -> Self {
        self.vnodes = vnodes;
        self
    }

    pub fn add_node(mut self, node: Node) -> Self {
        self.nodes.push((node, None));
        self
    }

    pub fn add_node_with_vnodes(mut self, node: Node, vnodes: usize) -> Self {
        self.nodes.push((node, Some(vnodes)));
        self
    }

    pub fn build(self) -> HashRing {
        let mut ring = HashRing::with_partitioner(self.hash.partitioner(), self.vnodes);
        for (node, vnodes) in self.nodes {
            ring.vnodes
                .insert(node.id, vnodes.unwrap_or(ring.default_vnodes).max(1));
            ring.nodes.insert(node.id, node);
        }
        ring.rebuild();
        ring
    }
}

impl Default for RingBuilder {
    fn default() -> Self {
        Self::new()
    }
}
