//! Ring walk used for failover and redistribution.

use std::collections::btree_map::Range;
use std::collections::HashSet;
use std::iter::Chain;

use crate::node::NodeId;
use crate::token::RingToken;

/// Distinct nodes in clockwise ring order, starting with the node that owns
/// the starting token.
///
/// The first item is always the primary for the key the walk was started
/// from; callers looking for fallbacks skip it or filter on liveness.
pub struct Sequence<'a> {
    walk: Chain<Range<'a, RingToken, NodeId>, Range<'a, RingToken, NodeId>>,
    seen: HashSet<NodeId>,
    remaining: usize,
}

impl<'a> Sequence<'a> {
    pub(crate) fn new(
        walk: Chain<Range<'a, RingToken, NodeId>, Range<'a, RingToken, NodeId>>,
        node_count: usize,
    ) -> Self {
        Self {
            walk,
            seen: HashSet::with_capacity(node_count),
            remaining: node_count,
        }
    }
}

impl Iterator for Sequence<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if self.remaining == 0 {
            return None;
        }
        for (_, node_id) in self.walk.by_ref() {
            if self.seen.insert(*node_id) {
                self.remaining -= 1;
                return Some(*node_id);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
