//! Tests for the hash ring and the ketama locator.
//!
//! # Test Strategy
//!
//! 1. **Basic functionality**: Empty ring, add/lookup, remove
//! 2. **Multiple nodes**: Distribution, consistency
//! 3. **Edge cases**: Wraparound, single node, re-adding
//! 4. **Properties**: Determinism and stability under membership churn

use corelib::node::{Node, NodeId};
use corelib::ring::{HashRing, RingBuilder};
use corelib::{HashAlgorithm, KetamaLocator, NodeLocator};
use proptest::prelude::*;

fn ring_with(names: &[&str], vnodes: usize) -> HashRing {
    let mut builder = RingBuilder::new().with_vnodes(vnodes);
    for name in names {
        builder = builder.add_node(Node::new(*name));
    }
    builder.build()
}

// ============================================================================
// Basic Functionality Tests
// ============================================================================

#[test]
fn test_empty_ring_lookup() {
    let ring = HashRing::new();
    assert_eq!(ring.lookup(b"key1"), None);
    assert_eq!(ring.lookup_node(b"key1"), None);
    assert_eq!(ring.sequence(b"key1").next(), None);
    assert_eq!(ring.node_count(), 0);
    assert_eq!(ring.token_count(), 0);
}

#[test]
fn test_add_node_and_lookup() {
    let node = Node::new("10.0.0.1:11211");
    let ring = HashRing::with_partitioner(HashAlgorithm::Sip13.partitioner(), 4)
        .with_changes(&[node.clone()], &[]);

    assert_eq!(ring.node_count(), 1);
    assert_eq!(ring.token_count(), 4);

    assert_eq!(ring.lookup(b"test-key"), Some(node.id));
    assert_eq!(ring.lookup_node(b"test-key").unwrap().name, "10.0.0.1:11211");
    assert!(ring.get_node(&node.id).is_some());
}

#[test]
fn test_remove_node() {
    let ring = ring_with(&["node1:1", "node2:1"], 4);
    assert_eq!(ring.token_count(), 8);

    let ring = ring.with_changes(&[], &[NodeId::from_name("node1:1")]);

    assert_eq!(ring.node_count(), 1);
    assert_eq!(ring.token_count(), 4); // Only node2's vnodes remain
    assert_eq!(ring.lookup(b"some-key"), Some(NodeId::from_name("node2:1")));

    // Removing a node that is not there changes nothing
    let same = ring.with_changes(&[], &[NodeId(999)]);
    assert_eq!(same.tokens(), ring.tokens());
}

// ============================================================================
// Multiple Nodes Tests
// ============================================================================

#[test]
fn test_keys_spread_over_all_nodes() {
    let names = ["a:11211", "b:11211", "c:11211"];
    let ring = ring_with(&names, 160);

    let mut hits = std::collections::HashMap::new();
    for i in 0..3_000 {
        let key = format!("key-{}", i);
        *hits.entry(ring.lookup(key.as_bytes()).unwrap()).or_insert(0usize) += 1;
    }

    assert_eq!(hits.len(), 3, "every node should own some keys");
    for count in hits.values() {
        assert!(*count > 500, "distribution too skewed: {:?}", hits);
    }
}

#[test]
fn test_ring_builder_mixed_vnodes() {
    let ring = RingBuilder::new()
        .with_vnodes(4)
        .add_node(Node::new("node1:1"))
        .add_node_with_vnodes(Node::new("node2:1"), 8)
        .build();

    assert_eq!(ring.node_count(), 2);
    assert_eq!(ring.token_count(), 12); // 4 + 8
}

#[test]
fn test_partitioner_name() {
    assert_eq!(HashRing::new().partitioner_name(), "Sip13Partitioner");
    let ring = RingBuilder::new().with_hash(HashAlgorithm::Xxh3).build();
    assert_eq!(ring.partitioner_name(), "Xxh3Partitioner");
}

// ============================================================================
// Edge Cases
// ============================================================================

#[test]
fn test_single_node() {
    let ring = ring_with(&["only:1"], 4);
    for key in [&b"key1"[..], b"key2", b"key3", b"very-long-key-name"] {
        assert_eq!(ring.lookup(key), Some(NodeId::from_name("only:1")));
    }
}

#[test]
fn test_add_remove_add_restores_mapping() {
    let full = ring_with(&["a:1", "b:1", "c:1"], 40);
    let b = Node::new("b:1");

    let without_b = full.with_changes(&[], &[b.id]);
    let readded = without_b.with_changes(&[b], &[]);

    assert_eq!(full.tokens(), readded.tokens());
}

#[test]
fn test_locator_update_is_copy_on_write() {
    let locator = KetamaLocator::new(ring_with(&["a:1", "b:1"], 16));
    let old = locator.snapshot();

    locator.update(&[Node::new("c:1")], &[NodeId::from_name("a:1")]);

    assert_eq!(old.node_count(), 2);
    assert!(old.contains(&NodeId::from_name("a:1")));
    let names: Vec<String> = locator.nodes().into_iter().map(|n| n.name).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"b:1".to_string()));
    assert!(names.contains(&"c:1".to_string()));
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_primary_is_first_of_sequence(keys in proptest::collection::vec(".{1,24}", 1..40)) {
        let ring = ring_with(&["a:1", "b:1", "c:1", "d:1"], 32);
        for key in &keys {
            let seq: Vec<NodeId> = ring.sequence(key.as_bytes()).collect();
            prop_assert_eq!(seq.len(), 4);
            prop_assert_eq!(Some(seq[0]), ring.lookup(key.as_bytes()));
        }
    }

    #[test]
    fn prop_lookup_ignores_call_order(keys in proptest::collection::vec(".{1,24}", 1..40)) {
        let ring = ring_with(&["a:1", "b:1", "c:1"], 32);
        let forward: Vec<_> = keys.iter().map(|k| ring.lookup(k.as_bytes())).collect();
        let mut backward: Vec<_> = keys.iter().rev().map(|k| ring.lookup(k.as_bytes())).collect();
        backward.reverse();
        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn prop_remove_readd_is_stable(
        victim in 0usize..4,
        churn in proptest::collection::vec("[a-z]{3,8}:[0-9]{2,4}", 0..4),
        key in ".{1,24}",
    ) {
        let names = ["a:1", "b:1", "c:1", "d:1"];
        let ring = ring_with(&names, 32);
        let victim = Node::new(names[victim]);
        let extras: Vec<Node> = churn.iter().map(|n| Node::new(n.as_str())).collect();
        let extra_ids: Vec<NodeId> = extras.iter().map(|n| n.id).collect();

        // remove, add and drop unrelated nodes, then re-add the victim
        let churned = ring
            .with_changes(&[], &[victim.id])
            .with_changes(&extras, &[])
            .with_changes(&[], &extra_ids)
            .with_changes(&[victim], &[]);

        prop_assert_eq!(ring.lookup(key.as_bytes()), churned.lookup(key.as_bytes()));
    }
}
