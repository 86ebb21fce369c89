//! Ring topology during live migration.
//!
//! While nodes join or leave with their data being migrated, two rings are
//! tracked: the *base* ring (membership before the migration) and the
//! *alter* ring (membership after it). Keys whose owner differs between the
//! two move in units of *ranges*; a range is the arc `(predecessor, position]`
//! of a position on the ring whose ownership changes (the alter ring for a
//! join, the base ring for a leave). A key is answered from the alter ring
//! once the migration boundary of its range has passed it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::locator::NodeLocator;
use crate::node::{Node, NodeId};
use crate::ring::HashRing;
use crate::token::{RingToken, Token};

/// Direction of a live migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationKind {
    /// Nodes are being added; their ranges are filled from current owners.
    Join,
    /// Nodes are being removed; their ranges are handed to the survivors.
    Leave,
}

/// Base and alter rings plus per-range migration progress.
#[derive(Clone, Debug)]
pub struct MigrationTopology {
    kind: MigrationKind,
    base: Arc<HashRing>,
    alter: Arc<HashRing>,
    movers: Vec<Node>,
    completed: BTreeSet<RingToken>,
    progress: BTreeMap<RingToken, RingToken>,
}

impl MigrationTopology {
    /// Start migrating `joining` into `base`.
    pub fn join(base: Arc<HashRing>, joining: &[Node]) -> Result<Self> {
        if joining.is_empty() {
            return Err(Error::Migration("join without nodes".into()));
        }
        if let Some(node) = joining.iter().find(|n| base.contains(&n.id)) {
            return Err(Error::Migration(format!("{} is already in the ring", node)));
        }
        let alter = Arc::new(base.with_changes(joining, &[]));
        Ok(Self::with_rings(MigrationKind::Join, base, alter, joining.to_vec()))
    }

    /// Start migrating `leaving` out of `base`.
    pub fn leave(base: Arc<HashRing>, leaving: &[NodeId]) -> Result<Self> {
        if leaving.is_empty() {
            return Err(Error::Migration("leave without nodes".into()));
        }
        let mut movers = Vec::with_capacity(leaving.len());
        for id in leaving {
            let node = base
                .get_node(id)
                .ok_or_else(|| Error::Migration(format!("node {} is not in the ring", id)))?;
            movers.push(node.clone());
        }
        let alter = Arc::new(base.with_changes(&[], leaving));
        if alter.is_empty() {
            return Err(Error::Migration("every node would leave the ring".into()));
        }
        Ok(Self::with_rings(MigrationKind::Leave, base, alter, movers))
    }

    fn with_rings(
        kind: MigrationKind,
        base: Arc<HashRing>,
        alter: Arc<HashRing>,
        movers: Vec<Node>,
    ) -> Self {
        Self {
            kind,
            base,
            alter,
            movers,
            completed: BTreeSet::new(),
            progress: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> MigrationKind {
        self.kind
    }

    pub fn base(&self) -> &Arc<HashRing> {
        &self.base
    }

    pub fn alter(&self) -> &Arc<HashRing> {
        &self.alter
    }

    /// Nodes joining or leaving.
    pub fn movers(&self) -> &[Node] {
        &self.movers
    }

    /// The ring whose positions delimit migration ranges.
    fn range_ring(&self) -> &HashRing {
        match self.kind {
            MigrationKind::Join => &self.alter,
            MigrationKind::Leave => &self.base,
        }
    }

    /// Position of the migration range containing `token`.
    pub fn range_of(&self, token: RingToken) -> Option<RingToken> {
        self.range_ring().owner_of(token).map(|(position, _)| position)
    }

    /// True once `token` has been migrated to its alter owner.
    pub fn is_migrated(&self, token: RingToken) -> bool {
        let Some(range) = self.range_of(token) else {
            return false;
        };
        if self.completed.contains(&range) {
            return true;
        }
        let (Some(boundary), Some(start)) =
            (self.progress.get(&range), self.range_ring().predecessor(range))
        else {
            return false;
        };
        start != *boundary && token.within(start, *boundary)
    }

    /// Owner of `token`, choosing the alter ring's answer for migrated keys.
    pub fn owner_of_token(&self, token: RingToken) -> Option<NodeId> {
        let base = self.base.owner_of(token).map(|(_, id)| id);
        let alter = self.alter.owner_of(token).map(|(_, id)| id);
        if base == alter || alter.is_none() {
            return base;
        }
        if base.is_none() || self.is_migrated(token) {
            alter
        } else {
            base
        }
    }

    pub fn owner(&self, key: &[u8]) -> Option<NodeId> {
        self.owner_of_token(self.base.hash(key))
    }

    /// Owner first, then the remaining nodes of both rings in base-ring order.
    pub fn sequence(&self, key: &[u8]) -> Vec<NodeId> {
        let token = self.base.hash(key);
        let mut seq: Vec<NodeId> = self.owner_of_token(token).into_iter().collect();
        for id in self
            .base
            .sequence_from(token)
            .chain(self.alter.sequence_from(token))
        {
            if !seq.contains(&id) {
                seq.push(id);
            }
        }
        seq
    }

    /// Record that keys of `range` are migrated up to and including
    /// `boundary`. A boundary equal to the range position completes it.
    ///
    /// Progress never moves backwards.
    pub fn with_progress(&self, range: RingToken, boundary: RingToken) -> Self {
        let mut next = self.clone();
        if boundary == range {
            next.progress.remove(&range);
            next.completed.insert(range);
            return next;
        }
        let Some(start) = self.range_ring().predecessor(range) else {
            return next;
        };
        if !boundary.within(start, range) {
            return next;
        }
        let further = match self.progress.get(&range) {
            Some(current) => start.distance_to(&boundary) > start.distance_to(current),
            None => true,
        };
        if further {
            next.progress.insert(range, boundary);
        }
        next
    }

    /// A server reported that `key` now belongs to its alter owner: advance
    /// the key's range at least up to the key.
    pub fn with_redirect(&self, key: &[u8]) -> Self {
        let token = self.base.hash(key);
        match self.range_of(token) {
            Some(range) if !self.is_migrated(token) => self.with_progress(range, token),
            _ => self.clone(),
        }
    }

    /// Rebuild against a new base ring, keeping movers and progress.
    pub fn rebase(&self, base: Arc<HashRing>) -> Self {
        let alter = match self.kind {
            MigrationKind::Join => base.with_changes(&self.movers, &[]),
            MigrationKind::Leave => {
                let ids: Vec<NodeId> = self.movers.iter().map(|n| n.id).collect();
                base.with_changes(&[], &ids)
            }
        };
        Self {
            base,
            alter: Arc::new(alter),
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug)]
struct LocatorState {
    base: Arc<HashRing>,
    migration: Option<Arc<MigrationTopology>>,
}

/// Locator that answers from the base ring, switching individual keys to the
/// alter ring as their migration boundary is crossed.
pub struct MigrationLocator {
    state: RwLock<Arc<LocatorState>>,
}

impl MigrationLocator {
    pub fn new(base: HashRing) -> Self {
        Self {
            state: RwLock::new(Arc::new(LocatorState {
                base: Arc::new(base),
                migration: None,
            })),
        }
    }

    fn snapshot(&self) -> Arc<LocatorState> {
        Arc::clone(&self.state.read())
    }

    pub fn base(&self) -> Arc<HashRing> {
        Arc::clone(&self.snapshot().base)
    }

    pub fn migration(&self) -> Option<Arc<MigrationTopology>> {
        self.snapshot().migration.clone()
    }

    /// Start a migration. Only one may be in progress.
    pub fn begin(&self, kind: MigrationKind, nodes: &[Node]) -> Result<Arc<MigrationTopology>> {
        let mut state = self.state.write();
        if state.migration.is_some() {
            return Err(Error::Migration("a migration is already in progress".into()));
        }
        let topology = match kind {
            MigrationKind::Join => MigrationTopology::join(Arc::clone(&state.base), nodes)?,
            MigrationKind::Leave => {
                let ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
                MigrationTopology::leave(Arc::clone(&state.base), &ids)?
            }
        };
        let topology = Arc::new(topology);
        *state = Arc::new(LocatorState {
            base: Arc::clone(&state.base),
            migration: Some(Arc::clone(&topology)),
        });
        Ok(topology)
    }

    /// Advance a range. Returns `false` when no migration is running.
    pub fn progress(&self, range: RingToken, boundary: RingToken) -> bool {
        self.advance(|m| m.with_progress(range, boundary))
    }

    /// Apply a redirect for `key`. Returns `false` when no migration is running.
    pub fn redirect(&self, key: &[u8]) -> bool {
        self.advance(|m| m.with_redirect(key))
    }

    fn advance(&self, step: impl FnOnce(&MigrationTopology) -> MigrationTopology) -> bool {
        let mut state = self.state.write();
        let Some(migration) = &state.migration else {
            return false;
        };
        let next = step(migration);
        *state = Arc::new(LocatorState {
            base: Arc::clone(&state.base),
            migration: Some(Arc::new(next)),
        });
        true
    }

    /// Finish the migration: the alter ring becomes the base ring.
    pub fn finish(&self) -> Option<Arc<MigrationTopology>> {
        let mut state = self.state.write();
        let migration = state.migration.clone()?;
        *state = Arc::new(LocatorState {
            base: Arc::clone(migration.alter()),
            migration: None,
        });
        Some(migration)
    }
}

impl NodeLocator for MigrationLocator {
    fn primary(&self, key: &[u8]) -> Option<NodeId> {
        let state = self.snapshot();
        match &state.migration {
            Some(migration) => migration.owner(key),
            None => state.base.lookup(key),
        }
    }

    fn sequence(&self, key: &[u8]) -> Vec<NodeId> {
        let state = self.snapshot();
        match &state.migration {
            Some(migration) => migration.sequence(key),
            None => state.base.sequence(key).collect(),
        }
    }

    fn update(&self, to_add: &[Node], to_remove: &[NodeId]) {
        let mut state = self.state.write();
        let base = Arc::new(state.base.with_changes(to_add, to_remove));
        let migration = state
            .migration
            .as_ref()
            .map(|m| Arc::new(m.rebase(Arc::clone(&base))));
        *state = Arc::new(LocatorState { base, migration });
    }

    fn nodes(&self) -> Vec<Node> {
        let state = self.snapshot();
        let mut nodes = state.base.nodes();
        if let Some(migration) = &state.migration {
            for node in migration.alter().nodes() {
                if !nodes.contains(&node) {
                    nodes.push(node);
                }
            }
        }
        nodes
    }
}

impl fmt::Debug for MigrationLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.snapshot();
        f.debug_struct("MigrationLocator")
            .field("base", &*state.base)
            .field("migrating", &state.migration.as_ref().map(|m| m.kind()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingBuilder;

    fn base() -> Arc<HashRing> {
        Arc::new(
            RingBuilder::new()
                .with_vnodes(16)
                .add_node(Node::new("a:1"))
                .add_node(Node::new("b:1"))
                .build(),
        )
    }

    /// A key whose owner changes when `c:1` joins.
    fn moving_key(topology: &MigrationTopology) -> String {
        (0..10_000)
            .map(|i| format!("key-{}", i))
            .find(|k| {
                let t = topology.base().hash(k.as_bytes());
                topology.base().owner_of(t).map(|p| p.1) != topology.alter().owner_of(t).map(|p| p.1)
            })
            .expect("some key must move")
    }

    #[test]
    fn test_join_answers_base_until_migrated() {
        let c = Node::new("c:1");
        let topology = MigrationTopology::join(base(), &[c.clone()]).unwrap();
        let key = moving_key(&topology);

        assert_eq!(topology.owner(key.as_bytes()), topology.base().lookup(key.as_bytes()));

        let token = topology.base().hash(key.as_bytes());
        let range = topology.range_of(token).unwrap();
        let done = topology.with_progress(range, range);
        assert_eq!(done.owner(key.as_bytes()), Some(c.id));
    }

    #[test]
    fn test_partial_progress_moves_only_passed_keys() {
        let topology = MigrationTopology::join(base(), &[Node::new("c:1")]).unwrap();
        let key = moving_key(&topology);
        let token = topology.base().hash(key.as_bytes());
        let range = topology.range_of(token).unwrap();
        let start = topology.alter().predecessor(range).unwrap();

        // Boundary right before the key: not yet migrated.
        if token.0.wrapping_sub(1) != start.0 {
            let before = topology.with_progress(range, RingToken(token.0.wrapping_sub(1)));
            assert!(!before.is_migrated(token));
        }
        let at = topology.with_progress(range, token);
        assert!(at.is_migrated(token));

        // Progress does not move backwards.
        let back = at.with_progress(range, RingToken(start.0.wrapping_add(1)));
        assert!(back.is_migrated(token));
    }

    #[test]
    fn test_redirect_marks_key_migrated() {
        let c = Node::new("c:1");
        let topology = MigrationTopology::join(base(), &[c.clone()]).unwrap();
        let key = moving_key(&topology);

        let redirected = topology.with_redirect(key.as_bytes());
        assert_eq!(redirected.owner(key.as_bytes()), Some(c.id));
    }

    #[test]
    fn test_leave_rejects_unknown_and_total_departure() {
        let ring = base();
        assert!(MigrationTopology::leave(Arc::clone(&ring), &[NodeId(7)]).is_err());
        assert!(MigrationTopology::leave(Arc::clone(&ring), &ring.node_ids()).is_err());
        assert!(MigrationTopology::join(Arc::clone(&ring), &[Node::new("a:1")]).is_err());
    }

    #[test]
    fn test_locator_finish_promotes_alter_ring() {
        let locator = MigrationLocator::new((*base()).clone());
        let c = Node::new("c:1");
        locator.begin(MigrationKind::Join, &[c.clone()]).unwrap();
        assert!(locator.begin(MigrationKind::Join, &[Node::new("d:1")]).is_err());
        assert_eq!(locator.nodes().len(), 3);

        let finished = locator.finish().unwrap();
        assert_eq!(finished.kind(), MigrationKind::Join);
        assert!(locator.base().contains(&c.id));
        assert!(locator.migration().is_none());
        assert!(!locator.redirect(b"anything"));
    }

    #[test]
    fn test_concurrent_progress_keeps_every_range() {
        for _ in 0..20 {
            let locator = Arc::new(MigrationLocator::new((*base()).clone()));
            let topology = locator.begin(MigrationKind::Join, &[Node::new("c:1")]).unwrap();
            let ranges: Vec<RingToken> =
                topology.alter().tokens().into_iter().map(|(t, _)| t).collect();

            let handles: Vec<_> = ranges
                .chunks(ranges.len().div_ceil(8))
                .map(|chunk| {
                    let locator = Arc::clone(&locator);
                    let chunk = chunk.to_vec();
                    std::thread::spawn(move || {
                        for range in chunk {
                            assert!(locator.progress(range, range));
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let migration = locator.migration().unwrap();
            let lost = ranges.iter().filter(|r| !migration.is_migrated(**r)).count();
            assert_eq!(lost, 0);
        }
    }

    #[test]
    fn test_update_during_migration_keeps_progress() {
        let locator = MigrationLocator::new((*base()).clone());
        let topology = locator.begin(MigrationKind::Join, &[Node::new("c:1")]).unwrap();
        let range = topology.alter().tokens()[0].0;
        assert!(locator.progress(range, range));

        locator.update(&[Node::new("d:1")], &[]);
        let migration = locator.migration().unwrap();
        assert!(migration.base().contains(&Node::new("d:1").id));
        assert!(migration.is_migrated(range));
    }
}
