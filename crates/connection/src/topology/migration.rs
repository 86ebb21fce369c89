//! Plain addresses plus live migration.
//!
//! While a migration runs, keys answer from the base ring until their range
//! has been migrated and from the alter ring afterwards. Joining servers are
//! connected when the migration begins; leaving servers are torn down when it
//! finishes.

use std::collections::BTreeMap;
use std::fmt;

use corelib::{HashRing, MigrationKind, MigrationLocator, Node, NodeId, NodeLocator, RingToken};
use parking_lot::RwLock;
use replication::Intent;
use tracing::info;

use super::{plan_plain, MigrationChange, NodeSpec, TopologyPlan, TopologyStrategy};
use crate::error::Result;

/// Server lists kept next to the ring. Ring changes are made while holding
/// the write lock so both always describe the same topology.
#[derive(Default)]
struct Membership {
    installed: BTreeMap<NodeId, NodeSpec>,
    /// Servers joining through the running migration.
    joining: Vec<NodeSpec>,
}

pub struct MigrationStrategy {
    locator: MigrationLocator,
    membership: RwLock<Membership>,
}

impl MigrationStrategy {
    /// `ring` supplies the hash and vnode count; it should be empty.
    pub fn new(ring: HashRing) -> Self {
        Self {
            locator: MigrationLocator::new(ring),
            membership: RwLock::new(Membership::default()),
        }
    }

    pub fn locator(&self) -> &MigrationLocator {
        &self.locator
    }
}

impl TopologyStrategy for MigrationStrategy {
    fn name(&self) -> &'static str {
        "migration"
    }

    fn primary(&self, key: &[u8], _intent: Intent) -> Option<NodeId> {
        self.locator.primary(key)
    }

    fn sequence(&self, key: &[u8], _intent: Intent) -> Vec<NodeId> {
        self.locator.sequence(key)
    }

    fn plan(&self, next: &[NodeSpec]) -> Result<TopologyPlan> {
        let membership = self.membership.read();
        let mut plan = plan_plain(&membership.installed, next)?;
        // A joining server is already connected and stays so.
        let joining = &membership.joining;
        plan.added.retain(|spec| !joining.contains(spec));
        plan.removed.retain(|id| !joining.iter().any(|s| s.id() == *id));
        Ok(plan)
    }

    fn install(&self, plan: &TopologyPlan) -> Result<()> {
        let added: Vec<Node> = plan.added.iter().map(NodeSpec::node).collect();
        let mut membership = self.membership.write();
        self.locator.update(&added, &plan.removed);
        membership.installed = plan.next.iter().map(|s| (s.id(), s.clone())).collect();
        Ok(())
    }

    fn servers(&self) -> Vec<NodeSpec> {
        let membership = self.membership.read();
        let mut servers: Vec<NodeSpec> = membership.installed.values().cloned().collect();
        servers.extend(membership.joining.iter().cloned());
        servers
    }

    fn begin_migration(&self, kind: MigrationKind, nodes: &[NodeSpec]) -> Result<MigrationChange> {
        let ring_nodes: Vec<Node> = nodes.iter().map(NodeSpec::node).collect();
        let mut membership = self.membership.write();
        let migration = self.locator.begin(kind, &ring_nodes)?;
        info!(kind = ?migration.kind(), nodes = nodes.len(), "migration started");
        match kind {
            MigrationKind::Join => {
                membership.joining = nodes.to_vec();
                Ok(MigrationChange {
                    connect: nodes.to_vec(),
                    teardown: Vec::new(),
                })
            }
            MigrationKind::Leave => Ok(MigrationChange::default()),
        }
    }

    fn migration_progress(&self, range: RingToken, boundary: RingToken) -> bool {
        self.locator.progress(range, boundary)
    }

    fn redirect(&self, key: &[u8]) -> bool {
        self.locator.redirect(key)
    }

    fn finish_migration(&self) -> Option<MigrationChange> {
        let mut membership = self.membership.write();
        let migration = self.locator.finish()?;
        let joining = std::mem::take(&mut membership.joining);
        let installed = &mut membership.installed;
        let change = match migration.kind() {
            MigrationKind::Join => {
                installed.extend(joining.into_iter().map(|s| (s.id(), s)));
                MigrationChange::default()
            }
            MigrationKind::Leave => {
                let teardown: Vec<NodeId> = migration.movers().iter().map(|n| n.id).collect();
                installed.retain(|id, _| !teardown.contains(id));
                MigrationChange {
                    connect: Vec::new(),
                    teardown,
                }
            }
        };
        info!(kind = ?migration.kind(), "migration finished");
        Some(change)
    }
}

impl fmt::Debug for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStrategy")
            .field("locator", &self.locator)
            .finish()
    }
}
