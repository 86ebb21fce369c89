//! Topology strategies.
//!
//! The engine runs a single code path for every deployment. What differs
//! between a plain cluster, a replicated one and one under live migration is
//! delegated to a [`TopologyStrategy`]:
//!
//! - how keys resolve to servers
//! - how a new server list is compared with the installed one
//! - whether role switchovers and migrations are supported

pub mod basic;
pub mod migration;
pub mod replica;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use corelib::{MigrationKind, Node, NodeId, RingToken};
use replication::{Intent, ReplicaMember, ReplicaRole};

use crate::error::{ConnectionError, Result};

pub use basic::BasicStrategy;
pub use migration::MigrationStrategy;
pub use replica::ReplicaStrategy;

/// One server as listed by the membership feed: `host:port`, or
/// `group^M|S^host:port` in a replicated deployment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeSpec {
    pub addr: String,
    pub replica: Option<ReplicaMember>,
}

impl NodeSpec {
    pub fn plain(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            replica: None,
        }
    }

    pub fn id(&self) -> NodeId {
        NodeId::from_name(&self.addr)
    }

    /// Ring identity of the server itself.
    pub fn node(&self) -> Node {
        Node::new(self.addr.clone())
    }

    pub fn role(&self) -> Option<ReplicaRole> {
        self.replica.as_ref().map(|m| m.role)
    }

    /// Parse a comma or whitespace separated list.
    pub fn parse_list(list: &str) -> Result<Vec<NodeSpec>> {
        list.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for NodeSpec {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.contains('^') {
            let member: ReplicaMember = s.parse()?;
            return Ok(Self {
                addr: member.addr.clone(),
                replica: Some(member),
            });
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::plain(s))
            }
            _ => Err(ConnectionError::Topology(format!("invalid address: {:?}", s))),
        }
    }
}

impl From<ReplicaMember> for NodeSpec {
    fn from(member: ReplicaMember) -> Self {
        Self {
            addr: member.addr.clone(),
            replica: Some(member),
        }
    }
}

impl fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.replica {
            Some(member) => fmt::Display::fmt(member, f),
            None => f.write_str(&self.addr),
        }
    }
}

/// Follow-up work after the ring update of a replicated topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicaTask {
    /// Hand the queued operations of the old master to the new one.
    MoveOperations {
        group: String,
        from: NodeId,
        to: NodeId,
        /// Set on failover: in-flight writes may or may not have been applied.
        cancel_non_idempotent: bool,
    },
}

/// What installing a server list changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyPlan {
    /// The full list being installed.
    pub next: Vec<NodeSpec>,
    pub added: Vec<NodeSpec>,
    pub removed: Vec<NodeId>,
    /// Run in order after the ring update and before removed nodes go away.
    pub tasks: Vec<ReplicaTask>,
    /// Replica role of every server in `next`.
    pub roles: BTreeMap<NodeId, ReplicaRole>,
}

impl TopologyPlan {
    /// True when installing the plan changes neither membership nor roles.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.tasks.is_empty()
    }
}

/// Servers to connect and servers to tear down after a migration step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationChange {
    pub connect: Vec<NodeSpec>,
    pub teardown: Vec<NodeId>,
}

/// Deployment-specific routing and topology semantics.
///
/// Routing methods are called from any thread. Topology methods are only
/// called from the engine thread, except [`plan`](Self::plan) which is pure
/// and also used to validate a list before it is queued.
pub trait TopologyStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// The server that should receive an access to `key`.
    fn primary(&self, key: &[u8], intent: Intent) -> Option<NodeId>;

    /// Fallback order for `key`; the first element is the primary.
    fn sequence(&self, key: &[u8], intent: Intent) -> Vec<NodeId>;

    /// Compare `next` with the installed list.
    fn plan(&self, next: &[NodeSpec]) -> Result<TopologyPlan>;

    /// Make `plan.next` the installed list and publish the new ring.
    fn install(&self, plan: &TopologyPlan) -> Result<()>;

    /// Every server currently installed, including servers joining through
    /// a migration.
    fn servers(&self) -> Vec<NodeSpec>;

    /// Promote the first slave of `group` locally. Returns the old and new
    /// master.
    fn switchover(&self, _group: &str) -> Option<(NodeId, NodeId)> {
        None
    }

    /// Replica group and role of a server.
    fn role_of(&self, _node: NodeId) -> Option<(String, ReplicaRole)> {
        None
    }

    fn begin_migration(&self, _kind: MigrationKind, _nodes: &[NodeSpec]) -> Result<MigrationChange> {
        Err(ConnectionError::Topology(format!(
            "{} topology does not support migration",
            self.name()
        )))
    }

    /// Record migration progress. `false` when nothing is migrating.
    fn migration_progress(&self, _range: RingToken, _boundary: RingToken) -> bool {
        false
    }

    /// A server reported that `key` has moved. `false` when nothing is
    /// migrating.
    fn redirect(&self, _key: &[u8]) -> bool {
        false
    }

    fn finish_migration(&self) -> Option<MigrationChange> {
        None
    }
}

/// Plain-address membership shared by the basic and migration strategies.
fn plan_plain(installed: &BTreeMap<NodeId, NodeSpec>, next: &[NodeSpec]) -> Result<TopologyPlan> {
    let mut wanted: BTreeMap<NodeId, NodeSpec> = BTreeMap::new();
    for spec in next {
        if spec.replica.is_some() {
            return Err(ConnectionError::Topology(format!(
                "replica member {} in a plain topology",
                spec
            )));
        }
        wanted.insert(spec.id(), spec.clone());
    }
    Ok(TopologyPlan {
        added: wanted
            .iter()
            .filter(|(id, _)| !installed.contains_key(id))
            .map(|(_, spec)| spec.clone())
            .collect(),
        removed: installed
            .keys()
            .filter(|id| !wanted.contains_key(id))
            .copied()
            .collect(),
        next: wanted.into_values().collect(),
        tasks: Vec::new(),
        roles: BTreeMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_specs() {
        let plain: NodeSpec = "10.0.0.1:11211".parse().unwrap();
        assert_eq!(plain.addr, "10.0.0.1:11211");
        assert!(plain.replica.is_none());

        let member: NodeSpec = "g0^S^10.0.0.2:11211".parse().unwrap();
        assert_eq!(member.addr, "10.0.0.2:11211");
        assert_eq!(member.role(), Some(ReplicaRole::Slave));
        assert_eq!(member.to_string(), "g0^S^10.0.0.2:11211");

        assert!("localhost".parse::<NodeSpec>().is_err());
        assert!("host:port".parse::<NodeSpec>().is_err());
        assert!("g0^X^a:1".parse::<NodeSpec>().is_err());
    }

    #[test]
    fn test_parse_list() {
        let list = NodeSpec::parse_list("a:1, b:2\nc:3").unwrap();
        let addrs: Vec<&str> = list.iter().map(|s| s.addr.as_str()).collect();
        assert_eq!(addrs, vec!["a:1", "b:2", "c:3"]);
        assert!(NodeSpec::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_plain_plan_is_symmetric_difference() {
        let installed: BTreeMap<NodeId, NodeSpec> = ["a:1", "b:1"]
            .iter()
            .map(|a| (NodeId::from_name(a), NodeSpec::plain(*a)))
            .collect();
        let plan = plan_plain(&installed, &NodeSpec::parse_list("a:1 c:1 c:1").unwrap()).unwrap();

        assert_eq!(plan.added, vec![NodeSpec::plain("c:1")]);
        assert_eq!(plan.removed, vec![NodeId::from_name("b:1")]);
        assert_eq!(plan.next.len(), 2);
    }
}
