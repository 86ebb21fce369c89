//! Replica groups and their members.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use corelib::{Node, NodeId};
use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, Result};

/// Role of a server inside its replica group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    Master,
    Slave,
}

impl ReplicaRole {
    fn tag(self) -> &'static str {
        match self {
            ReplicaRole::Master => "M",
            ReplicaRole::Slave => "S",
        }
    }
}

/// One server of a replica group, as announced by the membership feed.
///
/// The textual form is `<group>^<M|S>^<host:port>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReplicaMember {
    pub group: String,
    pub role: ReplicaRole,
    pub addr: String,
}

impl ReplicaMember {
    pub fn new(group: impl Into<String>, role: ReplicaRole, addr: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            role,
            addr: addr.into(),
        }
    }

    /// Id of the physical server; independent of group and role.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_name(&self.addr)
    }
}

impl FromStr for ReplicaMember {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(3, '^');
        let (Some(group), Some(role), Some(addr)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ReplicationError::InvalidMember(s.to_string()));
        };
        let role = match role {
            "M" => ReplicaRole::Master,
            "S" => ReplicaRole::Slave,
            _ => return Err(ReplicationError::InvalidMember(s.to_string())),
        };
        if group.is_empty() || addr.is_empty() {
            return Err(ReplicationError::InvalidMember(s.to_string()));
        }
        Ok(Self::new(group, role, addr))
    }
}

impl fmt::Display for ReplicaMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}^{}^{}", self.group, self.role.tag(), self.addr)
    }
}

/// A master and its slaves. Keys are hashed to groups, not to servers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaGroup {
    pub name: String,
    pub master: Option<ReplicaMember>,
    pub slaves: Vec<ReplicaMember>,
}

impl ReplicaGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            master: None,
            slaves: Vec::new(),
        }
    }

    /// Group a flat member list by group name.
    ///
    /// Slaves keep the order in which they were announced; that order is the
    /// promotion order used by a local switchover.
    pub fn from_members(members: &[ReplicaMember]) -> Result<BTreeMap<String, ReplicaGroup>> {
        let mut seen = HashSet::new();
        let mut groups: BTreeMap<String, ReplicaGroup> = BTreeMap::new();
        for member in members {
            if !seen.insert(member.addr.as_str()) {
                return Err(ReplicationError::DuplicateAddress {
                    addr: member.addr.clone(),
                });
            }
            let group = groups
                .entry(member.group.clone())
                .or_insert_with(|| ReplicaGroup::new(member.group.clone()));
            match member.role {
                ReplicaRole::Master if group.master.is_some() => {
                    return Err(ReplicationError::DuplicateMaster {
                        group: member.group.clone(),
                    })
                }
                ReplicaRole::Master => group.master = Some(member.clone()),
                ReplicaRole::Slave => group.slaves.push(member.clone()),
            }
        }
        Ok(groups)
    }

    /// Ring identity of the group.
    pub fn ring_node(&self) -> Node {
        Node::new(self.name.clone())
    }

    /// Master first, then slaves in promotion order.
    pub fn members(&self) -> impl Iterator<Item = &ReplicaMember> {
        self.master.iter().chain(self.slaves.iter())
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.members().any(|m| m.addr == addr)
    }

    pub fn role_of(&self, addr: &str) -> Option<ReplicaRole> {
        self.members().find(|m| m.addr == addr).map(|m| m.role)
    }

    /// The group after promoting its first slave.
    ///
    /// The old master is demoted to the tail of the slave list. Returns
    /// `None` when there is no master or no slave to promote.
    pub fn switched_over(&self) -> Option<ReplicaGroup> {
        let old = self.master.as_ref()?;
        let (first, rest) = self.slaves.split_first()?;
        let mut slaves: Vec<ReplicaMember> = rest.to_vec();
        slaves.push(ReplicaMember::new(&self.name, ReplicaRole::Slave, &old.addr));
        Some(ReplicaGroup {
            name: self.name.clone(),
            master: Some(ReplicaMember::new(&self.name, ReplicaRole::Master, &first.addr)),
            slaves,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_member() {
        let m: ReplicaMember = "g0^M^10.0.0.1:11211".parse().unwrap();
        assert_eq!(m.group, "g0");
        assert_eq!(m.role, ReplicaRole::Master);
        assert_eq!(m.addr, "10.0.0.1:11211");
        assert_eq!(m.to_string(), "g0^M^10.0.0.1:11211");

        assert!("g0^X^10.0.0.1:11211".parse::<ReplicaMember>().is_err());
        assert!("10.0.0.1:11211".parse::<ReplicaMember>().is_err());
        assert!("^M^10.0.0.1:11211".parse::<ReplicaMember>().is_err());
    }

    #[test]
    fn test_group_members() {
        let members: Vec<ReplicaMember> = ["g0^S^b:1", "g0^M^a:1", "g1^M^c:1", "g0^S^d:1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let groups = ReplicaGroup::from_members(&members).unwrap();

        assert_eq!(groups.len(), 2);
        let g0 = &groups["g0"];
        let order: Vec<&str> = g0.members().map(|m| m.addr.as_str()).collect();
        assert_eq!(order, vec!["a:1", "b:1", "d:1"]);
        assert_eq!(g0.role_of("b:1"), Some(ReplicaRole::Slave));
    }

    #[test]
    fn test_group_rejects_two_masters_and_duplicates() {
        let two_masters: Vec<ReplicaMember> =
            vec!["g0^M^a:1".parse().unwrap(), "g0^M^b:1".parse().unwrap()];
        assert!(matches!(
            ReplicaGroup::from_members(&two_masters),
            Err(ReplicationError::DuplicateMaster { .. })
        ));

        let dup: Vec<ReplicaMember> =
            vec!["g0^M^a:1".parse().unwrap(), "g1^S^a:1".parse().unwrap()];
        assert!(matches!(
            ReplicaGroup::from_members(&dup),
            Err(ReplicationError::DuplicateAddress { .. })
        ));
    }

    #[test]
    fn test_switched_over_promotes_first_slave() {
        let members: Vec<ReplicaMember> = ["g0^M^a:1", "g0^S^b:1", "g0^S^c:1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let group = ReplicaGroup::from_members(&members).unwrap().remove("g0").unwrap();

        let next = group.switched_over().unwrap();
        assert_eq!(next.master.as_ref().unwrap().addr, "b:1");
        let slaves: Vec<&str> = next.slaves.iter().map(|m| m.addr.as_str()).collect();
        assert_eq!(slaves, vec!["c:1", "a:1"]);

        assert!(ReplicaGroup::new("empty").switched_over().is_none());
    }
}
