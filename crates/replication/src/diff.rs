//! Per-group topology diff.
//!
//! A plain address diff cannot tell a role change from membership churn: when
//! `g0^M^a` / `g0^S^b` becomes `g0^M^b` / `g0^S^a`, no server was added or
//! removed, yet every write queued on `a` must move to `b`. This module
//! compares two group tables and reports both kinds of change.

use std::collections::{BTreeMap, HashSet};

use crate::group::{ReplicaGroup, ReplicaMember};

/// How a group's master changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleChangeKind {
    /// Planned: the old master is still in the group, now as a slave.
    Switchover,
    /// Unplanned: the old master left the group and a slave took over.
    Failover,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleChange {
    pub group: String,
    pub old_master: ReplicaMember,
    pub new_master: ReplicaMember,
    pub kind: RoleChangeKind,
}

/// Difference between two group tables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupDiff {
    /// Groups that appear on the ring.
    pub added_groups: Vec<ReplicaGroup>,
    /// Groups that disappear from the ring.
    pub removed_groups: Vec<ReplicaGroup>,
    /// Servers that were not part of any group before.
    pub added_members: Vec<ReplicaMember>,
    /// Servers that are no longer part of any group.
    pub removed_members: Vec<ReplicaMember>,
    /// Master changes of groups present in both tables.
    pub role_changes: Vec<RoleChange>,
}

impl GroupDiff {
    /// Compare `old` against `new`.
    pub fn between(
        old: &BTreeMap<String, ReplicaGroup>,
        new: &BTreeMap<String, ReplicaGroup>,
    ) -> Self {
        let mut diff = GroupDiff::default();

        let old_addrs: HashSet<&str> = old
            .values()
            .flat_map(|g| g.members())
            .map(|m| m.addr.as_str())
            .collect();
        let new_addrs: HashSet<&str> = new
            .values()
            .flat_map(|g| g.members())
            .map(|m| m.addr.as_str())
            .collect();

        for group in new.values() {
            if !old.contains_key(&group.name) {
                diff.added_groups.push(group.clone());
            }
            for member in group.members() {
                if !old_addrs.contains(member.addr.as_str()) {
                    diff.added_members.push(member.clone());
                }
            }
        }
        for group in old.values() {
            if !new.contains_key(&group.name) {
                diff.removed_groups.push(group.clone());
            }
            for member in group.members() {
                if !new_addrs.contains(member.addr.as_str()) {
                    diff.removed_members.push(member.clone());
                }
            }
        }

        for (name, before) in old {
            let Some(after) = new.get(name) else {
                continue;
            };
            let (Some(old_master), Some(new_master)) = (&before.master, &after.master) else {
                continue;
            };
            if old_master.addr == new_master.addr {
                continue;
            }
            let kind = if after.contains(&old_master.addr) {
                RoleChangeKind::Switchover
            } else {
                RoleChangeKind::Failover
            };
            diff.role_changes.push(RoleChange {
                group: name.clone(),
                old_master: old_master.clone(),
                new_master: new_master.clone(),
                kind,
            });
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added_groups.is_empty()
            && self.removed_groups.is_empty()
            && self.added_members.is_empty()
            && self.removed_members.is_empty()
            && self.role_changes.is_empty()
    }
}
