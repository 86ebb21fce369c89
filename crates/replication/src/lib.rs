//! Replica-group awareness for the cache client.
//!
//! In a replicated deployment the ring is built over *groups*, and each group
//! holds one master and any number of slaves. This crate provides:
//! - How members are named and parsed (`group^M^host:port`)
//! - Which member serves a given access (read priority strategies)
//! - How two group tables differ (switchover/failover detection)
//! - A locator that resolves keys to members

pub mod diff;
pub mod error;
pub mod group;
pub mod locator;
pub mod strategy;

pub use diff::{GroupDiff, RoleChange, RoleChangeKind};
pub use error::{ReplicationError, Result};
pub use group::{ReplicaGroup, ReplicaMember, ReplicaRole};
pub use locator::ReplicaLocator;
pub use strategy::{Intent, PriorityStrategy, ReadPriority, ReplicationStrategy};
