//! Replica selection strategies.
//!
//! A strategy decides which member of a group serves an access:
//!
//! - Writes always go to the master.
//! - Reads follow the configured [`ReadPriority`].

pub mod priority;

use serde::{Deserialize, Serialize};

use crate::group::{ReplicaGroup, ReplicaMember};

pub use priority::PriorityStrategy;

/// Whether an operation only reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
}

/// Which member answers reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPriority {
    #[default]
    Master,
    /// First slave, falling back to the master when the group has none.
    Slave,
    /// Rotate over all members.
    RoundRobin,
}

/// Trait for replica selection strategies.
///
/// # Thread Safety
///
/// Implementations must be thread-safe (Send + Sync): they are consulted from
/// every thread that submits operations.
pub trait ReplicationStrategy: Send + Sync + 'static {
    /// Pick the member of `group` that should serve an access.
    ///
    /// # Returns
    /// `None` when the group has no member able to serve the intent (for
    /// example a write to a group whose master is gone).
    fn select<'g>(&self, group: &'g ReplicaGroup, intent: Intent) -> Option<&'g ReplicaMember>;

    /// Get the strategy name (for logging/debugging).
    fn name(&self) -> &'static str;
}
