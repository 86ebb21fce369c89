//! Connection engine for a cache client talking to a cluster of
//! memcached-style servers.
//!
//! Callers submit operations from any thread; one I/O thread owns every
//! socket and:
//! - Routes each operation by key through a [`TopologyStrategy`]
//! - Pipelines requests per node and matches responses in order
//! - Reconnects with exponential backoff, applying a [`FailureMode`] to the
//!   operations of a failed node
//! - Applies server list changes, replica switchovers and live migrations
//!   without dropping queued work
//!
//! The wire format is left to [`Request`] implementations.

pub mod config;
pub mod engine;
pub mod error;
pub mod node;
pub mod observer;
pub mod operation;
pub mod reconnect;
pub mod timeout;
pub mod topology;

pub use config::{ConnectionConfig, FailureMode, SocketOptions, TimeoutThresholds};
pub use engine::{ConnectionBuilder, MemcachedConnection};
pub use error::{CancelCause, ConnectionError, Result};
pub use node::{NodeState, NodeStatus};
pub use observer::ConnectionObserver;
pub use operation::{
    Decoded, DefaultFactory, OpState, Operation, OperationFactory, OperationFuture, Request,
};
pub use topology::{
    BasicStrategy, MigrationChange, MigrationStrategy, NodeSpec, ReplicaStrategy, ReplicaTask,
    TopologyPlan, TopologyStrategy,
};

pub use corelib::{MigrationKind, RingToken};
pub use replication::{Intent, ReadPriority};
