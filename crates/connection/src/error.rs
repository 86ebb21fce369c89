//! Error types for the connection engine.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Why an operation was cancelled.
///
/// Rendered into the human-readable cause callers see on a cancelled
/// operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelCause {
    /// The caller stopped waiting.
    TimedOut,
    /// The caller cancelled explicitly.
    Explicit,
    /// The ring had no node for the key.
    NoNode,
    /// The key's node is down and the failure mode is `cancel`.
    NodeInactive { node: String },
    /// The node was dropped from the topology.
    NodeRemoved { node: String },
    /// The node's connection failed with the operation still queued.
    ConnectionLost { node: String, reason: String },
    /// A non-idempotent operation was in flight when its connection failed;
    /// it may already have been applied and is not replayed.
    NotReplayable { node: String },
    /// The node's input queue was full while re-routing.
    QueueOverflow { node: String },
    /// The operation was redirected more times than allowed.
    TooManyRedirects { hops: u32 },
    /// The request cannot be split for re-routing.
    NotRoutable,
    /// The operation was replaced by re-routed copies.
    Superseded,
    /// The connection was shut down.
    Shutdown,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::TimedOut => f.write_str("timed out"),
            CancelCause::Explicit => f.write_str("cancelled by caller"),
            CancelCause::NoNode => f.write_str("no node available for key"),
            CancelCause::NodeInactive { node } => write!(f, "node inactive: {}", node),
            CancelCause::NodeRemoved { node } => write!(f, "node removed: {}", node),
            CancelCause::ConnectionLost { node, reason } => {
                write!(f, "connection to {} lost: {}", node, reason)
            }
            CancelCause::NotReplayable { node } => {
                write!(f, "connection to {} lost while a non-idempotent operation was in flight", node)
            }
            CancelCause::QueueOverflow { node } => write!(f, "input queue of {} is full", node),
            CancelCause::TooManyRedirects { hops } => write!(f, "redirected {} times", hops),
            CancelCause::NotRoutable => f.write_str("operation cannot be re-routed"),
            CancelCause::Superseded => f.write_str("superseded by a re-routed copy"),
            CancelCause::Shutdown => f.write_str("connection shut down"),
        }
    }
}

/// Errors surfaced by the connection engine.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream did not frame as expected.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation cancelled: {cause}")]
    Cancelled { cause: CancelCause },

    #[error("operation timed out after {elapsed:?}")]
    TimedOut { elapsed: Duration },

    #[error("input queue of {node} is full")]
    QueueFull { node: String },

    #[error("connection is shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("topology error: {0}")]
    Topology(String),
}

impl ConnectionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConnectionError::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectionError::TimedOut { .. })
    }
}

impl From<corelib::Error> for ConnectionError {
    fn from(error: corelib::Error) -> Self {
        ConnectionError::Topology(error.to_string())
    }
}

impl From<replication::ReplicationError> for ConnectionError {
    fn from(error: replication::ReplicationError) -> Self {
        ConnectionError::Topology(error.to_string())
    }
}

impl From<toml::de::Error> for ConnectionError {
    fn from(error: toml::de::Error) -> Self {
        ConnectionError::Config(error.to_string())
    }
}
