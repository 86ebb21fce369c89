//! Error types for replica group handling.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// Member string not of the form `group^M^host:port` / `group^S^host:port`
    #[error("invalid replica member '{0}'")]
    InvalidMember(String),
    #[error("group '{group}' has more than one master")]
    DuplicateMaster { group: String },
    #[error("address {addr} appears more than once")]
    DuplicateAddress { addr: String },
}
