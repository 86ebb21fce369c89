//! Requests the engine builds on its own.

use std::fmt;

use super::request::Request;

/// Source of engine-issued requests.
pub trait OperationFactory: Send + Sync {
    /// The handshake sent first on every new connection. Its response frame
    /// is recorded as the node's version. `None` disables the handshake.
    fn version(&self) -> Option<Box<dyn Request>>;

    /// Requests that replace `request` when it has to be routed again, one
    /// per node it may now land on.
    fn clone_request(&self, request: &dyn Request) -> Vec<Box<dyn Request>> {
        request.split_by_key()
    }
}

/// Factory without a handshake.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultFactory;

impl OperationFactory for DefaultFactory {
    fn version(&self) -> Option<Box<dyn Request>> {
        None
    }
}

impl fmt::Debug for dyn OperationFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OperationFactory")
    }
}
