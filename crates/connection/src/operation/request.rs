//! The request payload carried by an operation.
//!
//! The engine never looks inside a request. It asks it for the bytes to
//! write, feeds it the bytes that come back, and acts on the verdict.

use bytes::{Bytes, BytesMut};
use replication::Intent;

use crate::error::Result;

/// Outcome of feeding response bytes to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// More bytes are needed. Nothing was consumed that belongs to the next
    /// response.
    Incomplete,
    /// The full response frame, removed from the buffer.
    Complete(Bytes),
    /// The server no longer owns the key; route the request again.
    Redirect,
    /// The server is no longer master of its replica group.
    Switchover,
}

/// Wire form of one request.
///
/// Implementations must be `Send` because requests are built on caller
/// threads and encoded on the engine thread.
pub trait Request: Send + 'static {
    /// Keys the request touches, in request order.
    fn keys(&self) -> Vec<Bytes>;

    /// Append the request bytes to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Consume one response from the front of `buf`.
    ///
    /// Must leave `buf` untouched when returning [`Decoded::Incomplete`].
    /// An `Err` means the stream can no longer be framed.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded>;

    fn intent(&self) -> Intent {
        Intent::Write
    }

    /// False when replaying the request after a lost connection could apply
    /// it twice.
    fn is_idempotent(&self) -> bool {
        true
    }

    /// Whether consecutive requests of this kind may share a socket write.
    fn is_batchable(&self) -> bool {
        false
    }

    /// Forget any partially decoded response before the request is resent.
    fn reset(&mut self) {}

    /// One fresh request per key, used to route a request again. An empty
    /// result marks the request as not routable.
    fn split_by_key(&self) -> Vec<Box<dyn Request>> {
        Vec::new()
    }
}
