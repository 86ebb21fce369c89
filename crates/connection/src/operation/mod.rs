//! Operations: the unit of work that flows through the engine.
//!
//! An [`Operation`] wraps a [`Request`] with the state machine the engine
//! drives:
//!
//! ```text
//! Queued -> Writing -> Reading -> Complete
//!    \_________\__________\_____> Cancelled
//! ```
//!
//! Terminal states are final. Routing an operation again never revives it:
//! the old operation is superseded and fresh operations built from its
//! request inherit its completion.

pub mod factory;
pub mod future;
pub mod request;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use corelib::NodeId;
use parking_lot::{Mutex, MutexGuard};
use replication::Intent;
use tokio::sync::oneshot;

use crate::error::{CancelCause, ConnectionError, Result};

pub use factory::{DefaultFactory, OperationFactory};
pub use future::OperationFuture;
pub use request::{Decoded, Request};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpState {
    Queued = 0,
    Writing = 1,
    Reading = 2,
    Complete = 3,
    Cancelled = 4,
}

impl OpState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => OpState::Queued,
            1 => OpState::Writing,
            2 => OpState::Reading,
            3 => OpState::Complete,
            _ => OpState::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OpState::Complete | OpState::Cancelled)
    }
}

/// Where the result of an operation goes.
pub(crate) enum Completion {
    /// The submitter's future.
    Caller(oneshot::Sender<Result<Bytes>>),
    /// One part of an operation that was split per key.
    Part { fan_in: Arc<FanIn>, index: usize },
    /// Engine-issued work nobody waits for.
    Internal,
}

impl Completion {
    pub(crate) fn deliver(self, result: Result<Bytes>) {
        match self {
            // The receiver is gone when the caller stopped waiting.
            Completion::Caller(tx) => {
                let _ = tx.send(result);
            }
            Completion::Part { fan_in, index } => fan_in.deliver(index, result),
            Completion::Internal => {}
        }
    }
}

struct FanInState {
    parent: Option<Completion>,
    frames: Vec<Option<Bytes>>,
    remaining: usize,
}

/// Joins the results of split operations back into the original completion.
///
/// Frames are concatenated in part order; the first failing part fails the
/// whole and later results are dropped.
pub(crate) struct FanIn {
    state: Mutex<FanInState>,
}

impl FanIn {
    pub(crate) fn new(parent: Completion, parts: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FanInState {
                parent: Some(parent),
                frames: vec![None; parts],
                remaining: parts,
            }),
        })
    }

    fn deliver(&self, index: usize, result: Result<Bytes>) {
        let mut state = self.state.lock();
        let (parent, result) = match result {
            Err(err) => (state.parent.take(), Err(err)),
            Ok(frame) => {
                if state.parent.is_none() || state.frames[index].is_some() {
                    return;
                }
                state.frames[index] = Some(frame);
                state.remaining -= 1;
                if state.remaining > 0 {
                    return;
                }
                let mut joined = BytesMut::new();
                for frame in state.frames.iter().flatten() {
                    joined.extend_from_slice(frame);
                }
                (state.parent.take(), Ok(joined.freeze()))
            }
        };
        drop(state);
        if let Some(parent) = parent {
            parent.deliver(result);
        }
    }
}

/// A request in flight, shared between the submitter's future and the node
/// queue that currently holds it.
pub struct Operation {
    request: Mutex<Box<dyn Request>>,
    keys: Vec<Bytes>,
    intent: Intent,
    idempotent: bool,
    batchable: bool,
    state: AtomicU8,
    /// Non-owning back-reference to the node whose queue holds the
    /// operation.
    handling_node: Mutex<Option<NodeId>>,
    cancel_cause: Mutex<Option<CancelCause>>,
    error: Mutex<Option<String>>,
    completion: Mutex<Option<Completion>>,
    /// Copies that took over the work when the operation was re-routed.
    successors: Mutex<Vec<Arc<Operation>>>,
    redirects: u32,
}

impl Operation {
    fn with_completion(request: Box<dyn Request>, completion: Completion, redirects: u32) -> Self {
        Self {
            keys: request.keys(),
            intent: request.intent(),
            idempotent: request.is_idempotent(),
            batchable: request.is_batchable(),
            request: Mutex::new(request),
            state: AtomicU8::new(OpState::Queued as u8),
            handling_node: Mutex::new(None),
            cancel_cause: Mutex::new(None),
            error: Mutex::new(None),
            completion: Mutex::new(Some(completion)),
            successors: Mutex::new(Vec::new()),
            redirects,
        }
    }

    /// A new operation and the receiver its result is sent to.
    pub(crate) fn new(request: Box<dyn Request>) -> (Arc<Self>, oneshot::Receiver<Result<Bytes>>) {
        let (tx, rx) = oneshot::channel();
        let op = Self::with_completion(request, Completion::Caller(tx), 0);
        (Arc::new(op), rx)
    }

    /// An engine-issued operation with no waiter.
    pub(crate) fn internal(request: Box<dyn Request>) -> Arc<Self> {
        Arc::new(Self::with_completion(request, Completion::Internal, 0))
    }

    /// An operation that takes over `completion` from a superseded one.
    pub(crate) fn derived(request: Box<dyn Request>, completion: Completion, redirects: u32) -> Arc<Self> {
        Arc::new(Self::with_completion(request, completion, redirects))
    }

    pub fn state(&self) -> OpState {
        OpState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn keys(&self) -> &[Bytes] {
        &self.keys
    }

    pub fn intent(&self) -> Intent {
        self.intent
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn is_batchable(&self) -> bool {
        self.batchable
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == OpState::Cancelled
    }

    pub fn has_errored(&self) -> bool {
        self.error.lock().is_some()
    }

    /// Description of the failure that completed the operation, if any.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn cancel_cause(&self) -> Option<CancelCause> {
        self.cancel_cause.lock().clone()
    }

    pub fn handling_node(&self) -> Option<NodeId> {
        *self.handling_node.lock()
    }

    pub(crate) fn set_handling_node(&self, node: Option<NodeId>) {
        *self.handling_node.lock() = node;
    }

    /// Number of times the operation's request was redirected.
    pub fn redirects(&self) -> u32 {
        self.redirects
    }

    pub(crate) fn request(&self) -> MutexGuard<'_, Box<dyn Request>> {
        self.request.lock()
    }

    /// Move to a non-terminal state. Fails once the operation is terminal.
    pub(crate) fn transition(&self, next: OpState) -> bool {
        debug_assert!(!next.is_terminal());
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (!OpState::from_u8(v).is_terminal()).then_some(next as u8)
            })
            .is_ok()
    }

    fn finish(&self, terminal: OpState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (!OpState::from_u8(v).is_terminal()).then_some(terminal as u8)
            })
            .is_ok()
    }

    /// Cancel the operation. Returns `false` if it had already finished.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        if !self.finish(OpState::Cancelled) {
            return false;
        }
        *self.cancel_cause.lock() = Some(cause.clone());
        if let Some(completion) = self.completion.lock().take() {
            completion.deliver(Err(ConnectionError::Cancelled { cause }));
        }
        true
    }

    pub(crate) fn complete(&self, frame: Bytes) -> bool {
        if !self.finish(OpState::Complete) {
            return false;
        }
        if let Some(completion) = self.completion.lock().take() {
            completion.deliver(Ok(frame));
        }
        true
    }

    /// Complete the operation with an error.
    pub(crate) fn fail(&self, error: ConnectionError) -> bool {
        if !self.finish(OpState::Complete) {
            return false;
        }
        *self.error.lock() = Some(error.to_string());
        if let Some(completion) = self.completion.lock().take() {
            completion.deliver(Err(error));
        }
        true
    }

    /// Retire the operation in favour of replacements and hand over its
    /// completion. `None` if it already finished.
    pub(crate) fn supersede(&self) -> Option<Completion> {
        if !self.finish(OpState::Cancelled) {
            return None;
        }
        *self.cancel_cause.lock() = Some(CancelCause::Superseded);
        self.completion.lock().take()
    }

    pub(crate) fn set_successors(&self, copies: Vec<Arc<Operation>>) {
        *self.successors.lock() = copies;
    }

    /// The operations carrying this one's work: itself, or the copies it was
    /// re-routed to, followed through later re-routes.
    pub(crate) fn leaves(self: &Arc<Self>) -> Vec<Arc<Operation>> {
        let successors = self.successors.lock().clone();
        if successors.is_empty() {
            return vec![Arc::clone(self)];
        }
        successors.iter().flat_map(Operation::leaves).collect()
    }

    /// Cancel the operation, or the copies still running once it was
    /// re-routed. Returns whether anything was cancelled.
    pub(crate) fn cancel_leaves(self: &Arc<Self>, cause: CancelCause) -> bool {
        self.leaves()
            .iter()
            .fold(false, |any, op| op.cancel(cause.clone()) || any)
    }

    /// Prepare the operation to be written again on a new connection.
    pub(crate) fn reset(&self) -> bool {
        if !self.transition(OpState::Queued) {
            return false;
        }
        self.request.lock().reset();
        true
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("state", &self.state())
            .field("keys", &self.keys.len())
            .field("redirects", &self.redirects)
            .finish()
    }
}
