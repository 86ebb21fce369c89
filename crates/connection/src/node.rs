//! One server endpoint.
//!
//! Each node is split in two halves:
//!
//! - [`NodeHandle`] is shared with submitting threads. It carries the input
//!   queue, the only queue other threads may append to, and the state the
//!   dispatch path reads.
//! - [`MemcachedNode`] is owned by the engine thread. It holds the socket,
//!   the buffers, the write and read queues and the failure counters, so none
//!   of them need synchronisation.
//!
//! Operations move through the queues in one direction only:
//! input -> write -> read -> gone.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use corelib::NodeId;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use replication::ReplicaRole;
use tokio::io::Interest;
use tokio::task::JoinHandle;

use crate::engine::selector::Channel;
use crate::error::{CancelCause, ConnectionError, Result};
use crate::operation::{Decoded, OpState, Operation};
use crate::timeout::TimeoutTracker;
use crate::topology::NodeSpec;

/// Engine view of a node's connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    /// First connect attempt in progress.
    Connecting = 0,
    Active = 1,
    /// Lost its connection; waiting for a reconnect.
    Reconnecting = 2,
    /// Dropped from the topology.
    Removed = 3,
}

impl NodeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => NodeState::Connecting,
            1 => NodeState::Active,
            2 => NodeState::Reconnecting,
            _ => NodeState::Removed,
        }
    }
}

/// Read-only snapshot of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeStatus {
    pub addr: String,
    pub state: NodeState,
    pub version: Option<String>,
    /// Operations submitted but not yet picked up by the engine thread.
    pub queued: usize,
}

/// Thread-safe half of a node.
pub(crate) struct NodeHandle {
    pub(crate) id: NodeId,
    pub(crate) addr: String,
    input: SegQueue<Arc<Operation>>,
    state: AtomicU8,
    version: Mutex<Option<String>>,
}

impl NodeHandle {
    pub(crate) fn new(spec: &NodeSpec) -> Arc<Self> {
        Arc::new(Self {
            id: spec.id(),
            addr: spec.addr.clone(),
            input: SegQueue::new(),
            state: AtomicU8::new(NodeState::Connecting as u8),
            version: Mutex::new(None),
        })
    }

    pub(crate) fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.state() == NodeState::Removed
    }

    /// Whether the dispatch path may queue new work here.
    pub(crate) fn is_usable(&self) -> bool {
        matches!(self.state(), NodeState::Connecting | NodeState::Active)
    }

    /// Append to the input queue. The only cross-thread queue mutation.
    pub(crate) fn add_op_to_input_queue(&self, op: Arc<Operation>, max_len: usize) -> Result<()> {
        if self.input.len() >= max_len {
            return Err(ConnectionError::QueueFull {
                node: self.addr.clone(),
            });
        }
        op.set_handling_node(Some(self.id));
        self.input.push(op);
        Ok(())
    }

    pub(crate) fn pop_input(&self) -> Option<Arc<Operation>> {
        self.input.pop()
    }

    pub(crate) fn input_len(&self) -> usize {
        self.input.len()
    }

    pub(crate) fn version(&self) -> Option<String> {
        self.version.lock().clone()
    }

    fn set_version(&self, version: Option<String>) {
        *self.version.lock() = version;
    }

    pub(crate) fn status(&self) -> NodeStatus {
        NodeStatus {
            addr: self.addr.clone(),
            state: self.state(),
            version: self.version(),
            queued: self.input_len(),
        }
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

/// What a read pass produced besides plain completions.
#[derive(Debug)]
pub(crate) enum ReadEvent {
    Completed,
    Version(String),
    /// The server no longer owns the operation's key.
    Redirect(Arc<Operation>),
    /// The server is no longer master of its group.
    Switchover(Arc<Operation>),
}

/// Engine-owned half of a node.
pub(crate) struct MemcachedNode {
    handle: Arc<NodeHandle>,
    role: Option<ReplicaRole>,
    channel: Option<Channel>,
    connect_task: Option<JoinHandle<()>>,
    generation: u64,
    rbuf: BytesMut,
    wbuf: BytesMut,
    write_q: VecDeque<Arc<Operation>>,
    /// Encoded into `wbuf`, with the number of their bytes not yet sent.
    writing: VecDeque<(Arc<Operation>, usize)>,
    read_q: VecDeque<Arc<Operation>>,
    version_op: Option<Arc<Operation>>,
    read_buffer_size: usize,
    pub(crate) reconnect_attempts: u32,
    pub(crate) timeouts: TimeoutTracker,
}

impl MemcachedNode {
    pub(crate) fn new(handle: Arc<NodeHandle>, role: Option<ReplicaRole>, read_buffer_size: usize) -> Self {
        Self {
            handle,
            role,
            channel: None,
            connect_task: None,
            generation: 0,
            rbuf: BytesMut::with_capacity(read_buffer_size),
            wbuf: BytesMut::with_capacity(read_buffer_size),
            write_q: VecDeque::new(),
            writing: VecDeque::new(),
            read_q: VecDeque::new(),
            version_op: None,
            read_buffer_size,
            reconnect_attempts: 0,
            timeouts: TimeoutTracker::new(),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.handle.id
    }

    pub(crate) fn addr(&self) -> &str {
        &self.handle.addr
    }

    pub(crate) fn handle(&self) -> &Arc<NodeHandle> {
        &self.handle
    }

    pub(crate) fn role(&self) -> Option<ReplicaRole> {
        self.role
    }

    pub(crate) fn set_role(&mut self, role: Option<ReplicaRole>) {
        self.role = role;
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub(crate) fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// Drop any socket and open a new generation for a connect attempt.
    pub(crate) fn begin_connect(&mut self) -> u64 {
        self.disconnect();
        self.generation
    }

    pub(crate) fn set_connect_task(&mut self, task: JoinHandle<()>) {
        self.connect_task = Some(task);
    }

    /// Install the socket of a finished connect attempt.
    pub(crate) fn attach(&mut self, channel: Channel) {
        self.connect_task = None;
        self.channel = Some(channel);
        self.timeouts.reset();
        self.handle.set_state(NodeState::Active);
    }

    /// Close the socket, abandon a pending connect and invalidate events of
    /// the old generation. Returns whether a socket was open.
    pub(crate) fn disconnect(&mut self) -> bool {
        let was_connected = self.channel.take().is_some();
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.generation += 1;
        was_connected
    }

    /// Interest the readiness watcher should wait for.
    pub(crate) fn interest(&self) -> Interest {
        if self.has_pending_writes() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        }
    }

    pub(crate) fn rearm(&self) {
        if let Some(channel) = &self.channel {
            channel.rearm(self.interest());
        }
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.wbuf.is_empty() || !self.write_q.is_empty()
    }

    pub(crate) fn write_queue_len(&self) -> usize {
        self.write_q.len() + self.writing.len()
    }

    pub(crate) fn read_queue_len(&self) -> usize {
        self.read_q.len()
    }

    /// Promote submitted operations to the write queue. Only done while
    /// connected; a disconnected node keeps them in its input queue.
    pub(crate) fn copy_input_queue(&mut self) -> usize {
        if !self.is_connected() {
            return 0;
        }
        let mut moved = 0;
        while let Some(op) = self.handle.pop_input() {
            if op.state().is_terminal() {
                continue;
            }
            self.write_q.push_back(op);
            moved += 1;
        }
        moved
    }

    /// Encode queued operations into the write buffer.
    ///
    /// Stops at the buffer size, except that with `optimize` a run of
    /// batchable requests is kept together in one write.
    pub(crate) fn fill_write_buffer(&mut self, optimize: bool) {
        let mut batching = false;
        while let Some(next) = self.write_q.front() {
            let full = self.wbuf.len() >= self.read_buffer_size;
            if full && !(optimize && batching && next.is_batchable()) {
                break;
            }
            let Some(op) = self.write_q.pop_front() else {
                break;
            };
            // Cancelled before any byte was produced: drop it here.
            if !op.transition(OpState::Writing) {
                continue;
            }
            let before = self.wbuf.len();
            op.request().encode(&mut self.wbuf);
            batching = op.is_batchable();
            self.writing.push_back((op, self.wbuf.len() - before));
        }
    }

    /// Account `sent` bytes; operations fully on the wire await responses.
    fn advance_written(&mut self, mut sent: usize) {
        while let Some((_, remaining)) = self.writing.front_mut() {
            if *remaining > sent {
                *remaining -= sent;
                return;
            }
            sent -= *remaining;
            if let Some((op, _)) = self.writing.pop_front() {
                // A cancelled operation still gets a response to discard.
                op.transition(OpState::Reading);
                self.read_q.push_back(op);
            }
        }
    }

    /// Write as much as the socket takes without blocking.
    pub(crate) fn write_some(&mut self, optimize: bool) -> io::Result<usize> {
        let mut total = 0;
        loop {
            self.fill_write_buffer(optimize);
            if self.wbuf.is_empty() {
                break;
            }
            let Some(channel) = &self.channel else {
                break;
            };
            match channel.stream().try_write(&self.wbuf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "socket closed while writing"))
                }
                Ok(n) => {
                    self.wbuf.advance(n);
                    self.advance_written(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        self.advance_written(0);
        Ok(total)
    }

    /// One non-blocking read into the read buffer. `Ok(0)` means no data.
    pub(crate) fn read_some(&mut self) -> io::Result<usize> {
        let Some(channel) = &self.channel else {
            return Ok(0);
        };
        self.rbuf.reserve(self.read_buffer_size);
        match channel.stream().try_read_buf(&mut self.rbuf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn is_version_op(&self, op: &Arc<Operation>) -> bool {
        self.version_op.as_ref().is_some_and(|v| Arc::ptr_eq(v, op))
    }

    /// Feed buffered response bytes to the head of the read queue.
    ///
    /// Responses arrive in write order, so the head is always the operation
    /// the bytes belong to. Bytes with nothing awaiting them, or bytes the
    /// head cannot decode, mean the stream lost its framing.
    pub(crate) fn process_reads(&mut self) -> Result<Vec<ReadEvent>> {
        let mut events = Vec::new();
        while !self.rbuf.is_empty() {
            let Some(op) = self.read_q.front().cloned() else {
                return Err(ConnectionError::Protocol(format!(
                    "{} unexpected bytes from {}",
                    self.rbuf.len(),
                    self.addr()
                )));
            };
            let decoded = op.request().decode(&mut self.rbuf);
            let decoded = match decoded {
                Ok(Decoded::Incomplete) => break,
                Ok(decoded) => decoded,
                Err(err) => {
                    self.read_q.pop_front();
                    let message = match err {
                        ConnectionError::Protocol(message) => message,
                        other => other.to_string(),
                    };
                    op.fail(ConnectionError::Protocol(message.clone()));
                    return Err(ConnectionError::Protocol(message));
                }
            };
            self.read_q.pop_front();
            // A late answer to an operation the caller gave up on does not
            // break a run of timeouts.
            if !op.state().is_terminal() {
                self.timeouts.record_success();
            }
            match decoded {
                Decoded::Complete(frame) if self.is_version_op(&op) => {
                    self.version_op = None;
                    let version = String::from_utf8_lossy(&frame).trim().to_string();
                    self.handle.set_version(Some(version.clone()));
                    op.complete(frame);
                    events.push(ReadEvent::Version(version));
                }
                Decoded::Complete(frame) => {
                    if op.complete(frame) {
                        events.push(ReadEvent::Completed);
                    }
                }
                Decoded::Redirect => events.push(ReadEvent::Redirect(op)),
                Decoded::Switchover => events.push(ReadEvent::Switchover(op)),
                Decoded::Incomplete => {}
            }
        }
        Ok(events)
    }

    /// Whether the handshake should be (re)issued.
    pub(crate) fn needs_version(&self) -> bool {
        self.is_connected() && self.version_op.is_none() && self.handle.version().is_none()
    }

    /// Put the handshake at the head of the write queue.
    pub(crate) fn issue_version(&mut self, op: Arc<Operation>) {
        op.set_handling_node(Some(self.id()));
        self.write_q.push_front(Arc::clone(&op));
        self.version_op = Some(op);
    }

    /// Prepare the queues for a new connection after the old one failed.
    ///
    /// Operations that were in flight go back to the head of the write queue
    /// in their original order, except non-idempotent ones whose request
    /// reached the server: they may have been applied and are cancelled. The
    /// handshake is dropped; a new one is issued after reconnecting.
    pub(crate) fn setup_resend(&mut self) {
        let addr = self.handle.addr.clone();
        let version_op = self.version_op.take();
        let is_version = |op: &Arc<Operation>| version_op.as_ref().is_some_and(|v| Arc::ptr_eq(v, op));

        let mut resend = Vec::with_capacity(self.read_q.len() + self.writing.len());
        for op in self.read_q.drain(..) {
            if is_version(&op) {
                continue;
            }
            if !op.is_idempotent() {
                op.cancel(CancelCause::NotReplayable { node: addr.clone() });
                continue;
            }
            resend.push(op);
        }
        resend.extend(self.writing.drain(..).map(|(op, _)| op));
        self.write_q.retain(|op| !is_version(op));

        for op in resend.into_iter().rev() {
            if !is_version(&op) && op.reset() {
                self.write_q.push_front(op);
            }
        }
        self.rbuf.clear();
        self.wbuf.clear();
        self.handle.set_version(None);
    }

    fn live(&self, op: &Arc<Operation>) -> bool {
        !op.state().is_terminal() && !self.is_version_op(op)
    }

    /// Remove everything still in the input queue.
    pub(crate) fn destroy_input_queue(&mut self) -> Vec<Arc<Operation>> {
        let mut ops = Vec::new();
        while let Some(op) = self.handle.pop_input() {
            if self.live(&op) {
                ops.push(op);
            }
        }
        ops
    }

    /// Remove everything not yet fully written.
    pub(crate) fn destroy_write_queue(&mut self) -> Vec<Arc<Operation>> {
        let writing: Vec<Arc<Operation>> = self.writing.drain(..).map(|(op, _)| op).collect();
        let queued: Vec<Arc<Operation>> = self.write_q.drain(..).collect();
        self.wbuf.clear();
        writing
            .into_iter()
            .chain(queued)
            .filter(|op| self.live(op))
            .collect()
    }

    /// Remove everything awaiting a response.
    pub(crate) fn destroy_read_queue(&mut self) -> Vec<Arc<Operation>> {
        let ops: Vec<Arc<Operation>> = self.read_q.drain(..).collect();
        self.rbuf.clear();
        ops.into_iter().filter(|op| self.live(op)).collect()
    }

    /// Every queued operation, in the order it would have been served.
    pub(crate) fn destroy_all_queues(&mut self) -> Vec<Arc<Operation>> {
        let mut ops = self.destroy_read_queue();
        ops.extend(self.destroy_write_queue());
        ops.extend(self.destroy_input_queue());
        self.version_op = None;
        ops
    }

    /// Take this node's operations for another node of the same group.
    ///
    /// Operations already sent are replayed on the new node; with
    /// `cancel_non_idempotent` the non-idempotent ones among them are
    /// cancelled instead.
    pub(crate) fn move_operations(&mut self, cancel_non_idempotent: bool) -> Vec<Arc<Operation>> {
        let addr = self.handle.addr.clone();
        let mut moved = Vec::new();
        for op in self.destroy_read_queue() {
            if cancel_non_idempotent && !op.is_idempotent() {
                op.cancel(CancelCause::NotReplayable { node: addr.clone() });
            } else {
                moved.push(op);
            }
        }
        moved.extend(self.destroy_write_queue());
        moved.extend(self.destroy_input_queue());
        moved.retain(|op| op.reset());
        moved
    }

    /// Queue operations taken from another node behind this node's own.
    pub(crate) fn adopt_operations(&mut self, ops: Vec<Arc<Operation>>) {
        for op in ops {
            op.set_handling_node(Some(self.id()));
            self.write_q.push_back(op);
        }
    }
}

impl fmt::Debug for MemcachedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemcachedNode")
            .field("addr", &self.handle.addr)
            .field("connected", &self.is_connected())
            .field("write_q", &self.write_queue_len())
            .field("read_q", &self.read_q.len())
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish()
    }
}
