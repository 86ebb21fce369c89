//! The connection engine.
//!
//! A [`MemcachedConnection`] owns one I/O thread that runs the event loop
//! (see `event_loop`). Callers never touch a socket: they append to a node's
//! input queue, swap in a pending topology or post a [`Command`], then wake
//! the loop. Everything else, from promotion of queued work to reconnects and
//! every ring change, happens on the I/O thread.

pub(crate) mod event_loop;
pub(crate) mod selector;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use corelib::{MigrationKind, NodeId, RingToken};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use replication::Intent;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, FailureMode};
use crate::error::{CancelCause, ConnectionError, Result};
use crate::node::{NodeHandle, NodeStatus};
use crate::observer::ConnectionObserver;
use crate::operation::future::TimeoutNotices;
use crate::operation::{DefaultFactory, Operation, OperationFactory, OperationFuture, Request};
use crate::topology::{
    BasicStrategy, MigrationStrategy, NodeSpec, ReplicaStrategy, TopologyStrategy,
};

use self::event_loop::Engine;

/// How often a caller waiting on a [`Command`] checks for shutdown.
const COMMAND_POLL: Duration = Duration::from_millis(50);

/// Migration control, run on the I/O thread so that it is ordered with
/// redirects and topology changes. Each carries the channel its answer is
/// sent on.
pub(crate) enum Command {
    BeginMigration {
        kind: MigrationKind,
        nodes: Vec<NodeSpec>,
        reply: Sender<Result<()>>,
    },
    MigrationProgress {
        range: RingToken,
        boundary: RingToken,
        reply: Sender<bool>,
    },
    FinishMigration {
        reply: Sender<bool>,
    },
}

/// State shared between callers and the I/O thread.
pub(crate) struct Shared {
    pub(crate) config: ConnectionConfig,
    pub(crate) strategy: Box<dyn TopologyStrategy>,
    pub(crate) factory: Arc<dyn OperationFactory>,
    pub(crate) handles: DashMap<NodeId, Arc<NodeHandle>>,
    /// Nodes with newly submitted work.
    pub(crate) added: SegQueue<Arc<NodeHandle>>,
    pub(crate) notices: Arc<TimeoutNotices>,
    pub(crate) wakeup: Arc<Notify>,
    /// Latest topology not yet applied. Later calls overwrite it.
    pub(crate) pending_topology: Mutex<Option<Vec<NodeSpec>>>,
    pub(crate) commands: SegQueue<Command>,
    pub(crate) observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn wake(&self) {
        self.wakeup.notify_one();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn handle(&self, id: NodeId) -> Option<Arc<NodeHandle>> {
        self.handles.get(&id).map(|h| Arc::clone(h.value()))
    }

    /// Pick the node an access to `key` is queued on.
    fn route(&self, key: &[u8], intent: Intent) -> std::result::Result<Arc<NodeHandle>, CancelCause> {
        let mode = self.config.failure_mode;
        // The primary may be dropped between the lookup and the handle
        // fetch; the second lookup sees the new ring.
        for _ in 0..2 {
            let Some(primary) = self.strategy.primary(key, intent) else {
                return Err(CancelCause::NoNode);
            };
            let Some(handle) = self.handle(primary).filter(|h| !h.is_removed()) else {
                continue;
            };
            if handle.is_usable() || mode == FailureMode::Retry {
                return Ok(handle);
            }
            if mode == FailureMode::Cancel {
                return Err(CancelCause::NodeInactive {
                    node: handle.addr.clone(),
                });
            }
            let fallback = self
                .strategy
                .sequence(key, intent)
                .into_iter()
                .skip(1)
                .filter_map(|id| self.handle(id))
                .find(|h| h.is_usable());
            return Ok(fallback.unwrap_or(handle));
        }
        Err(CancelCause::NoNode)
    }

    /// Queue `op` on the node `key` routes to and wake the I/O thread.
    ///
    /// Routing failures cancel the operation; only a full input queue is
    /// returned as an error.
    pub(crate) fn dispatch(&self, key: &[u8], op: Arc<Operation>) -> Result<()> {
        let handle = match self.route(key, op.intent()) {
            Ok(handle) => handle,
            Err(cause) => {
                warn!(cause = %cause, "operation cancelled before dispatch");
                counter!("memcached.ops.cancelled").increment(1);
                op.cancel(cause);
                return Ok(());
            }
        };
        self.enqueue(handle, op)
    }

    /// Append `op` to the input queue of `handle` and wake the I/O thread.
    pub(crate) fn enqueue(&self, handle: Arc<NodeHandle>, op: Arc<Operation>) -> Result<()> {
        handle.add_op_to_input_queue(op, self.config.max_queue_len)?;
        if self.is_shut_down() {
            // The I/O thread may have drained its queues already.
            let mut cancelled = 0usize;
            while let Some(op) = handle.pop_input() {
                if op.cancel(CancelCause::Shutdown) {
                    cancelled += 1;
                }
            }
            debug!(node = %handle.addr, cancelled, "submitted after shutdown");
            return Ok(());
        }
        self.added.push(handle);
        self.wake();
        Ok(())
    }
}

/// Builder for [`MemcachedConnection`].
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    servers: Vec<NodeSpec>,
    strategy: Option<Box<dyn TopologyStrategy>>,
    migration: bool,
    factory: Arc<dyn OperationFactory>,
    observers: Vec<Arc<dyn ConnectionObserver>>,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            servers: Vec::new(),
            strategy: None,
            migration: false,
            factory: Arc::new(DefaultFactory),
            observers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_servers(mut self, servers: Vec<NodeSpec>) -> Self {
        self.servers = servers;
        self
    }

    /// Use a custom strategy instead of the one picked from the server list.
    pub fn with_strategy(mut self, strategy: Box<dyn TopologyStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Route through a migration-capable locator.
    pub fn with_migration(mut self) -> Self {
        self.migration = true;
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn OperationFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    fn pick_strategy(&self) -> Box<dyn TopologyStrategy> {
        let ring = self.config.empty_ring();
        if self.servers.iter().any(|s| s.replica.is_some()) {
            Box::new(ReplicaStrategy::new(ring, self.config.read_priority))
        } else if self.migration {
            Box::new(MigrationStrategy::new(ring))
        } else {
            Box::new(BasicStrategy::new(ring))
        }
    }

    /// Install the initial topology and start the I/O thread.
    ///
    /// Connections are opened asynchronously; operations submitted before a
    /// node is connected wait in its queue.
    pub fn build(mut self) -> Result<MemcachedConnection> {
        self.config.validate()?;
        let strategy = match self.strategy.take() {
            Some(strategy) => strategy,
            None => self.pick_strategy(),
        };
        let plan = strategy.plan(&self.servers)?;
        strategy.install(&plan)?;

        let wakeup = Arc::new(Notify::new());
        let shared = Arc::new(Shared {
            config: self.config,
            strategy,
            factory: self.factory,
            handles: DashMap::new(),
            added: SegQueue::new(),
            notices: Arc::new(TimeoutNotices::new(Arc::clone(&wakeup))),
            wakeup,
            pending_topology: Mutex::new(None),
            commands: SegQueue::new(),
            observers: RwLock::new(self.observers),
            shutdown: AtomicBool::new(false),
        });
        let mut initial = Vec::with_capacity(plan.next.len());
        for spec in &plan.next {
            let handle = NodeHandle::new(spec);
            shared.handles.insert(handle.id, Arc::clone(&handle));
            initial.push((handle, plan.roles.get(&spec.id()).copied()));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let engine = Engine::new(Arc::clone(&shared), initial);
        let thread = std::thread::Builder::new()
            .name("memcached-io".into())
            .spawn(move || runtime.block_on(engine.run()))?;

        info!(
            strategy = shared.strategy.name(),
            servers = plan.next.len(),
            "connection started"
        );
        Ok(MemcachedConnection {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Client connection to a cluster of cache servers.
///
/// All methods are safe to call from any thread. Migration control waits for
/// the I/O thread to run it and [`shutdown`](Self::shutdown) joins that
/// thread; nothing else blocks on it.
pub struct MemcachedConnection {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MemcachedConnection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn strategy(&self) -> &dyn TopologyStrategy {
        self.shared.strategy.as_ref()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.is_shut_down() {
            return Err(ConnectionError::Shutdown);
        }
        Ok(())
    }

    fn on_io_thread(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|t| t.thread().id() == std::thread::current().id())
    }

    /// Post a command to the I/O thread and wait for its answer.
    fn call<T>(&self, command: impl FnOnce(Sender<T>) -> Command) -> Result<T> {
        self.ensure_running()?;
        if self.on_io_thread() {
            return Err(ConnectionError::Topology(
                "migration control cannot run on the I/O thread".into(),
            ));
        }
        let (tx, rx) = channel::bounded(1);
        self.shared.commands.push(command(tx));
        self.shared.wake();
        loop {
            match rx.recv_timeout(COMMAND_POLL) {
                Ok(answer) => return Ok(answer),
                Err(RecvTimeoutError::Timeout) if !self.shared.is_shut_down() => {}
                Err(_) => return Err(ConnectionError::Shutdown),
            }
        }
    }

    fn future_for(&self, op: Arc<Operation>, rx: tokio::sync::oneshot::Receiver<Result<bytes::Bytes>>) -> OperationFuture {
        OperationFuture::new(
            op,
            rx,
            Arc::clone(&self.shared.notices),
            self.shared.config.op_timeout(),
        )
    }

    /// Submit `request`, routed by `key`.
    ///
    /// When no node can take the operation it is cancelled and the returned
    /// future resolves to the cancellation. A full input queue is reported
    /// here as [`ConnectionError::QueueFull`].
    pub fn add_operation(&self, key: impl AsRef<[u8]>, request: Box<dyn Request>) -> Result<OperationFuture> {
        self.ensure_running()?;
        let (op, rx) = Operation::new(request);
        self.shared.dispatch(key.as_ref(), Arc::clone(&op))?;
        counter!("memcached.ops.submitted").increment(1);
        Ok(self.future_for(op, rx))
    }

    /// Submit one request per active node, e.g. for stats or flush.
    pub fn broadcast<F>(&self, mut make: F) -> Result<Vec<(String, Result<OperationFuture>)>>
    where
        F: FnMut() -> Box<dyn Request>,
    {
        self.ensure_running()?;
        let handles: Vec<Arc<NodeHandle>> = self
            .shared
            .handles
            .iter()
            .map(|h| Arc::clone(h.value()))
            .filter(|h| h.state() == crate::node::NodeState::Active)
            .collect();
        let mut futures = Vec::with_capacity(handles.len());
        for handle in handles {
            let (op, rx) = Operation::new(make());
            let addr = handle.addr.clone();
            let submitted = self
                .shared
                .enqueue(handle, Arc::clone(&op))
                .map(|()| self.future_for(op, rx));
            futures.push((addr, submitted));
        }
        debug!(nodes = futures.len(), "broadcast submitted");
        Ok(futures)
    }

    /// Replace the server list. Applied asynchronously by the I/O thread;
    /// only the latest pending list is kept.
    pub fn set_topology(&self, servers: Vec<NodeSpec>) -> Result<()> {
        self.ensure_running()?;
        self.shared.strategy.plan(&servers)?;
        *self.shared.pending_topology.lock() = Some(servers);
        self.shared.wake();
        Ok(())
    }

    /// Start a live migration of `nodes` into (`Join`) or out of (`Leave`)
    /// the ring. Joining servers are connected before this returns.
    ///
    /// Must not be called from an observer.
    pub fn begin_migration(&self, kind: MigrationKind, nodes: Vec<NodeSpec>) -> Result<()> {
        self.call(|reply| Command::BeginMigration { kind, nodes, reply })?
    }

    /// Record that keys of `range` are migrated up to `boundary`. Returns
    /// `false` when nothing is migrating.
    pub fn migration_progress(&self, range: RingToken, boundary: RingToken) -> Result<bool> {
        self.call(|reply| Command::MigrationProgress {
            range,
            boundary,
            reply,
        })
    }

    /// Make the migrated ring the base ring and tear down servers that left.
    /// Returns `false` when nothing was migrating.
    pub fn finish_migration(&self) -> Result<bool> {
        self.call(|reply| Command::FinishMigration { reply })
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.shared.observers.write().push(observer);
    }

    /// Returns whether the observer was registered.
    pub fn remove_observer(&self, observer: &Arc<dyn ConnectionObserver>) -> bool {
        let mut observers = self.shared.observers.write();
        let before = observers.len();
        observers.retain(|o| !std::ptr::addr_eq(Arc::as_ptr(o), Arc::as_ptr(observer)));
        observers.len() != before
    }

    /// Status of every node, by address.
    pub fn nodes(&self) -> Vec<NodeStatus> {
        let statuses: BTreeMap<String, NodeStatus> = self
            .shared
            .handles
            .iter()
            .map(|h| (h.addr.clone(), h.status()))
            .collect();
        statuses.into_values().collect()
    }

    /// Address of the node `key` currently resolves to.
    pub fn primary_addr(&self, key: impl AsRef<[u8]>, intent: Intent) -> Option<String> {
        let id = self.shared.strategy.primary(key.as_ref(), intent)?;
        self.shared.handle(id).map(|h| h.addr.clone())
    }

    /// Stop the I/O thread and cancel every queued operation.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.wake();
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        // An observer may call shutdown from the I/O thread itself.
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!("I/O thread panicked");
        }
    }
}

impl Drop for MemcachedConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for MemcachedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemcachedConnection")
            .field("strategy", &self.shared.strategy)
            .field("nodes", &self.shared.handles.len())
            .field("shutdown", &self.shared.is_shut_down())
            .finish()
    }
}
