//! The I/O thread.
//!
//! Each pass of [`Engine::run`] does, in order: handshakes, timeout
//! notices, commands and newly submitted work, one wait for socket events
//! (bounded by the next reconnect or switchover deadline), the events
//! themselves, the timeout thresholds, due switchovers, a pending topology
//! and finally due reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use corelib::{MigrationKind, NodeId};
use metrics::counter;
use replication::ReplicaRole;
use tokio::io::Ready;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::selector::{spawn_connect, Channel, EventSender, IoEvent};
use super::{Command, Shared};
use crate::config::FailureMode;
use crate::error::{CancelCause, ConnectionError, Result};
use crate::node::{MemcachedNode, NodeHandle, NodeState, ReadEvent};
use crate::operation::{Completion, FanIn, Operation};
use crate::reconnect::{backoff_delay, ReconnectQueue};
use crate::topology::{NodeSpec, ReplicaTask, TopologyPlan};

/// Longest single wait when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(1);
/// Wait used while a topology change or command is pending.
const PENDING_CHANGE_WAIT: Duration = Duration::from_millis(1);
/// Consecutive idle wake-ups before channels are checked for a lost watcher.
const EMPTY_SELECT_CHECK: u32 = 256;
/// Consecutive idle wake-ups treated as a broken loop.
const EMPTY_SELECT_FATAL: u32 = 1 << 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reconnect {
    Backoff,
    /// Planned disconnects, e.g. a role change; no backoff.
    Immediate,
}

enum Wake {
    Notified,
    Event(IoEvent),
    Timer,
}

/// Operations answered with a switchover notice, held until the group's
/// new master is known.
struct DelayedSwitchover {
    deadline: Instant,
    parked: Vec<Arc<Operation>>,
}

pub(crate) struct Engine {
    shared: Arc<Shared>,
    nodes: HashMap<NodeId, MemcachedNode>,
    reconnects: ReconnectQueue,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<IoEvent>,
    switchovers: HashMap<String, DelayedSwitchover>,
    empty_selects: u32,
}

impl Engine {
    pub(crate) fn new(shared: Arc<Shared>, initial: Vec<(Arc<NodeHandle>, Option<ReplicaRole>)>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut engine = Self {
            shared,
            nodes: HashMap::new(),
            reconnects: ReconnectQueue::new(),
            events_tx,
            events_rx,
            switchovers: HashMap::new(),
            empty_selects: 0,
        };
        for (handle, role) in initial {
            engine.adopt(handle, role);
        }
        engine
    }

    pub(crate) async fn run(mut self) {
        info!(
            strategy = self.shared.strategy.name(),
            nodes = self.nodes.len(),
            "I/O loop started"
        );
        while !self.shared.is_shut_down() {
            self.handle_io().await;
        }
        self.shutdown_all();
    }

    async fn handle_io(&mut self) {
        self.issue_handshakes();
        let mut busy = self.drain_timeout_notices();
        busy |= self.run_commands();
        busy |= self.handle_added_queue();

        let timeout = self.select_timeout(Instant::now());
        let wake = tokio::select! {
            biased;
            Some(event) = self.events_rx.recv() => Wake::Event(event),
            _ = self.shared.wakeup.notified() => Wake::Notified,
            _ = tokio::time::sleep(timeout) => Wake::Timer,
        };

        let mut events = Vec::new();
        let timer = matches!(wake, Wake::Timer);
        if let Wake::Event(event) = wake {
            events.push(event);
        }
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        busy |= !events.is_empty();
        for event in events {
            self.handle_event(event);
        }

        if busy || timer || self.has_queued_work() {
            self.empty_selects = 0;
        } else {
            self.count_empty_select();
        }

        let now = Instant::now();
        self.check_timeout_thresholds(now);
        self.run_due_switchovers(now);
        self.apply_pending_topology();
        self.attempt_reconnects(Instant::now());
    }

    fn has_pending_changes(&self) -> bool {
        self.shared.pending_topology.lock().is_some() || !self.shared.commands.is_empty()
    }

    /// Work callers queued since the start of this pass.
    fn has_queued_work(&self) -> bool {
        !self.shared.added.is_empty()
            || !self.shared.notices.is_empty()
            || self.has_pending_changes()
            || self.shared.is_shut_down()
    }

    fn select_timeout(&self, now: Instant) -> Duration {
        if self.has_pending_changes() {
            return PENDING_CHANGE_WAIT;
        }
        self.reconnects
            .next_deadline()
            .into_iter()
            .chain(self.switchovers.values().map(|s| s.deadline))
            .min()
            .map_or(IDLE_WAIT, |deadline| {
                deadline.saturating_duration_since(now).min(IDLE_WAIT)
            })
    }

    fn count_empty_select(&mut self) {
        self.empty_selects += 1;
        if self.empty_selects > EMPTY_SELECT_FATAL {
            error!(wakeups = self.empty_selects, "I/O loop is spinning");
            panic!("I/O loop woke {} times without work", self.empty_selects);
        }
        if self.empty_selects > EMPTY_SELECT_CHECK {
            self.check_channels();
        }
    }

    /// Re-arm channels that lost write interest and reconnect those whose
    /// watcher is gone.
    fn check_channels(&mut self) {
        let mut stuck = Vec::new();
        for node in self.nodes.values() {
            let Some(channel) = node.channel() else {
                continue;
            };
            if !channel.is_watched() {
                stuck.push(node.id());
            } else if node.has_pending_writes() && !channel.interest().is_writable() {
                debug!(node = %node.addr(), "re-arming write interest");
                node.rearm();
            }
        }
        for id in stuck {
            self.lost_connection(id, "socket no longer polled".into(), Reconnect::Immediate);
        }
        self.empty_selects = 0;
    }

    fn adopt(&mut self, handle: Arc<NodeHandle>, role: Option<ReplicaRole>) {
        let id = handle.id;
        if self.nodes.get(&id).is_some_and(|n| Arc::ptr_eq(n.handle(), &handle)) {
            return;
        }
        debug!(node = %handle.addr, ?role, "node added");
        self.shared.handles.insert(id, Arc::clone(&handle));
        self.nodes.insert(
            id,
            MemcachedNode::new(handle, role, self.shared.config.read_buffer_size),
        );
        self.reconnects.schedule(id, Instant::now());
    }

    fn issue_handshake(&mut self, id: NodeId) {
        let max = self.shared.config.max_queue_len;
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if !node.needs_version() || node.write_queue_len() >= max {
            return;
        }
        let Some(request) = self.shared.factory.version() else {
            return;
        };
        node.issue_version(Operation::internal(request));
        self.write_node(id);
    }

    fn issue_handshakes(&mut self) {
        let ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.needs_version())
            .map(MemcachedNode::id)
            .collect();
        for id in ids {
            self.issue_handshake(id);
        }
    }

    fn drain_timeout_notices(&mut self) -> bool {
        let now = Instant::now();
        let mut drained = false;
        while let Some(op) = self.shared.notices.pop() {
            drained = true;
            counter!("memcached.ops.timed_out").increment(1);
            // A re-routed operation is charged to the nodes serving its copies.
            let mut charged: Vec<NodeId> = Vec::new();
            for id in op.leaves().iter().filter_map(|leaf| leaf.handling_node()) {
                if charged.contains(&id) {
                    continue;
                }
                charged.push(id);
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.timeouts.record_timeout(now);
                    trace!(node = %node.addr(), continuous = node.timeouts.continuous(), "operation timed out");
                }
            }
        }
        drained
    }

    fn run_commands(&mut self) -> bool {
        let mut ran = false;
        while let Some(command) = self.shared.commands.pop() {
            ran = true;
            // A caller that gave up waiting has dropped its receiver.
            match command {
                Command::BeginMigration { kind, nodes, reply } => {
                    let _ = reply.send(self.begin_migration(kind, &nodes));
                }
                Command::MigrationProgress {
                    range,
                    boundary,
                    reply,
                } => {
                    let _ = reply.send(self.shared.strategy.migration_progress(range, boundary));
                }
                Command::FinishMigration { reply } => {
                    let _ = reply.send(self.finish_migration());
                }
            }
        }
        ran
    }

    fn begin_migration(&mut self, kind: MigrationKind, nodes: &[NodeSpec]) -> Result<()> {
        let change = self.shared.strategy.begin_migration(kind, nodes)?;
        for spec in &change.connect {
            self.adopt(NodeHandle::new(spec), spec.role());
        }
        Ok(())
    }

    fn finish_migration(&mut self) -> bool {
        let Some(change) = self.shared.strategy.finish_migration() else {
            return false;
        };
        for spec in &change.connect {
            self.adopt(NodeHandle::new(spec), spec.role());
        }
        for id in change.teardown {
            self.teardown(id);
        }
        true
    }

    /// Promote submitted operations on every node that received some.
    fn handle_added_queue(&mut self) -> bool {
        let mut touched: Vec<NodeId> = Vec::new();
        let mut any = false;
        while let Some(handle) = self.shared.added.pop() {
            any = true;
            let id = handle.id;
            let known = self
                .nodes
                .get(&id)
                .is_some_and(|n| Arc::ptr_eq(n.handle(), &handle));
            if known {
                if !touched.contains(&id) {
                    touched.push(id);
                }
            } else if handle.is_removed() {
                self.drain_removed_handle(&handle);
            } else {
                self.adopt(handle, None);
            }
        }
        for id in touched {
            if let Some(node) = self.nodes.get_mut(&id) {
                let moved = node.copy_input_queue();
                if moved > 0 {
                    trace!(node = %node.addr(), moved, "operations promoted");
                }
            }
            self.write_node(id);
        }
        any
    }

    /// Operations queued on a handle after its node was torn down.
    fn drain_removed_handle(&mut self, handle: &NodeHandle) {
        while let Some(op) = handle.pop_input() {
            if !op.state().is_terminal() {
                self.dispose_removed(op, &handle.addr);
            }
        }
    }

    fn handle_event(&mut self, event: IoEvent) {
        let (id, generation) = event.target();
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.generation() != generation {
            trace!(node = %node.addr(), generation, "stale event ignored");
            return;
        }
        match event {
            IoEvent::Connected { result: Ok(stream), .. } => self.connected(id, stream),
            IoEvent::Connected { result: Err(err), .. } => {
                self.lost_connection(id, err.to_string(), Reconnect::Backoff)
            }
            IoEvent::Ready { ready, .. } => self.handle_ready(id, ready),
            IoEvent::Failed { error, .. } => {
                self.lost_connection(id, error.to_string(), Reconnect::Backoff)
            }
        }
    }

    fn connected(&mut self, id: NodeId, stream: TcpStream) {
        let events = self.events_tx.clone();
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let channel = Channel::register(stream, id, node.generation(), node.interest(), events);
        node.attach(channel);
        let attempts = std::mem::take(&mut node.reconnect_attempts);
        let addr = node.addr().to_string();
        info!(node = %addr, attempts, "connected");
        counter!("memcached.connections.established").increment(1);

        let observers = self.shared.observers.read().clone();
        for observer in observers {
            observer.connection_established(&addr, attempts);
        }

        self.issue_handshake(id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.copy_input_queue();
        }
        self.write_node(id);
    }

    fn handle_ready(&mut self, id: NodeId, ready: Ready) {
        if (ready.is_readable() || ready.is_read_closed()) && !self.read_node(id) {
            return;
        }
        self.write_node(id);
    }

    /// Drain the socket and handle the decoded responses. Returns whether
    /// the connection survived.
    fn read_node(&mut self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        let mut outcome = Vec::new();
        let failure = loop {
            match node.read_some() {
                Ok(0) => break None,
                Ok(n) => {
                    trace!(node = %node.addr(), bytes = n, "read");
                    match node.process_reads() {
                        Ok(events) => outcome.extend(events),
                        Err(err) => break Some((err, Reconnect::Immediate)),
                    }
                }
                Err(err) => break Some((ConnectionError::Io(err), Reconnect::Backoff)),
            }
        };

        let mut completed = 0u64;
        for event in outcome {
            match event {
                ReadEvent::Completed => completed += 1,
                ReadEvent::Version(version) => {
                    if let Some(node) = self.nodes.get(&id) {
                        info!(node = %node.addr(), %version, "server version");
                    }
                }
                ReadEvent::Redirect(op) => self.redirect(op),
                ReadEvent::Switchover(op) => self.park_for_switchover(id, op),
            }
        }
        counter!("memcached.ops.completed").increment(completed);

        match failure {
            None => true,
            Some((err, reconnect)) => {
                if let ConnectionError::Protocol(message) = &err {
                    warn!(error = %message, "protocol error; resetting connection");
                }
                self.lost_connection(id, err.to_string(), reconnect);
                false
            }
        }
    }

    fn write_node(&mut self, id: NodeId) {
        let optimize = self.shared.config.optimize_gets;
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if !node.is_connected() {
            return;
        }
        match node.write_some(optimize) {
            Ok(written) => {
                if written > 0 {
                    trace!(node = %node.addr(), bytes = written, "wrote");
                }
                node.rearm();
            }
            Err(err) => self.lost_connection(id, err.to_string(), Reconnect::Backoff),
        }
    }

    /// Close the node's socket, apply the failure mode to its queues and
    /// schedule a reconnect.
    fn lost_connection(&mut self, id: NodeId, reason: String, reconnect: Reconnect) {
        let mode = self.shared.config.failure_mode;
        let max_delay = self.shared.config.max_reconnect_delay();
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let was_connected = node.disconnect();
        node.handle().set_state(NodeState::Reconnecting);
        node.setup_resend();
        let orphans = match mode {
            FailureMode::Retry => Vec::new(),
            FailureMode::Cancel | FailureMode::Redistribute => node.destroy_all_queues(),
        };
        let delay = match reconnect {
            Reconnect::Immediate => Duration::ZERO,
            Reconnect::Backoff => {
                node.reconnect_attempts += 1;
                backoff_delay(node.reconnect_attempts, max_delay)
            }
        };
        let attempt = node.reconnect_attempts;
        let addr = node.addr().to_string();
        self.reconnects.schedule(id, Instant::now() + delay);

        if was_connected {
            warn!(node = %addr, %reason, "connection lost");
            counter!("memcached.connections.lost").increment(1);
            let observers = self.shared.observers.read().clone();
            for observer in observers {
                observer.connection_lost(&addr);
            }
        } else {
            debug!(node = %addr, %reason, "connect failed");
        }
        info!(
            node = %addr,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        counter!("memcached.reconnects.scheduled").increment(1);

        for op in orphans {
            let cause = CancelCause::ConnectionLost {
                node: addr.clone(),
                reason: reason.clone(),
            };
            match mode {
                FailureMode::Cancel => {
                    op.cancel(cause);
                }
                _ => self.reroute(op, cause, 0),
            }
        }
    }

    /// Drop a node for good and dispose of its operations.
    fn teardown(&mut self, id: NodeId) {
        let Some(mut node) = self.nodes.remove(&id) else {
            return;
        };
        self.reconnects.remove(&id);
        let was_connected = node.disconnect();
        node.handle().set_state(NodeState::Removed);
        self.shared
            .handles
            .remove_if(&id, |_, handle| Arc::ptr_eq(handle, node.handle()));
        node.setup_resend();
        let ops = node.destroy_all_queues();
        let addr = node.addr().to_string();
        if was_connected {
            let observers = self.shared.observers.read().clone();
            for observer in observers {
                observer.connection_lost(&addr);
            }
        }
        info!(node = %addr, operations = ops.len(), "node removed");
        for op in ops {
            self.dispose_removed(op, &addr);
        }
    }

    fn dispose_removed(&mut self, op: Arc<Operation>, addr: &str) {
        let cause = CancelCause::NodeRemoved { node: addr.to_string() };
        match self.shared.config.failure_mode {
            FailureMode::Cancel => {
                op.cancel(cause);
            }
            FailureMode::Redistribute | FailureMode::Retry => self.reroute(op, cause, 0),
        }
    }

    /// Replace `op` by fresh per-key copies dispatched through the current
    /// ring. The copies inherit the caller's completion.
    fn reroute(&mut self, op: Arc<Operation>, cause: CancelCause, extra_hops: u32) {
        let hops = op.redirects() + extra_hops;
        if hops > self.shared.config.max_redirects {
            op.cancel(CancelCause::TooManyRedirects { hops });
            return;
        }
        if op.keys().is_empty() {
            op.cancel(cause);
            return;
        }
        let mut parts = {
            let request = op.request();
            self.shared.factory.clone_request(&**request)
        };
        if parts.is_empty() {
            op.cancel(CancelCause::NotRoutable);
            return;
        }
        let Some(completion) = op.supersede() else {
            return;
        };
        counter!("memcached.ops.redistributed").increment(1);

        let copies: Vec<Arc<Operation>> = if parts.len() == 1 {
            parts
                .pop()
                .map(|part| Operation::derived(part, completion, hops))
                .into_iter()
                .collect()
        } else {
            let fan_in = FanIn::new(completion, parts.len());
            parts
                .into_iter()
                .enumerate()
                .map(|(index, part)| {
                    let completion = Completion::Part {
                        fan_in: Arc::clone(&fan_in),
                        index,
                    };
                    Operation::derived(part, completion, hops)
                })
                .collect()
        };

        op.set_successors(copies.clone());
        for copy in copies {
            let Some(key) = copy.keys().first().cloned() else {
                copy.cancel(CancelCause::NotRoutable);
                continue;
            };
            if let Err(err) = self.shared.dispatch(&key, Arc::clone(&copy)) {
                let node = match err {
                    ConnectionError::QueueFull { node } => node,
                    other => other.to_string(),
                };
                copy.cancel(CancelCause::QueueOverflow { node });
            }
        }
    }

    /// The server answered that the key moved to the migration target.
    fn redirect(&mut self, op: Arc<Operation>) {
        if let Some(key) = op.keys().first() {
            if self.shared.strategy.redirect(key) {
                debug!("migrated range advanced by redirect");
            }
        }
        self.reroute(op, CancelCause::NotRoutable, 1);
    }

    fn park_for_switchover(&mut self, id: NodeId, op: Arc<Operation>) {
        let Some((group, _)) = self.shared.strategy.role_of(id) else {
            self.reroute(op, CancelCause::NotRoutable, 1);
            return;
        };
        if let Some(node) = self.nodes.get(&id) {
            debug!(node = %node.addr(), role = ?node.role(), %group, "operation parked for switchover");
        }
        let deadline = Instant::now() + self.shared.config.delayed_switchover();
        let entry = self
            .switchovers
            .entry(group)
            .or_insert_with(|| DelayedSwitchover {
                deadline,
                parked: Vec::new(),
            });
        entry.parked.push(op);
    }

    fn run_due_switchovers(&mut self, now: Instant) {
        let due: Vec<String> = self
            .switchovers
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(group, _)| group.clone())
            .collect();
        for group in due {
            let Some(entry) = self.switchovers.remove(&group) else {
                continue;
            };
            match self.shared.strategy.switchover(&group) {
                Some((old, new)) => {
                    info!(%group, parked = entry.parked.len(), "switching master locally");
                    self.set_role(old, ReplicaRole::Slave);
                    self.set_role(new, ReplicaRole::Master);
                    self.move_operations(old, new, false);
                }
                None => debug!(%group, "no slave to switch to"),
            }
            for op in entry.parked {
                self.reroute(op, CancelCause::NotRoutable, 1);
            }
        }
    }

    fn set_role(&mut self, id: NodeId, role: ReplicaRole) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.set_role(Some(role));
        }
    }

    /// Move every queued operation of `from` to `to`, same group.
    fn move_operations(&mut self, from: NodeId, to: NodeId, cancel_non_idempotent: bool) {
        let Some(source) = self.nodes.get_mut(&from) else {
            return;
        };
        // Responses for sent operations would arrive with nothing awaiting
        // them; the old socket has to go.
        let in_flight = source.is_connected() && source.read_queue_len() > 0;
        let ops = source.move_operations(cancel_non_idempotent);
        let moved = ops.len();
        let from_addr = source.addr().to_string();
        match self.nodes.get_mut(&to) {
            Some(target) => {
                info!(from = %from_addr, to = %target.addr(), moved, "operations moved");
                target.adopt_operations(ops);
            }
            None => {
                for op in ops {
                    self.reroute(op, CancelCause::NotRoutable, 0);
                }
            }
        }
        if in_flight {
            self.lost_connection(from, "master changed".into(), Reconnect::Immediate);
        }
        self.write_node(to);
    }

    fn check_timeout_thresholds(&mut self, now: Instant) {
        let thresholds = self.shared.config.thresholds();
        let breached: Vec<(NodeId, String)> = self
            .nodes
            .values()
            .filter(|n| n.is_connected())
            .filter_map(|n| n.timeouts.breach(&thresholds, now).map(|reason| (n.id(), reason)))
            .collect();
        for (id, reason) in breached {
            if let Some(node) = self.nodes.get(&id) {
                warn!(node = %node.addr(), %reason, "timeout threshold exceeded");
            }
            self.lost_connection(id, format!("too many timeouts: {}", reason), Reconnect::Backoff);
        }
    }

    fn apply_pending_topology(&mut self) {
        let Some(next) = self.shared.pending_topology.lock().take() else {
            return;
        };
        let plan = match self.shared.strategy.plan(&next) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "topology rejected");
                return;
            }
        };
        if plan.is_noop() {
            debug!("topology unchanged");
            return;
        }
        self.apply_plan(plan);
    }

    fn apply_plan(&mut self, plan: TopologyPlan) {
        for spec in &plan.added {
            let handle = NodeHandle::new(spec);
            self.adopt(handle, spec.role());
        }
        if let Err(err) = self.shared.strategy.install(&plan) {
            warn!(error = %err, "failed to install topology");
            for spec in &plan.added {
                self.teardown(spec.id());
            }
            return;
        }
        for task in &plan.tasks {
            match task {
                ReplicaTask::MoveOperations {
                    group,
                    from,
                    to,
                    cancel_non_idempotent,
                } => {
                    self.move_operations(*from, *to, *cancel_non_idempotent);
                    if let Some(entry) = self.switchovers.remove(group) {
                        for op in entry.parked {
                            self.reroute(op, CancelCause::NotRoutable, 1);
                        }
                    }
                }
            }
        }
        for id in &plan.removed {
            self.teardown(*id);
        }
        for (id, role) in &plan.roles {
            self.set_role(*id, *role);
        }
        info!(
            nodes = plan.next.len(),
            added = plan.added.len(),
            removed = plan.removed.len(),
            tasks = plan.tasks.len(),
            "topology applied"
        );
    }

    fn attempt_reconnects(&mut self, now: Instant) {
        let options = self.shared.config.socket_options();
        for id in self.reconnects.pop_due(now) {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if node.is_connected() {
                continue;
            }
            let generation = node.begin_connect();
            debug!(node = %node.addr(), attempt = node.reconnect_attempts, "connecting");
            let task = spawn_connect(
                id,
                generation,
                node.addr().to_string(),
                options,
                self.events_tx.clone(),
            );
            node.set_connect_task(task);
        }
    }

    fn shutdown_all(&mut self) {
        let mut cancelled = 0usize;
        for (_, mut node) in self.nodes.drain() {
            node.disconnect();
            node.handle().set_state(NodeState::Removed);
            for op in node.destroy_all_queues() {
                if op.cancel(CancelCause::Shutdown) {
                    cancelled += 1;
                }
            }
        }
        while let Some(handle) = self.shared.added.pop() {
            while let Some(op) = handle.pop_input() {
                if op.cancel(CancelCause::Shutdown) {
                    cancelled += 1;
                }
            }
        }
        for (_, entry) in self.switchovers.drain() {
            for op in entry.parked {
                if op.cancel(CancelCause::Shutdown) {
                    cancelled += 1;
                }
            }
        }
        self.shared.handles.clear();
        // Dropping the reply channels answers waiting callers.
        while self.shared.commands.pop().is_some() {}
        info!(cancelled, "I/O loop stopped");
    }
}
