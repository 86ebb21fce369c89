//! Engine configuration.
//!
//! All fields have defaults, so a TOML document only needs to name what it
//! changes:
//!
//! ```toml
//! failure_mode = "cancel"
//! max_reconnect_delay_secs = 10
//! read_priority = "slave"
//! ```

use std::path::Path;
use std::time::Duration;

use corelib::HashAlgorithm;
use replication::ReadPriority;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectionError, Result};

/// What happens to a failed node's queued operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Cancel them; callers see a cancellation.
    Cancel,
    /// Re-route them to whichever node now owns their keys.
    #[default]
    Redistribute,
    /// Keep them queued and send them after the node reconnects.
    Retry,
}

/// Limits that force a reconnect of a node whose socket looks healthy but
/// whose operations keep timing out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutThresholds {
    /// Continuous timeouts tolerated (0 disables).
    pub continuous: u32,
    /// Percentage of timeouts in the sliding window tolerated (0 disables).
    pub ratio_percent: u32,
    /// How long timeouts may persist without a success (zero disables).
    pub duration: Duration,
}

/// Options applied to every new socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketOptions {
    pub tcp_nodelay: bool,
    pub keep_alive: bool,
    pub connect_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub failure_mode: FailureMode,
    /// Ceiling of the exponential reconnect backoff, in seconds.
    pub max_reconnect_delay_secs: u64,
    pub timeout_exception_threshold: u32,
    pub timeout_ratio_threshold: u32,
    pub timeout_duration_threshold_ms: u64,
    pub read_buffer_size: usize,
    pub optimize_gets: bool,
    pub tcp_nodelay: bool,
    pub keep_alive: bool,
    /// Default wait used by [`OperationFuture::get`](crate::OperationFuture::get).
    pub op_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_queue_len: usize,
    pub read_priority: ReadPriority,
    pub vnodes_per_node: usize,
    pub hash: HashAlgorithm,
    pub delayed_switchover_ms: u64,
    pub max_redirects: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::Redistribute,
            max_reconnect_delay_secs: 30,
            timeout_exception_threshold: 10,
            timeout_ratio_threshold: 0,
            timeout_duration_threshold_ms: 0,
            read_buffer_size: 16 * 1024,
            optimize_gets: true,
            tcp_nodelay: true,
            keep_alive: false,
            op_timeout_ms: 2500,
            connect_timeout_ms: 5000,
            max_queue_len: 16384,
            read_priority: ReadPriority::Master,
            vnodes_per_node: corelib::ring::DEFAULT_VNODES,
            hash: HashAlgorithm::Sip13,
            delayed_switchover_ms: 50,
            max_redirects: 5,
        }
    }
}

impl ConnectionConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ConnectionConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_reconnect_delay_secs == 0 {
            return Err(ConnectionError::Config(
                "max_reconnect_delay_secs must be at least 1".into(),
            ));
        }
        if self.timeout_ratio_threshold > 99 {
            return Err(ConnectionError::Config(format!(
                "timeout_ratio_threshold must be within 0..=99, got {}",
                self.timeout_ratio_threshold
            )));
        }
        if self.read_buffer_size == 0 {
            return Err(ConnectionError::Config("read_buffer_size must be positive".into()));
        }
        if self.max_queue_len == 0 {
            return Err(ConnectionError::Config("max_queue_len must be positive".into()));
        }
        if self.vnodes_per_node == 0 {
            return Err(ConnectionError::Config("vnodes_per_node must be positive".into()));
        }
        if self.op_timeout_ms == 0 {
            return Err(ConnectionError::Config("op_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay_secs = delay.as_secs().max(1);
        self
    }

    pub fn with_timeout_exception_threshold(mut self, threshold: u32) -> Self {
        self.timeout_exception_threshold = threshold;
        self
    }

    pub fn with_timeout_ratio_threshold(mut self, percent: u32) -> Self {
        self.timeout_ratio_threshold = percent;
        self
    }

    pub fn with_timeout_duration_threshold(mut self, duration: Duration) -> Self {
        self.timeout_duration_threshold_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_read_priority(mut self, priority: ReadPriority) -> Self {
        self.read_priority = priority;
        self
    }

    pub fn with_vnodes(mut self, vnodes: usize) -> Self {
        self.vnodes_per_node = vnodes;
        self
    }

    pub fn with_max_queue_len(mut self, len: usize) -> Self {
        self.max_queue_len = len;
        self
    }

    pub fn with_delayed_switchover(mut self, delay: Duration) -> Self {
        self.delayed_switchover_ms = delay.as_millis() as u64;
        self
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn delayed_switchover(&self) -> Duration {
        Duration::from_millis(self.delayed_switchover_ms)
    }

    pub fn thresholds(&self) -> TimeoutThresholds {
        TimeoutThresholds {
            continuous: self.timeout_exception_threshold,
            ratio_percent: self.timeout_ratio_threshold,
            duration: Duration::from_millis(self.timeout_duration_threshold_ms),
        }
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            tcp_nodelay: self.tcp_nodelay,
            keep_alive: self.keep_alive,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    /// An empty ring using the configured hash and vnode count.
    pub fn empty_ring(&self) -> corelib::HashRing {
        corelib::HashRing::with_partitioner(self.hash.partitioner(), self.vnodes_per_node)
    }
}
