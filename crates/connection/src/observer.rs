//! Connection observers.

/// Notified from the engine thread when a node's connection comes or goes.
///
/// Callbacks run inline on the I/O thread and must not block.
pub trait ConnectionObserver: Send + Sync {
    /// `reconnect_count` is the number of failed attempts before this one.
    fn connection_established(&self, node: &str, reconnect_count: u32);

    fn connection_lost(&self, node: &str);
}
