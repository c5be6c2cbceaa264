//! Server configuration types.

use std::time::Duration;

/// Top-level configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Per-connection settings.
    pub connection: ConnectionConfig,
    /// Upper bound on a single plain call. `None` means calls run until they
    /// finish or their connection closes.
    pub call_timeout: Option<Duration>,
}

/// Per-connection configuration controlling backpressure and draining.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity feeding the connection's writer task.
    pub outbound_channel_capacity: usize,
    /// Notifications buffered per subscription before the oldest is dropped.
    pub subscription_queue_capacity: usize,
    /// How long in-flight calls may run after `stop()` before the connection
    /// scope is cancelled.
    pub drain_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            subscription_queue_capacity: 1024,
            drain_timeout: Duration::from_secs(30),
        }
    }
}
