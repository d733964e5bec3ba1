//! Server configuration.

use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// How long an empty session survives before it is reclaimed
    pub idle_timeout: Duration,
    /// Fan-out events buffered per connection before it starts lagging
    pub broadcast_capacity: usize,
    /// Interval between transport-level pings
    pub heartbeat_interval: Duration,
    /// Inbound frames larger than this are dropped
    pub max_message_bytes: usize,
}

/// Shortest heartbeat period the server will run with.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

impl ServerConfig {
    /// Heartbeat period actually used, never shorter than
    /// [`MIN_HEARTBEAT_INTERVAL`].
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            idle_timeout: Duration::from_secs(60),
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            max_message_bytes: 1 << 20,
        }
    }
}
