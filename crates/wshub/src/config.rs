//! Hub and connection configuration.
//!
//! Values here are typically supplied by an external configuration layer;
//! this module only defines the tunables and their defaults.

use std::time::Duration;

/// Configuration for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum inbound message size in bytes; 0 disables the limit
    /// (default: 1 MB). Exceeding it closes the connection with status 1009.
    pub max_message_size: usize,
    /// Read timeout - a blocking read fails if no frame arrives within this
    /// window (default: none).
    pub read_timeout: Option<Duration>,
    /// How long a ping waits for the matching pong (default: 10 seconds).
    pub pong_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024, // 1 MB
            read_timeout: None,
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum inbound message size; 0 disables the limit.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set how long a ping waits for the matching pong.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }
}

/// Configuration for a hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How often the session loop sends heartbeat pings; `None` disables
    /// heartbeats (default: 30 seconds).
    pub heartbeat_interval: Option<Duration>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl HubConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Disable heartbeat pings.
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat_interval = None;
        self
    }
}
