//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::constants::*;
use crate::registry::RegistryConfig;
use crate::session::BackpressureLimits;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Path of the websocket endpoint
    pub ws_path: String,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Interval of the liveness sweep
    pub ping_interval: Duration,

    /// Maximum inbound frame size
    pub max_payload: usize,

    /// Outbound buffer size that raises backpressure
    pub backpressure_high: usize,

    /// Outbound buffer size below which backpressure is released
    pub backpressure_low: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Stream registry settings
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8091)),
            ws_path: DEFAULT_WS_PATH.to_string(),
            max_connections: 0, // Unlimited
            ping_interval: DEFAULT_PING_INTERVAL,
            max_payload: DEFAULT_MAX_PAYLOAD,
            backpressure_high: HIGH_BACK_PRESSURE,
            backpressure_low: LOW_BACK_PRESSURE,
            tcp_nodelay: true,
            registry: RegistryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the websocket path
    pub fn ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the liveness sweep interval
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the maximum inbound frame size
    pub fn max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    /// Set the backpressure water marks; `low` is clamped to at most `high`
    pub fn backpressure(mut self, high: usize, low: usize) -> Self {
        self.backpressure_high = high;
        self.backpressure_low = low.min(high);
        self
    }

    /// Set the orphan timeout of the stream registry
    pub fn orphan_timeout(mut self, timeout: Duration) -> Self {
        self.registry = self.registry.orphan_timeout(timeout);
        self
    }

    pub(crate) fn backpressure_limits(&self) -> BackpressureLimits {
        BackpressureLimits {
            high: self.backpressure_high,
            low: self.backpressure_low,
        }
    }
}
