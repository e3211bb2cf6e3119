//! Tunnel configuration.

use crate::error::{TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Settings for one [`crate::Tunnel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Local address to listen on. Port `0` picks an ephemeral port.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Fixed upstream address every session is dialed to (`host:port`).
    #[serde(default)]
    pub remote_addr: String,

    /// Size of each direction's transfer buffer, in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Upper bound on dialing the upstream. `None` waits for the OS.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn default_buffer_size() -> usize {
    4096
}

impl TunnelConfig {
    /// Defaults for everything except the upstream address.
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: default_listen_addr(),
            remote_addr: remote_addr.into(),
            buffer_size: default_buffer_size(),
            connect_timeout_ms: None,
        }
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Reject settings the tunnel cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] when the remote address is empty or
    /// the buffer size is zero.
    pub fn validate(&self) -> TunnelResult<()> {
        if self.remote_addr.trim().is_empty() {
            return Err(TunnelError::Config("remote_addr is empty".into()));
        }
        if self.buffer_size == 0 {
            return Err(TunnelError::Config("buffer_size must be non-zero".into()));
        }
        Ok(())
    }
}
