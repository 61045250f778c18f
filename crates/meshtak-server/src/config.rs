//! Server configuration

use crate::error::{Result, ServerError};
use serde::{Deserialize, Serialize};

/// Server configuration.
///
/// The listener always binds to loopback; only same-device TAK clients may
/// connect, so the bind address is not configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TAK server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// CoT keepalive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// TCP-level idle keepalive in seconds.
    #[serde(default = "default_tcp_keepalive")]
    pub tcp_keepalive_secs: u64,

    /// Per-connection read-buffer and per-message cap in bytes.
    #[serde(default = "default_max_event_bytes")]
    pub max_event_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            keepalive_secs: default_keepalive(),
            tcp_keepalive_secs: default_tcp_keepalive(),
            max_event_bytes: default_max_event_bytes(),
        }
    }
}

impl ServerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ServerError::Config("port must be non-zero".into()));
        }
        if self.keepalive_secs == 0 {
            return Err(ServerError::Config(
                "keepalive_secs must be greater than 0".into(),
            ));
        }
        if self.max_event_bytes == 0 {
            return Err(ServerError::Config(
                "max_event_bytes must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    crate::DEFAULT_PORT
}

fn default_keepalive() -> u64 {
    crate::KEEPALIVE_SECS
}

fn default_tcp_keepalive() -> u64 {
    crate::TCP_KEEPALIVE_SECS
}

fn default_max_event_bytes() -> usize {
    crate::MAX_EVENT_BYTES
}
