//! # MeshTAK Server
//!
//! The localhost TAK streaming server of the gateway: an mTLS listener that
//! accepts same-device CoT clients, frames the XML byte stream into events,
//! negotiates TAK Protocol version 0 and fans broadcasts out to every
//! connected client.
//!
//! ## Architecture
//!
//! - One accept loop plus one task per connection (tokio)
//! - DashMap registry with per-connection mpsc channels for fan-out
//! - Events from clients flow up one ordered channel to the gateway core

pub mod config;
pub mod connection;
pub mod error;
pub mod framer;
pub mod protocol;
pub mod router;
pub mod server;

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionId, ConnectionInfo, ConnectionState};
pub use error::{Result, ServerError};
pub use framer::EventFramer;
pub use router::CotRouter;
pub use server::TakServer;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fixed TAK server port.
pub const DEFAULT_PORT: u16 = 8089;

/// Keepalive cadence towards connected clients.
pub const KEEPALIVE_SECS: u64 = 30;

/// Transport-level idle keepalive.
pub const TCP_KEEPALIVE_SECS: u64 = 60;

/// Read-buffer and per-message ceiling.
pub const MAX_EVENT_BYTES: usize = 8 * 1024 * 1024;
