//! # MeshTAK Core
//!
//! Shared types for the TAK ↔ Meshtastic gateway: the radio datagram model,
//! the ports the gateway speaks on, and the interfaces of the external
//! collaborators (radio driver, node store).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Radio port carrying compact-binary TAK packets (ATAK plugin).
pub const PLUGIN_PORT: u32 = 72;

/// Radio port carrying compressed generic CoT (ATAK forwarder).
pub const FORWARDER_PORT: u32 = 257;

/// Mesh broadcast address.
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not connected to a radio")]
    NotConnectedToRadio,

    #[error("radio has no device number yet")]
    NoDeviceNumber,

    #[error("radio send failed: {0}")]
    SendFailed(String),
}

/// A single mesh datagram, as handed to / received from the radio driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Destination node id ([`BROADCAST_ADDR`] for broadcast).
    pub to: u32,
    /// Source node id.
    pub from: u32,
    /// Radio channel index.
    pub channel: u32,
    /// Application port ([`PLUGIN_PORT`] or [`FORWARDER_PORT`]).
    pub port: u32,
    pub payload: Vec<u8>,
}

/// Handle to the radio driver collaborator.
///
/// The driver consumes [`Datagram`]s from the channel end; the gateway only
/// ever holds this non-owning handle (the driver's lifecycle belongs to the
/// surrounding app).
#[derive(Clone)]
pub struct RadioHandle {
    tx: mpsc::Sender<Datagram>,
    node_id: Option<u32>,
    channel: u32,
}

impl RadioHandle {
    pub fn new(tx: mpsc::Sender<Datagram>, node_id: Option<u32>, channel: u32) -> Self {
        Self {
            tx,
            node_id,
            channel,
        }
    }

    /// Our own node number, if the radio has reported one.
    pub fn node_id(&self) -> Option<u32> {
        self.node_id
    }

    /// Queue a datagram for transmission.
    pub async fn send(&self, to: u32, port: u32, payload: Vec<u8>) -> Result<(), CoreError> {
        let from = self.node_id.ok_or(CoreError::NoDeviceNumber)?;
        let dgram = Datagram {
            to,
            from,
            channel: self.channel,
            port,
            payload,
        };
        self.tx
            .send(dgram)
            .await
            .map_err(|_| CoreError::NotConnectedToRadio)
    }
}

/// Persistent node/entity store collaborator, looked up by numeric node id.
pub trait NodeStore: Send + Sync {
    /// Human-readable name for a mesh node, if known.
    fn long_name(&self, node_id: u32) -> Option<String>;
}

/// A no-entry node store for contexts without persistence.
#[derive(Debug, Default)]
pub struct EmptyNodeStore;

impl NodeStore for EmptyNodeStore {
    fn long_name(&self, _node_id: u32) -> Option<String> {
        None
    }
}

pub type SharedNodeStore = Arc<dyn NodeStore>;

/// Gateway configuration persisted across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Whether the TAK server should run.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// TAK server port. Fixed at 8089 for deployed gateways.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Radio channel index used for all gateway traffic.
    #[serde(default)]
    pub channel: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            port: default_port(),
            channel: 0,
        }
    }
}

fn default_enabled() -> bool {
    false
}

fn default_port() -> u16 {
    8089
}
