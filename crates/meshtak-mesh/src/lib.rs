//! # MeshTAK Mesh
//!
//! The bidirectional bridge between CoT events and the radio link: the
//! compact-binary TAK packet spoken on the plugin port, the classifier and
//! translator that routes each event onto a transport, and the generic-CoT
//! forwarder pipeline (zlib + fountain) for everything the compact record
//! cannot express.

pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/meshtak.rs"));
}

mod bridge;
mod forwarder;

pub use bridge::{Bridge, BridgeError, Route};
pub use forwarder::{CotForwarder, ForwarderError, ACK_REPEAT_DELAY, INTER_PACKET_DELAY};
