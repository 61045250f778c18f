//! CoT message router
//!
//! Fans server-originated broadcasts out to every connected client, relays
//! client traffic to the other local clients, and forwards it up one
//! ordered channel to the gateway core for the radio.

use crate::connection::ConnectionId;
use dashmap::DashMap;
use meshtak_cot::{to_xml, CotEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct CotRouter {
    /// Map of connection id to broadcast sender
    connections: DashMap<ConnectionId, mpsc::Sender<Arc<String>>>,

    /// Ordered stream of client events towards the gateway core.
    uplink: mpsc::Sender<CotEvent>,

    /// Statistics
    total_messages: AtomicU64,
}

impl CotRouter {
    pub fn new(uplink: mpsc::Sender<CotEvent>) -> Self {
        Self {
            connections: DashMap::new(),
            uplink,
            total_messages: AtomicU64::new(0),
        }
    }

    /// Register a new connection; returns its broadcast receiver.
    pub fn register(&self, id: ConnectionId) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(100);
        self.connections.insert(id, tx);
        info!(
            "[Router] Registered connection {}, total: {}",
            id,
            self.connections.len()
        );
        rx
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.connections.remove(&id);
        info!(
            "[Router] Unregistered connection {}, total: {}",
            id,
            self.connections.len()
        );
    }

    /// Route a client's event: to the other local clients and up to the
    /// gateway for the radio.
    pub async fn route_from_client(&self, from: ConnectionId, ev: CotEvent) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);

        let message = Arc::new(to_xml(&ev));
        self.fan_out(Some(from), message).await;

        if self.uplink.send(ev).await.is_err() {
            warn!("[Router] Gateway channel closed, dropping event");
        }
    }

    /// Broadcast a serialized event to every connected client.
    pub async fn broadcast(&self, xml: String) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.fan_out(None, Arc::new(xml)).await;
    }

    async fn fan_out(&self, except: Option<ConnectionId>, message: Arc<String>) {
        let mut closed = Vec::new();

        for entry in self.connections.iter() {
            let id = *entry.key();
            if Some(id) == except {
                continue;
            }
            // A failed channel send only loses that connection; the rest of
            // the fan-out continues.
            if entry.value().send(Arc::clone(&message)).await.is_err() {
                warn!("[Router] Connection {} channel closed, removing", id);
                closed.push(id);
            } else {
                debug!("[Router] Delivered to connection {}", id);
            }
        }

        for id in closed {
            self.unregister(id);
        }
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Total messages routed.
    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }
}
