//! Client connection management

use crate::error::{Result, ServerError};
use crate::framer::EventFramer;
use crate::protocol;
use crate::router::CotRouter;
use bytes::BytesMut;
use meshtak_cot::{parse_event, to_xml, CotEvent};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_rustls::server::TlsStream;
use tracing::{debug, info, trace};

/// Unique connection identifier
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Setup,
    Preparing,
    Ready,
    Cancelled,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Setup => write!(f, "setup"),
            ConnectionState::Preparing => write!(f, "preparing"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Cancelled => write!(f, "cancelled"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Connection metadata, partly harvested from the client's own traffic.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub callsign: Option<String>,
    pub uid: Option<String>,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    /// Uid the server uses when speaking to this client.
    pub server_uid: String,
    pub negotiated: bool,
    pub state: ConnectionState,
}

impl ConnectionInfo {
    pub fn new(id: ConnectionId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            callsign: None,
            uid: None,
            connected_at: chrono::Utc::now(),
            server_uid: format!("meshtak-server-{}", uuid::Uuid::new_v4()),
            negotiated: false,
            state: ConnectionState::Setup,
        }
    }
}

/// Connection handler; owns the TLS stream after the handshake.
pub struct Connection {
    info: ConnectionInfo,
    stream: TlsStream<TcpStream>,
    rx_broadcast: mpsc::Receiver<Arc<String>>,
    framer: EventFramer,
    keepalive: Duration,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        stream: TlsStream<TcpStream>,
        addr: SocketAddr,
        rx_broadcast: mpsc::Receiver<Arc<String>>,
        keepalive_secs: u64,
        max_event_bytes: usize,
    ) -> Self {
        let info = ConnectionInfo::new(id, addr);
        info!("[Connection {}] Accepted from {}", info.id, info.addr);
        Self {
            info,
            stream,
            rx_broadcast,
            framer: EventFramer::new(max_event_bytes),
            keepalive: Duration::from_secs(keepalive_secs),
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Drive the connection until the peer closes, the router drops us, or
    /// a send fails.
    pub async fn handle(mut self, router: Arc<CotRouter>) -> Result<()> {
        self.info.state = ConnectionState::Preparing;
        self.send_event(&protocol::support_event()).await?;
        self.info.state = ConnectionState::Ready;

        let mut keepalive = interval_at(Instant::now() + self.keepalive, self.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut read_buf = BytesMut::with_capacity(8192);

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut read_buf) => {
                    match result {
                        Ok(0) => {
                            info!("[Connection {}] Peer closed", self.info.id);
                            self.info.state = ConnectionState::Cancelled;
                            return Ok(());
                        }
                        Ok(n) => {
                            trace!("[Connection {}] Read {} bytes", self.info.id, n);
                            self.framer.push(&read_buf);
                            read_buf.clear();
                            while let Some(message) = self.framer.next_event() {
                                self.handle_message(&message, &router).await?;
                            }
                        }
                        Err(e) => {
                            self.info.state = ConnectionState::Failed;
                            return Err(e.into());
                        }
                    }
                }

                maybe = self.rx_broadcast.recv() => {
                    match maybe {
                        Some(xml) => self.send_raw(xml.as_bytes()).await?,
                        None => {
                            // Router dropped us; treat as cancellation.
                            self.info.state = ConnectionState::Cancelled;
                            return Ok(());
                        }
                    }
                }

                _ = keepalive.tick() => {
                    self.send_event(&protocol::keepalive_event()).await?;
                    trace!("[Connection {}] Keepalive sent", self.info.id);
                }
            }
        }
    }

    /// Handle one framed message. Parse failures drop the message, never
    /// the connection.
    async fn handle_message(&mut self, message: &[u8], router: &Arc<CotRouter>) -> Result<()> {
        let text = String::from_utf8_lossy(message);
        let ev = match parse_event(&text) {
            Ok(ev) => ev,
            Err(e) => {
                debug!("[Connection {}] Dropping unparseable message: {}", self.info.id, e);
                return Ok(());
            }
        };

        if protocol::is_negotiation_request(&ev) {
            self.info.negotiated = true;
            info!("[Connection {}] Negotiated TAK protocol v0", self.info.id);
            return self.send_event(&protocol::negotiation_response()).await;
        }
        // Other protocol control and pings terminate here; they never reach
        // the radio.
        if ev.is_protocol_control() || ev.is_ping() {
            trace!("[Connection {}] Consumed {} event", self.info.id, ev.event_type);
            return Ok(());
        }

        self.update_info(&ev);
        router.route_from_client(self.info.id, ev).await;
        Ok(())
    }

    /// Harvest uid and callsign from the first traffic that carries them.
    fn update_info(&mut self, ev: &CotEvent) {
        if self.info.uid.is_none() {
            self.info.uid = Some(ev.uid.clone());
            debug!("[Connection {}] UID: {}", self.info.id, ev.uid);
        }
        if self.info.callsign.is_none() {
            if let Some(contact) = &ev.contact {
                if !contact.callsign.is_empty() {
                    info!("[Connection {}] Callsign: {}", self.info.id, contact.callsign);
                    self.info.callsign = Some(contact.callsign.clone());
                }
            }
        }
    }

    async fn send_event(&mut self, ev: &CotEvent) -> Result<()> {
        self.send_raw(to_xml(ev).as_bytes()).await
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| ServerError::SendFailed(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ServerError::SendFailed(e.to_string()))?;
        Ok(())
    }
}
