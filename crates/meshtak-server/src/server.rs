//! Main TAK server implementation

use crate::config::ServerConfig;
use crate::connection::{next_connection_id, Connection, ConnectionId};
use crate::error::{Result, ServerError};
use crate::router::CotRouter;
use dashmap::DashMap;
use meshtak_cert::CertStore;
use meshtak_cot::CotEvent;
use parking_lot::Mutex;
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::RootCertStore;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// TAK streaming server: loopback mTLS listener plus per-connection tasks.
pub struct TakServer {
    config: ServerConfig,
    router: Arc<CotRouter>,
    acceptor: TlsAcceptor,
    enabled: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
    listener_handle: Option<JoinHandle<()>>,
    connection_tasks: Arc<DashMap<ConnectionId, JoinHandle<()>>>,
}

impl std::fmt::Debug for TakServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TakServer")
            .field("config", &self.config)
            .field("enabled", &self.enabled)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl TakServer {
    /// Build the server. Certificate problems refuse startup here, before
    /// the listener ever binds.
    pub fn new(
        config: ServerConfig,
        store: &CertStore,
        uplink: mpsc::Sender<CotEvent>,
    ) -> Result<Self> {
        config.validate()?;
        let tls = build_tls_config(store)?;

        Ok(Self {
            config,
            router: Arc::new(CotRouter::new(uplink)),
            acceptor: TlsAcceptor::from(tls),
            enabled: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(Mutex::new(None)),
            listener_handle: None,
            connection_tasks: Arc::new(DashMap::new()),
        })
    }

    /// Handle for broadcasting radio-received events to all clients.
    pub fn router(&self) -> Arc<CotRouter> {
        Arc::clone(&self.router)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// The error that took the listener down, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Bind the listener and start accepting clients.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting MeshTAK server v{}", crate::VERSION);

        // Loopback only: remote TAK clients are outside the trust boundary.
        let addr = SocketAddr::from(([127, 0, 0, 1], self.config.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            self.enabled.store(false, Ordering::SeqCst);
            *self.last_error.lock() = Some(e.to_string());
            ServerError::ListenerFailed(e.to_string())
        })?;
        info!("mTLS listener bound to {}", addr);
        self.enabled.store(true, Ordering::SeqCst);

        let acceptor = self.acceptor.clone();
        let router = Arc::clone(&self.router);
        let config = self.config.clone();
        let enabled = Arc::clone(&self.enabled);
        let last_error = Arc::clone(&self.last_error);
        let tasks = Arc::clone(&self.connection_tasks);

        self.listener_handle = Some(tokio::spawn(async move {
            Self::accept_loop(listener, acceptor, router, config, enabled, last_error, tasks)
                .await;
        }));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn accept_loop(
        listener: TcpListener,
        acceptor: TlsAcceptor,
        router: Arc<CotRouter>,
        config: ServerConfig,
        enabled: Arc<AtomicBool>,
        last_error: Arc<Mutex<Option<String>>>,
        tasks: Arc<DashMap<ConnectionId, JoinHandle<()>>>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if !enabled.load(Ordering::SeqCst) {
                        info!("Server disabled, leaving accept loop");
                        break;
                    }
                    let id = next_connection_id();
                    let handle = tokio::spawn(Self::serve_connection(
                        stream,
                        addr,
                        id,
                        acceptor.clone(),
                        Arc::clone(&router),
                        config.clone(),
                        Arc::clone(&tasks),
                    ));
                    tasks.insert(id, handle);
                }
                Err(e) => {
                    error!("Listener failed: {}", e);
                    *last_error.lock() = Some(e.to_string());
                    enabled.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        id: ConnectionId,
        acceptor: TlsAcceptor,
        router: Arc<CotRouter>,
        config: ServerConfig,
        tasks: Arc<DashMap<ConnectionId, JoinHandle<()>>>,
    ) {
        let keepalive =
            TcpKeepalive::new().with_time(Duration::from_secs(config.tcp_keepalive_secs));
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!("[Connection {}] TCP keepalive not set: {}", id, e);
        }

        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let rx_broadcast = router.register(id);
                let connection = Connection::new(
                    id,
                    tls_stream,
                    addr,
                    rx_broadcast,
                    config.keepalive_secs,
                    config.max_event_bytes,
                );
                match connection.handle(Arc::clone(&router)).await {
                    Ok(()) => info!("[Connection {}] Disconnected", id),
                    Err(e) => warn!("[Connection {}] Failed: {}", id, e),
                }
                router.unregister(id);
            }
            // Unauthenticated clients (no usable client cert, or no CA
            // configured at all) are refused here.
            Err(e) => debug!("TLS handshake with {} failed: {}", addr, e),
        }
        tasks.remove(&id);
    }

    /// Stop the listener and cancel every connection task.
    pub async fn stop(&mut self) {
        info!("Stopping server...");
        self.enabled.store(false, Ordering::SeqCst);

        if let Some(handle) = self.listener_handle.take() {
            handle.abort();
        }
        for entry in self.connection_tasks.iter() {
            entry.value().abort();
        }
        self.connection_tasks.clear();
        info!("Server stopped");
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connection_count: self.router.connection_count(),
            total_messages: self.router.total_messages(),
        }
    }
}

impl Drop for TakServer {
    fn drop(&mut self) {
        if let Some(handle) = self.listener_handle.take() {
            handle.abort();
        }
        for entry in self.connection_tasks.iter() {
            entry.value().abort();
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub connection_count: usize,
    pub total_messages: u64,
}

/// mTLS configuration: our identity from the certificate store, client
/// authentication against the configured CA anchors exclusively.
fn build_tls_config(store: &CertStore) -> Result<Arc<rustls::ServerConfig>> {
    let identity = store.active_server_identity()?;
    let anchors = store.client_ca_anchors()?;
    if anchors.is_empty() {
        warn!("no client CA configured; every client connection will be rejected");
    }

    let mut roots = RootCertStore::empty();
    for anchor in &anchors {
        roots
            .add(anchor)
            .map_err(|e| ServerError::TlsConfiguration(format!("bad CA certificate: {}", e)))?;
    }

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
        .with_single_cert(identity.cert_chain, identity.key)
        .map_err(|e| ServerError::TlsConfiguration(e.to_string()))?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtak_cert::MemoryKeyring;

    #[tokio::test]
    async fn test_refuses_to_build_without_identity() {
        let store = CertStore::new(Box::<MemoryKeyring>::default());
        let (uplink, _rx) = mpsc::channel(8);
        let err = TakServer::new(ServerConfig::default(), &store, uplink).unwrap_err();
        assert!(matches!(err, ServerError::Certificate(_)));
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let store = CertStore::new(Box::<MemoryKeyring>::default());
        let (uplink, _rx) = mpsc::channel(8);
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let err = TakServer::new(config, &store, uplink).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }
}
