//! Standalone TAK server demo
//!
//! Runs the gateway's mTLS server without a radio attached; events from
//! clients are logged instead of bridged.
//!
//! Usage:
//!   cargo run --example server -- server.pem server.key ca.pem

use meshtak_cert::{CertStore, MemoryKeyring};
use meshtak_server::{ServerConfig, TakServer};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,meshtak_server=debug")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        anyhow::bail!("usage: server <server-cert.pem> <server-key.pem> <client-ca.pem>");
    }
    let cert_pem = std::fs::read_to_string(&args[1])?;
    let key_pem = std::fs::read_to_string(&args[2])?;
    let ca_pem = std::fs::read_to_string(&args[3])?;

    let store = CertStore::new(Box::<MemoryKeyring>::default());
    store.install_bundled_identity(&cert_pem, &key_pem)?;
    store.import_client_ca(&ca_pem)?;

    let (uplink_tx, mut uplink_rx) = tokio::sync::mpsc::channel(100);
    let mut server = TakServer::new(ServerConfig::default(), &store, uplink_tx)?;
    server.start().await?;

    info!("Server running on 127.0.0.1:8089, Ctrl+C to stop");

    // Log what would normally go to the radio bridge.
    let logger = tokio::spawn(async move {
        while let Some(ev) = uplink_rx.recv().await {
            info!("client event: {}", ev);
        }
    });

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    server.stop().await;
    logger.abort();

    let stats = server.stats();
    info!("Total messages routed: {}", stats.total_messages);
    info!("Clients connected at shutdown: {}", stats.connection_count);

    Ok(())
}
