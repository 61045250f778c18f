//! Error types for the TAK server

use meshtak_cert::CertError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration failed: {0}")]
    TlsConfiguration(String),

    #[error("listener failed: {0}")]
    ListenerFailed(String),

    #[error("certificate error: {0}")]
    Certificate(#[from] CertError),

    #[error("client {0} not found")]
    ClientNotFound(u64),

    #[error("server not running")]
    NotRunning,

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("configuration error: {0}")]
    Config(String),
}
