use thiserror::Error;

/// Transport-layer failures (spec §6, "A `NetLibDisconnect` signal raised on
/// unexpected EOF"), kept separate from [`siphon_core::error::FlowError`]
/// since these originate below the HTTP parsing boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection disconnected")]
    Disconnect,
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),
    #[error("certificate generation failed: {0}")]
    CertGeneration(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
