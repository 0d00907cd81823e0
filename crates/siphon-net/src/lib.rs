//! Concrete transport for the proxy: TCP/TLS connections implementing the
//! `ClientConn`/`ServerConn` contract spec.md §6 names, plus the CA used to
//! mint client-facing certificates after a CONNECT upgrade.

pub mod ca;
pub mod conn;
pub mod error;

pub use ca::{upstream_tls_connector, CertificateAuthority};
pub use conn::{ClientConn, ServerConn, TcpClientConn, TcpServerConn};
pub use error::TransportError;
