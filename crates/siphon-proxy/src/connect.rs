//! CONNECT / TLS-upgrade sub-protocol (spec §4.7) and the pluggable
//! reconnect strategy that replaces the original's monkey-patched
//! `server_reconnect` (spec §9 design notes, item 2).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use siphon_core::codec;
use siphon_core::headers::HeaderMap;
use siphon_core::FlowError;
use siphon_net::{upstream_tls_connector, TcpServerConn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Establishes (or re-establishes) the server-facing connection for a
/// `(host, port)` target. The connection exposes a slot holding one of
/// these instead of a live function pointer that gets replaced in place
/// (spec §9, "model as a pluggable strategy... no live function
/// replacement").
pub trait ReconnectStrategy: Send + Sync {
    fn reconnect<'a>(&'a self, target: &'a (String, u16)) -> BoxFuture<'a, Result<TcpServerConn, FlowError>>;
}

/// Opens a fresh plaintext TCP connection to the target. What every
/// connection starts with before any CONNECT upgrade happens.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainReconnect;

impl ReconnectStrategy for PlainReconnect {
    fn reconnect<'a>(&'a self, target: &'a (String, u16)) -> BoxFuture<'a, Result<TcpServerConn, FlowError>> {
        Box::pin(async move {
            let (host, port) = target;
            let stream = TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(|e| FlowError::Transport(e.to_string()))?;
            let address = stream.peer_addr().map_err(|e| FlowError::Transport(e.to_string()))?;
            Ok(TcpServerConn::new(stream, address))
        })
    }
}

/// Composite strategy installed exactly once, at CONNECT-upgrade time, when
/// this proxy itself forwards through another HTTP proxy (spec §4.7,
/// "Upstream-proxy variant"): plain reconnect, then replay the recorded
/// CONNECT request, then layer TLS. Every subsequent `server_reconnect`
/// call on this connection transparently goes through all three steps.
pub struct UpstreamProxyReconnect {
    inner: Arc<dyn ReconnectStrategy>,
    connect_request: Vec<u8>,
    server_name: rustls_pki_types::ServerName<'static>,
}

impl UpstreamProxyReconnect {
    pub fn new(
        inner: Arc<dyn ReconnectStrategy>,
        connect_request: Vec<u8>,
        server_name: rustls_pki_types::ServerName<'static>,
    ) -> Self {
        Self { inner, connect_request, server_name }
    }
}

impl ReconnectStrategy for UpstreamProxyReconnect {
    fn reconnect<'a>(&'a self, target: &'a (String, u16)) -> BoxFuture<'a, Result<TcpServerConn, FlowError>> {
        Box::pin(async move {
            let mut conn = self.inner.reconnect(target).await?;
            conn.write_all(&self.connect_request).await.map_err(|e| FlowError::Transport(e.to_string()))?;
            conn.flush().await.map_err(|e| FlowError::Transport(e.to_string()))?;

            let (status, headers) = read_connect_response(&mut conn).await?;
            if status != 200 {
                return Err(FlowError::UpstreamProxyHandshake { headers });
            }

            let connector = upstream_tls_connector();
            conn.upgrade(connector, self.server_name.clone())
                .await
                .map_err(|e| FlowError::Transport(e.to_string()))
        })
    }
}

/// Composite strategy installed at CONNECT-upgrade time for a *direct*
/// tunnel (no upstream proxy in between): plain reconnect, then layer TLS.
/// Without this, a reconnect after the tunnel is established would hand
/// back a plaintext socket and silently break the tunnel.
pub struct DirectTlsReconnect {
    inner: Arc<dyn ReconnectStrategy>,
    server_name: rustls_pki_types::ServerName<'static>,
}

impl DirectTlsReconnect {
    pub fn new(inner: Arc<dyn ReconnectStrategy>, server_name: rustls_pki_types::ServerName<'static>) -> Self {
        Self { inner, server_name }
    }
}

impl ReconnectStrategy for DirectTlsReconnect {
    fn reconnect<'a>(&'a self, target: &'a (String, u16)) -> BoxFuture<'a, Result<TcpServerConn, FlowError>> {
        Box::pin(async move {
            let conn = self.inner.reconnect(target).await?;
            let connector = upstream_tls_connector();
            conn.upgrade(connector, self.server_name.clone()).await.map_err(|e| FlowError::Transport(e.to_string()))
        })
    }
}

/// Reads a CONNECT response's status line and headers without attempting
/// to read a body — a successful CONNECT response has none; the next byte
/// on the wire starts the tunnel (TLS ClientHello).
async fn read_connect_response(conn: &mut TcpServerConn) -> Result<(u16, HeaderMap), FlowError> {
    // Capacity 1: the underlying stream is about to carry a TLS ClientHello
    // once the handshake starts, so a normal read-ahead buffer would
    // swallow bytes that belong to the handshake, not this head block.
    let mut reader = BufReader::with_capacity(1, conn);
    let block = codec::read_head_block(&mut reader).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_storage);
    parsed.parse(&block).map_err(|e| FlowError::ParseError(format!("bad CONNECT response: {e}")))?;
    let status = parsed.code.ok_or_else(|| FlowError::ParseError("CONNECT response missing status".into()))?;

    let mut headers = HeaderMap::new();
    for h in parsed.headers.iter() {
        if !h.name.is_empty() {
            headers.add(h.name.to_string(), String::from_utf8_lossy(h.value).into_owned());
        }
    }
    Ok((status, headers))
}

/// Renders the CONNECT request line and headers this proxy sends to its
/// own upstream proxy (or to the client, in the direct case), recorded
/// once so it can be replayed by [`UpstreamProxyReconnect`].
pub fn build_connect_request(host: &str, port: u16, server_version: &str) -> Vec<u8> {
    format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nUser-Agent: {server_version}\r\n\r\n"
    )
    .into_bytes()
}

/// The line this proxy writes back to the client after a direct CONNECT
/// (spec §4.5, "write `HTTP/1.1 200 Connection established...`").
pub fn connection_established_response(server_version: &str) -> Vec<u8> {
    format!("HTTP/1.1 200 Connection established\r\nProxy-agent: {server_version}\r\n\r\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_includes_host_and_port() {
        let req = build_connect_request("example.com", 443, "siphon/0.1");
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:443"));
    }

    #[test]
    fn connection_established_matches_wire_format() {
        let resp = connection_established_response("siphon/0.1");
        assert_eq!(resp, b"HTTP/1.1 200 Connection established\r\nProxy-agent: siphon/0.1\r\n\r\n");
    }
}
