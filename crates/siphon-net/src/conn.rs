//! Transport contract (spec §6): byte streams with an identity (`address`),
//! a TLS-establishment hook, and timestamp bookkeeping the codec uses to
//! stamp `timestamp_start`. Client and server sides are concrete Tokio
//! TCP/TLS streams; `ClientConn`/`ServerConn` are the traits the flow
//! engine in `siphon-proxy` is generic over, so tests can substitute an
//! in-memory duplex pair.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

use crate::error::TransportError;

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

/// A connection the flow engine reads requests from and writes responses to.
pub trait ClientConn: AsyncRead + AsyncWrite + Unpin + Send {
    fn address(&self) -> SocketAddr;
    fn ssl_established(&self) -> bool;
    fn first_byte_timestamp(&self) -> Option<f64>;
    /// Clears the recorded first-byte timestamp, e.g. at the start of a new
    /// pipelined request on a keep-alive connection.
    fn reset_timestamps(&mut self);
}

/// A connection the flow engine forwards requests to and reads responses from.
pub trait ServerConn: AsyncRead + AsyncWrite + Unpin + Send {
    fn address(&self) -> SocketAddr;
    fn reset_timestamps(&mut self);
}

enum ClientStream {
    Plain(TcpStream),
    Tls(Box<ServerTlsStream<TcpStream>>),
}

/// The client-facing socket. Starts plain; [`TcpClientConn::upgrade`]
/// replaces the inner stream with a TLS server stream in place, matching
/// spec §4.7 ("Establish TLS on... the client-facing socket").
pub struct TcpClientConn {
    address: SocketAddr,
    stream: ClientStream,
    first_byte_timestamp: Option<f64>,
}

impl TcpClientConn {
    pub fn new(stream: TcpStream, address: SocketAddr) -> Self {
        Self { address, stream: ClientStream::Plain(stream), first_byte_timestamp: None }
    }

    pub async fn upgrade(self, acceptor: tokio_rustls::TlsAcceptor) -> Result<Self, TransportError> {
        let TcpClientConn { address, stream, .. } = self;
        let ClientStream::Plain(tcp) = stream else {
            return Err(TransportError::TlsHandshake("client connection already upgraded".into()));
        };
        let tls = acceptor.accept(tcp).await.map_err(|e| TransportError::TlsHandshake(e.to_string()))?;
        Ok(Self { address, stream: ClientStream::Tls(Box::new(tls)), first_byte_timestamp: None })
    }
}

impl ClientConn for TcpClientConn {
    fn address(&self) -> SocketAddr {
        self.address
    }

    fn ssl_established(&self) -> bool {
        matches!(self.stream, ClientStream::Tls(_))
    }

    fn first_byte_timestamp(&self) -> Option<f64> {
        self.first_byte_timestamp
    }

    fn reset_timestamps(&mut self) {
        self.first_byte_timestamp = None;
    }
}

impl AsyncRead for TcpClientConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = match &mut this.stream {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        };
        if this.first_byte_timestamp.is_none() && buf.filled().len() > before {
            this.first_byte_timestamp = Some(now_secs());
        }
        result
    }
}

impl AsyncWrite for TcpClientConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match &mut self.get_mut().stream {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().stream {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().stream {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

enum ServerStream {
    Plain(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

/// The server-facing socket: starts plain, upgraded to TLS after CONNECT
/// (spec §4.7, "the server-facing socket").
pub struct TcpServerConn {
    address: SocketAddr,
    stream: ServerStream,
}

impl TcpServerConn {
    pub fn new(stream: TcpStream, address: SocketAddr) -> Self {
        Self { address, stream: ServerStream::Plain(stream) }
    }

    pub async fn upgrade(
        self,
        connector: tokio_rustls::TlsConnector,
        server_name: rustls_pki_types::ServerName<'static>,
    ) -> Result<Self, TransportError> {
        let TcpServerConn { address, stream } = self;
        let ServerStream::Plain(tcp) = stream else {
            return Err(TransportError::TlsHandshake("server connection already upgraded".into()));
        };
        let tls = connector.connect(server_name, tcp).await.map_err(|e| TransportError::TlsHandshake(e.to_string()))?;
        Ok(Self { address, stream: ServerStream::Tls(Box::new(tls)) })
    }

    pub fn ssl_established(&self) -> bool {
        matches!(self.stream, ServerStream::Tls(_))
    }
}

impl ServerConn for TcpServerConn {
    fn address(&self) -> SocketAddr {
        self.address
    }

    fn reset_timestamps(&mut self) {}
}

impl AsyncRead for TcpServerConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().stream {
            ServerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpServerConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match &mut self.get_mut().stream {
            ServerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().stream {
            ServerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().stream {
            ServerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_client_conn_is_not_ssl_established() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_fut = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(async { listener.accept().await.unwrap() }, client_fut);
        let (server_side, peer_addr) = accepted;
        let _client = client.unwrap();
        let conn = TcpClientConn::new(server_side, peer_addr);
        assert!(!conn.ssl_established());
        assert_eq!(conn.first_byte_timestamp(), None);
    }
}
