//! The context contract (spec §6, "Context contract"): one concrete struct
//! (not a trait — spec.md describes exactly one live implementation)
//! bundling the connections, configuration, inspector, and reconnect
//! strategy a flow needs.

use std::sync::Arc;

use siphon_core::FlowError;
use siphon_inspect::Inspector;
use siphon_net::{ClientConn, TcpClientConn, TcpServerConn, TransportError};

use crate::config::{Mode, ProxyConfig};
use crate::connect::{PlainReconnect, ReconnectStrategy};

pub struct ProxyContext<I: Inspector> {
    client_conn: Option<TcpClientConn>,
    pub server_conn: Option<TcpServerConn>,
    pub config: Arc<ProxyConfig>,
    pub inspector: Arc<I>,
    pub mode: Mode,
    pub close: bool,

    reconnect_strategy: Arc<dyn ReconnectStrategy>,
    current_target: Option<(String, u16)>,
}

impl<I: Inspector> ProxyContext<I> {
    pub fn new(client_conn: TcpClientConn, config: Arc<ProxyConfig>, inspector: Arc<I>) -> Self {
        let mode = config.mode;
        Self {
            client_conn: Some(client_conn),
            server_conn: None,
            config,
            inspector,
            mode,
            close: false,
            reconnect_strategy: Arc::new(PlainReconnect),
            current_target: None,
        }
    }

    /// Borrows the client-facing connection. Only absent transiently inside
    /// [`Self::upgrade_client_tls`].
    pub fn client(&self) -> &TcpClientConn {
        self.client_conn.as_ref().expect("client_conn present outside of upgrade_client_tls")
    }

    pub fn client_mut(&mut self) -> &mut TcpClientConn {
        self.client_conn.as_mut().expect("client_conn present outside of upgrade_client_tls")
    }

    /// Replaces the client-facing socket with its TLS-upgraded self in
    /// place (spec §4.7, "Establish TLS on... the client-facing socket").
    pub async fn upgrade_client_tls(&mut self, acceptor: tokio_rustls::TlsAcceptor) -> Result<(), TransportError> {
        let conn = self.client_conn.take().expect("client_conn present outside of upgrade_client_tls");
        self.client_conn = Some(conn.upgrade(acceptor).await?);
        Ok(())
    }

    /// Thin wrapper over `tracing`, matching spec §6's `log(msg, details?)`
    /// (SPEC_FULL.md §4, "Logging").
    pub fn log(&self, msg: &str, details: Option<&str>) {
        match details {
            Some(d) => tracing::debug!(details = d, "{msg}"),
            None => tracing::info!("{msg}"),
        }
    }

    /// True if `server_conn` is already connected to `target`.
    pub fn server_targets(&self, target: &(String, u16)) -> bool {
        self.current_target.as_ref() == Some(target)
    }

    /// Establishes the server-facing connection for `target` using the
    /// currently installed reconnect strategy (spec §6,
    /// "establish_server_connection((host,port))").
    pub async fn establish_server_connection(&mut self, target: (String, u16)) -> Result<(), FlowError> {
        let conn = self.reconnect_strategy.reconnect(&target).await?;
        self.server_conn = Some(conn);
        self.current_target = Some(target);
        Ok(())
    }

    /// Retries the upstream connection through the same strategy (spec §6,
    /// "server_reconnect(no_ssl?)"). `no_ssl` is honored by strategies that
    /// layer TLS themselves (`UpstreamProxyReconnect`); a plain strategy
    /// ignores it since it never adds TLS on its own.
    pub async fn server_reconnect(&mut self, _no_ssl: bool) -> Result<(), FlowError> {
        let target = self
            .current_target
            .clone()
            .ok_or_else(|| FlowError::Transport("no server target to reconnect to".into()))?;
        self.establish_server_connection(target).await
    }

    /// Installs a new reconnect strategy, e.g. the composite
    /// CONNECT-replaying strategy after a CONNECT upgrade (spec §4.7,
    /// "This installation happens exactly once at upgrade time").
    pub fn install_reconnect_strategy(&mut self, strategy: Arc<dyn ReconnectStrategy>) {
        self.reconnect_strategy = strategy;
    }

    /// Classifies the conntype for the current mode/target (spec §6,
    /// "determine_conntype()"). After a CONNECT upgrade this reports
    /// `"tls"` regardless of mode, matching spec §4.7's "Determine the new
    /// conntype from the SNI/target".
    pub fn determine_conntype(&self) -> &'static str {
        if self.client().ssl_established() {
            return "tls";
        }
        match self.mode {
            Mode::Regular => "http",
            Mode::Transparent => "transparent",
            Mode::Upstream => "upstream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use siphon_inspect::LoggingInspector;

    fn sample_config(mode: Mode) -> Arc<ProxyConfig> {
        Arc::new(ProxyConfig {
            listen_addr: "127.0.0.1:8080".parse::<SocketAddr>().unwrap(),
            mode,
            body_size_limit: None,
            forward_proxy: None,
            authenticator: None,
            server_version: "siphon/0.1".into(),
        })
    }

    async fn loopback_client_conn() -> TcpClientConn {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, _client) = tokio::join!(async { listener.accept().await.unwrap() }, tokio::net::TcpStream::connect(addr));
        let (stream, peer) = accepted;
        TcpClientConn::new(stream, peer)
    }

    #[tokio::test]
    async fn determine_conntype_reflects_mode_before_tls_upgrade() {
        let ctx = ProxyContext::new(loopback_client_conn().await, sample_config(Mode::Upstream), Arc::new(LoggingInspector));
        assert_eq!(ctx.determine_conntype(), "upstream");
    }

    #[tokio::test]
    async fn server_reconnect_without_a_target_fails() {
        let mut ctx = ProxyContext::new(loopback_client_conn().await, sample_config(Mode::Regular), Arc::new(LoggingInspector));
        assert!(ctx.server_reconnect(false).await.is_err());
    }
}
