//! The flow state machine (spec §4.4-§4.8): the per-connection loop that
//! drives one HTTP transaction at a time, process-request side effects,
//! the bounded-reconnect upstream exchange, and the error-catch boundary
//! that synthesizes a response for anything the loop can't otherwise
//! recover from.

use std::sync::Arc;

use rustls_pki_types::ServerName;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};

use siphon_core::flow::{ConnectionSnapshot, Flow, FlowId};
use siphon_core::form::RequestForm;
use siphon_core::headers::HeaderMap;
use siphon_core::{codec, FlowError, Request, Response};
use siphon_inspect::{Inspector, Reply, Topic};
use siphon_net::{upstream_tls_connector, CertificateAuthority, ClientConn, ServerConn};

use crate::config::Mode;
use crate::connect::{self, DirectTlsReconnect, PlainReconnect, ReconnectStrategy, UpstreamProxyReconnect};
use crate::context::ProxyContext;
use crate::error::ProxyError;
use crate::error_synth;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// What the per-request step asks the outer connection loop to do next
/// (spec §9, "model as an explicit returned transition value" — replacing
/// the thrown connection-type-change exception).
#[derive(Debug)]
pub enum Transition {
    /// Keep serving requests on this connection.
    Continue,
    /// The connection is finished; stop serving it.
    Done,
    /// An authority-form (CONNECT) transaction just completed; hand the
    /// connection off to the TLS tunnel (spec §4.7).
    UpgradeToTls { target: (String, u16) },
}

/// Drives one client connection until it closes, handling CONNECT upgrades
/// transparently by re-entering the HTTP loop over the upgraded sockets.
pub async fn run_connection<I: Inspector>(ctx: &mut ProxyContext<I>, ca: &CertificateAuthority) {
    let mut next_id: FlowId = 1;

    loop {
        let flow_id = next_id;
        next_id += 1;

        match run_one_flow(ctx, flow_id).await {
            Transition::Continue => continue,
            Transition::Done => break,
            Transition::UpgradeToTls { target } => {
                if let Err(err) = upgrade_to_tls(ctx, &target, ca).await {
                    tracing::warn!(flow_id, %err, "tls upgrade failed");
                    break;
                }
            }
        }
    }
}

/// Runs one request/response transaction (spec §4.4 steps 1-9). Errors
/// raised anywhere in the transaction are caught here and dispatched to
/// [`handle_error`] (spec §4.8); this function itself never fails.
pub async fn run_one_flow<I: Inspector>(ctx: &mut ProxyContext<I>, flow_id: FlowId) -> Transition {
    let parsed = {
        let body_size_limit = ctx.config.body_size_limit;
        let mut reader = BufReader::with_capacity(1, ctx.client_mut());
        Request::from_stream(&mut reader, true, body_size_limit).await
    };

    let mut flow = Flow::new(flow_id, client_snapshot(ctx), server_snapshot(ctx));
    flow.conntype = ctx.determine_conntype().to_string();

    let request = match parsed {
        Ok(r) => r,
        Err(e) if is_clean_disconnect(&e) => return Transition::Done,
        Err(e) => return handle_error(ctx, &mut flow, e).await,
    };
    flow.set_request(request);

    match ctx.inspector.ask(Topic::Request, &mut flow).await {
        Reply::Kill => return Transition::Done,
        Reply::Respond(resp) => flow.set_response(resp),
        Reply::Proceed => {}
    }

    if flow.response.is_none() {
        match process_request(ctx, &mut flow).await {
            Ok(ProcessOutcome::Forward) => {}
            Ok(ProcessOutcome::DirectConnectEstablished { target }) => return Transition::UpgradeToTls { target },
            Err(e) => return handle_error(ctx, &mut flow, e).await,
        }
    }

    let mut authority_target = None;
    if flow.response.is_none() {
        let request = flow.request.as_ref().unwrap().value.clone();
        if request.form_in == RequestForm::Authority {
            authority_target = Some((request.host.clone().unwrap(), request.port.unwrap()));
        }
        match upstream_exchange(ctx, &request).await {
            Ok(resp) => flow.set_response(resp),
            Err(e) => return handle_error(ctx, &mut flow, e).await,
        }
    }

    match ctx.inspector.ask(Topic::Response, &mut flow).await {
        Reply::Kill => return Transition::Done,
        Reply::Respond(resp) => flow.set_response(resp),
        Reply::Proceed => {}
    }

    let assembled = flow.response.as_ref().unwrap().value.assemble();
    let bytes = match assembled {
        Ok(b) => b,
        Err(e) => return handle_error(ctx, &mut flow, e).await,
    };
    if let Err(e) = write_all_and_flush(ctx.client_mut(), &bytes).await {
        tracing::warn!(flow_id, error = %e, "failed writing response to client");
        return Transition::Done;
    }

    let request = &flow.request.as_ref().unwrap().value;
    let response = &flow.response.as_ref().unwrap().value;
    if codec::connection_close(request.httpversion, &request.headers) || codec::connection_close(response.httpversion, &response.headers) {
        ctx.close = true;
    }

    if let Some(target) = authority_target {
        return Transition::UpgradeToTls { target };
    }

    if ctx.close {
        Transition::Done
    } else {
        Transition::Continue
    }
}

/// The caught request parse returns this exact message when the client
/// closed the connection before sending anything (spec §4.4 step 1, "if
/// stream closes at the start, end the loop cleanly").
fn is_clean_disconnect(err: &FlowError) -> bool {
    matches!(err, FlowError::Transport(msg) if msg == "connection closed")
}

fn client_snapshot<I: Inspector>(ctx: &ProxyContext<I>) -> ConnectionSnapshot {
    ConnectionSnapshot { address: ctx.client().address().to_string(), ssl_established: ctx.client().ssl_established() }
}

fn server_snapshot<I: Inspector>(ctx: &ProxyContext<I>) -> Option<ConnectionSnapshot> {
    ctx.server_conn
        .as_ref()
        .map(|s| ConnectionSnapshot { address: s.address().to_string(), ssl_established: s.ssl_established() })
}

async fn write_all_and_flush<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    w.write_all(bytes).await?;
    w.flush().await
}

/// What [`process_request`] decided should happen next (spec §4.5).
#[derive(Debug)]
enum ProcessOutcome {
    /// Continue to the normal upstream-exchange and response steps.
    Forward,
    /// A direct CONNECT tunnel: the `200 Connection established` line was
    /// already written to the client, skipping the response steps entirely.
    DirectConnectEstablished { target: (String, u16) },
}

/// Process-request side effects (spec §4.5): authentication, CONNECT
/// handling, upstream connection establishment, and form rewriting.
async fn process_request<I: Inspector>(ctx: &mut ProxyContext<I>, flow: &mut Flow) -> Result<ProcessOutcome, FlowError> {
    if ctx.mode == Mode::Regular {
        let request = &flow.request.as_ref().unwrap().value;
        authenticate(ctx, request)?;
    }

    let form_in = flow.request.as_ref().unwrap().value.form_in;

    if form_in == RequestForm::Authority {
        if ctx.client().ssl_established() {
            return Err(FlowError::TunnelOnTls);
        }

        let (host, port) = {
            let request = &flow.request.as_ref().unwrap().value;
            (
                request.host.clone().ok_or_else(|| FlowError::InvalidRequest("CONNECT missing host".into()))?,
                request.port.ok_or_else(|| FlowError::InvalidRequest("CONNECT missing port".into()))?,
            )
        };

        if ctx.mode == Mode::Regular && ctx.config.forward_proxy.is_none() {
            let target = (host, port);
            ctx.establish_server_connection(target.clone()).await?;
            let established = connect::connection_established_response(&ctx.config.server_version);
            write_all_and_flush(ctx.client_mut(), &established).await.map_err(|e| FlowError::Transport(e.to_string()))?;
            return Ok(ProcessOutcome::DirectConnectEstablished { target });
        }

        // Upstream-proxy variant (spec §4.7): forward the CONNECT itself
        // through the normal pipeline; its 200 response stands in for the
        // one a direct tunnel would have synthesized.
        let forward_target = forward_proxy_target(ctx)?;
        if !ctx.server_targets(&forward_target) {
            ctx.establish_server_connection(forward_target).await?;
        }
        return Ok(ProcessOutcome::Forward);
    }

    match (ctx.mode, form_in) {
        (Mode::Regular, RequestForm::Absolute) => {
            let (scheme_ok, target) = {
                let request = &flow.request.as_ref().unwrap().value;
                let scheme_ok = request.scheme.as_deref().map(|s| s.eq_ignore_ascii_case("http")).unwrap_or(true);
                let target = (
                    request.host.clone().ok_or_else(|| FlowError::InvalidRequest("absolute-form missing host".into()))?,
                    request.port.ok_or_else(|| FlowError::InvalidRequest("absolute-form missing port".into()))?,
                );
                (scheme_ok, target)
            };
            if !scheme_ok {
                return Err(FlowError::InvalidRequest("non-http scheme in regular mode".into()));
            }

            if let Some(forward_proxy) = ctx.config.forward_proxy {
                let forward_target = (forward_proxy.ip().to_string(), forward_proxy.port());
                if !ctx.server_targets(&forward_target) {
                    ctx.establish_server_connection(forward_target).await?;
                }
            } else {
                flow.request.as_mut().unwrap().value.form_out = RequestForm::Origin;
                if !ctx.server_targets(&target) {
                    ctx.establish_server_connection(target).await?;
                }
            }
            Ok(ProcessOutcome::Forward)
        }
        (Mode::Regular, other) => Err(FlowError::InvalidRequest(format!("{other} form not allowed in regular mode"))),
        (Mode::Upstream, _) => {
            let forward_target = forward_proxy_target(ctx)?;
            if !ctx.server_targets(&forward_target) {
                ctx.establish_server_connection(forward_target).await?;
            }
            Ok(ProcessOutcome::Forward)
        }
        (Mode::Transparent, _) => {
            if ctx.server_conn.is_none() {
                return Err(FlowError::Transport("no server connection established for transparent tunnel".into()));
            }
            Ok(ProcessOutcome::Forward)
        }
    }
}

fn forward_proxy_target<I: Inspector>(ctx: &ProxyContext<I>) -> Result<(String, u16), FlowError> {
    ctx.config
        .forward_proxy
        .map(|addr| (addr.ip().to_string(), addr.port()))
        .ok_or_else(|| FlowError::InvalidRequest("no upstream proxy configured".into()))
}

fn auth_challenge() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.add("Proxy-Authenticate", "Basic realm=\"siphon\"");
    headers
}

/// Consults the configured authenticator against `Proxy-Authorization`
/// (spec §4.5, "authenticate first"). A proxy with no authenticator
/// configured accepts everything.
fn authenticate<I: Inspector>(ctx: &ProxyContext<I>, request: &Request) -> Result<(), FlowError> {
    let Some(creds) = &ctx.config.authenticator else { return Ok(()) };
    let unauthorized = || FlowError::AuthRequired { challenge_headers: auth_challenge() };

    let header = request.headers.get_first("proxy-authorization").ok_or_else(unauthorized)?;
    let encoded = header.strip_prefix("Basic ").ok_or_else(unauthorized)?;
    let decoded = BASE64.decode(encoded.trim()).map_err(|_| unauthorized())?;
    let text = String::from_utf8(decoded).map_err(|_| unauthorized())?;
    let (user, pass) = text.split_once(':').ok_or_else(unauthorized)?;

    if user == creds.username && pass == creds.password {
        Ok(())
    } else {
        Err(unauthorized())
    }
}

/// Sends `request` upstream and reads the response, tolerating one
/// stale-connection failure (spec §4.6). At most two send attempts are
/// ever made; the second failure propagates.
async fn upstream_exchange<I: Inspector>(ctx: &mut ProxyContext<I>, request: &Request) -> Result<Response, FlowError> {
    match send_and_receive(ctx, request).await {
        Ok(resp) => Ok(resp),
        Err(FlowError::Transport(_)) => {
            ctx.server_reconnect(false).await?;
            send_and_receive(ctx, request).await
        }
        Err(e) => Err(e),
    }
}

async fn send_and_receive<I: Inspector>(ctx: &mut ProxyContext<I>, request: &Request) -> Result<Response, FlowError> {
    let bytes = request.assemble()?;
    let body_size_limit = ctx.config.body_size_limit;

    let server_conn = ctx.server_conn.as_mut().ok_or_else(|| FlowError::Transport("no server connection established".into()))?;
    write_all_and_flush(server_conn, &bytes).await.map_err(|e| FlowError::Transport(e.to_string()))?;

    // Capacity 1: avoids swallowing bytes of a subsequent pipelined
    // request or a TLS ClientHello that follows this response.
    let mut reader = BufReader::with_capacity(1, server_conn);
    Response::from_stream(&mut reader, &request.method, true, body_size_limit).await
}

/// The error-catch boundary (spec §4.8): records the error on the flow,
/// notifies the inspector, and attempts to synthesize and send a response.
/// Failure to send the synthetic response is swallowed; the flow always
/// terminates the connection.
async fn handle_error<I: Inspector>(ctx: &mut ProxyContext<I>, flow: &mut Flow, err: FlowError) -> Transition {
    flow.set_error(siphon_core::Error::new(err.to_string()));
    let _ = ctx.inspector.ask(Topic::Error, flow).await;

    if let Some(response) = error_synth::synthesize(&err, &ctx.config.server_version) {
        if let Ok(bytes) = response.assemble() {
            let _ = write_all_and_flush(ctx.client_mut(), &bytes).await;
        }
    }
    Transition::Done
}

/// Completes the CONNECT/TLS-upgrade sub-protocol (spec §4.7): switches to
/// `transparent` mode, establishes TLS on both sockets in place, and
/// installs the reconnect strategy that keeps future `server_reconnect`
/// calls honoring the tunnel (plain direct, or CONNECT-replay-then-TLS
/// through an upstream proxy).
async fn upgrade_to_tls<I: Inspector>(ctx: &mut ProxyContext<I>, target: &(String, u16), ca: &CertificateAuthority) -> Result<(), ProxyError> {
    ctx.mode = Mode::Transparent;

    let acceptor = ca.tls_acceptor_for(&target.0)?;
    ctx.upgrade_client_tls(acceptor).await?;

    let server_name = ServerName::try_from(target.0.clone())
        .map_err(|_| ProxyError::Flow(FlowError::InvalidRequest(format!("invalid server name: {}", target.0))))?;

    let conn = ctx
        .server_conn
        .take()
        .ok_or_else(|| ProxyError::Flow(FlowError::Transport("no server connection to upgrade".into())))?;
    let upgraded = conn.upgrade(upstream_tls_connector(), server_name.clone()).await?;
    ctx.server_conn = Some(upgraded);

    let strategy: Arc<dyn ReconnectStrategy> = match ctx.config.forward_proxy {
        Some(_) => {
            let connect_request = connect::build_connect_request(&target.0, target.1, &ctx.config.server_version);
            Arc::new(UpstreamProxyReconnect::new(Arc::new(PlainReconnect), connect_request, server_name))
        }
        None => Arc::new(DirectTlsReconnect::new(Arc::new(PlainReconnect), server_name)),
    };
    ctx.install_reconnect_strategy(strategy);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use siphon_core::form::HttpVersion;
    use siphon_core::Content;
    use siphon_inspect::LoggingInspector;
    use siphon_net::TcpClientConn;

    use crate::config::{Authenticator, ProxyConfig};

    fn sample_config(mode: Mode, authenticator: Option<Authenticator>) -> Arc<ProxyConfig> {
        Arc::new(ProxyConfig {
            listen_addr: "127.0.0.1:8080".parse::<SocketAddr>().unwrap(),
            mode,
            body_size_limit: None,
            forward_proxy: None,
            authenticator,
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

    fn sample_request(form_in: RequestForm, host: Option<&str>, port: Option<u16>) -> Request {
        Request {
            form_in,
            form_out: form_in,
            method: if form_in == RequestForm::Authority { "CONNECT".into() } else { "GET".into() },
            scheme: if form_in == RequestForm::Absolute { Some("http".into()) } else { None },
            host: host.map(String::from),
            port,
            path: if matches!(form_in, RequestForm::Origin | RequestForm::Absolute) { Some("/x".into()) } else { None },
            httpversion: HttpVersion::HTTP_11,
            headers: HeaderMap::new(),
            content: Content::Absent,
            timestamp_start: 0.0,
            timestamp_end: 0.0,
            stickycookie: false,
            stickyauth: false,
            is_replay: false,
        }
    }

    #[tokio::test]
    async fn no_authenticator_configured_always_passes() {
        let ctx = ProxyContext::new(loopback_client_conn().await, sample_config(Mode::Regular, None), Arc::new(LoggingInspector));
        let request = sample_request(RequestForm::Origin, None, None);
        assert!(authenticate(&ctx, &request).is_ok());
    }

    #[tokio::test]
    async fn missing_proxy_authorization_header_is_rejected() {
        let creds = Authenticator { username: "alice".into(), password: "secret".into() };
        let ctx = ProxyContext::new(loopback_client_conn().await, sample_config(Mode::Regular, Some(creds)), Arc::new(LoggingInspector));
        let request = sample_request(RequestForm::Origin, None, None);
        let err = authenticate(&ctx, &request).unwrap_err();
        assert!(matches!(err, FlowError::AuthRequired { .. }));
    }

    #[tokio::test]
    async fn correct_basic_credentials_are_accepted() {
        let creds = Authenticator { username: "alice".into(), password: "secret".into() };
        let ctx = ProxyContext::new(loopback_client_conn().await, sample_config(Mode::Regular, Some(creds)), Arc::new(LoggingInspector));
        let mut request = sample_request(RequestForm::Origin, None, None);
        let encoded = BASE64.encode(b"alice:secret");
        request.headers.add("Proxy-Authorization", format!("Basic {encoded}"));
        assert!(authenticate(&ctx, &request).is_ok());
    }

    #[tokio::test]
    async fn wrong_basic_credentials_are_rejected_with_challenge() {
        let creds = Authenticator { username: "alice".into(), password: "secret".into() };
        let ctx = ProxyContext::new(loopback_client_conn().await, sample_config(Mode::Regular, Some(creds)), Arc::new(LoggingInspector));
        let mut request = sample_request(RequestForm::Origin, None, None);
        let encoded = BASE64.encode(b"alice:wrong");
        request.headers.add("Proxy-Authorization", format!("Basic {encoded}"));
        let err = authenticate(&ctx, &request).unwrap_err();
        assert!(matches!(err, FlowError::AuthRequired { .. }));
    }

    #[tokio::test]
    async fn origin_form_in_regular_mode_is_rejected() {
        let mut ctx = ProxyContext::new(loopback_client_conn().await, sample_config(Mode::Regular, None), Arc::new(LoggingInspector));
        let mut flow = Flow::new(1, client_snapshot(&ctx), None);
        flow.set_request(sample_request(RequestForm::Origin, None, None));

        let err = process_request(&mut ctx, &mut flow).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn absolute_form_with_non_http_scheme_is_rejected() {
        let mut ctx = ProxyContext::new(loopback_client_conn().await, sample_config(Mode::Regular, None), Arc::new(LoggingInspector));
        let mut flow = Flow::new(1, client_snapshot(&ctx), None);
        let mut request = sample_request(RequestForm::Absolute, Some("example.com"), Some(443));
        request.scheme = Some("ftp".into());
        flow.set_request(request);

        let err = process_request(&mut ctx, &mut flow).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidRequest(_)));
    }

    #[test]
    fn clean_disconnect_is_recognized() {
        assert!(is_clean_disconnect(&FlowError::Transport("connection closed".into())));
        assert!(!is_clean_disconnect(&FlowError::Transport("connection reset by peer".into())));
    }
}
