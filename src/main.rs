use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use siphon_inspect::LoggingInspector;
use siphon_net::{CertificateAuthority, TcpClientConn};
use siphon_proxy::{Authenticator, Mode, ProxyConfig, ProxyContext};

#[derive(Parser)]
#[command(name = "siphon", about = "intercepting HTTP/1.x proxy", version)]
struct Cli {
    /// TOML config file; overrides the flags below when given
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Operating mode
    #[arg(long, value_enum, default_value = "regular")]
    mode: CliMode,

    /// A second HTTP proxy this proxy itself forwards through
    #[arg(long)]
    forward_proxy: Option<SocketAddr>,

    /// Require Basic auth, given as username:password
    #[arg(long)]
    auth: Option<String>,

    /// Cap buffered request/response bodies, in bytes
    #[arg(long)]
    body_size_limit: Option<usize>,

    /// Write the generated CA certificate (PEM) here for clients to trust
    #[arg(long, default_value = "siphon-ca.pem")]
    ca_cert_out: PathBuf,
}

#[derive(clap::ValueEnum, Clone, Copy)]
enum CliMode {
    Regular,
    Transparent,
    Upstream,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Regular => Mode::Regular,
            CliMode::Transparent => Mode::Transparent,
            CliMode::Upstream => Mode::Upstream,
        }
    }
}

fn build_config(cli: &Cli) -> anyhow::Result<ProxyConfig> {
    if let Some(path) = &cli.config {
        return ProxyConfig::from_toml_file(path);
    }

    let authenticator = cli
        .auth
        .as_deref()
        .map(|raw| {
            let (username, password) =
                raw.split_once(':').ok_or_else(|| anyhow::anyhow!("--auth expects username:password"))?;
            Ok::<_, anyhow::Error>(Authenticator { username: username.to_string(), password: password.to_string() })
        })
        .transpose()?;

    Ok(ProxyConfig {
        listen_addr: cli.listen,
        mode: cli.mode.into(),
        body_size_limit: cli.body_size_limit,
        forward_proxy: cli.forward_proxy,
        authenticator,
        server_version: format!("siphon/{}", env!("CARGO_PKG_VERSION")),
    })
}

/// Wraps `der` as a base64 PEM block. `rustls-pemfile` only reads PEM; the
/// CA cert is written once at startup so a minimal encoder is enough here.
fn to_pem(der: &[u8], label: &str) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let encoded = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 alphabet is ASCII"));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

fn write_ca_cert(ca: &CertificateAuthority, path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, to_pem(ca.ca_cert_der(), "CERTIFICATE"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = Arc::new(build_config(&cli)?);

    let ca = Arc::new(CertificateAuthority::generate()?);
    write_ca_cert(&ca, &cli.ca_cert_out)?;
    tracing::info!(path = %cli.ca_cert_out.display(), "wrote CA certificate");

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, mode = ?config.mode, "siphon listening");

    let inspector = Arc::new(LoggingInspector);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let config = config.clone();
        let inspector = inspector.clone();
        let ca = ca.clone();

        tokio::spawn(async move {
            let client_conn = TcpClientConn::new(stream, peer_addr);
            let mut ctx = ProxyContext::new(client_conn, config, inspector);
            siphon_proxy::run_connection(&mut ctx, &ca).await;
        });
    }
}
