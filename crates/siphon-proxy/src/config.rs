//! Static configuration: a `serde`-`Deserialize` struct loadable from TOML,
//! covering the settings the context contract needs (`body_size_limit`,
//! `authenticator`, `forward_proxy`, `server_version`).

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

/// Operating mode (spec.md §6, "mode (`regular` | `transparent` |
/// `upstream`)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Regular,
    Transparent,
    Upstream,
}

/// Credentials consulted by `Context::authenticate` in `regular` mode
/// (spec §4.5, "consult the configured authenticator on request headers").
#[derive(Debug, Clone, Deserialize)]
pub struct Authenticator {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,

    #[serde(default)]
    pub mode: Mode,

    /// Caps buffered request/response bodies (spec §5, "Body size limit").
    #[serde(default)]
    pub body_size_limit: Option<usize>,

    /// A second HTTP proxy this proxy itself forwards through (spec §4.7,
    /// "Upstream-proxy variant").
    #[serde(default)]
    pub forward_proxy: Option<SocketAddr>,

    #[serde(default)]
    pub authenticator: Option<Authenticator>,

    #[serde(default = "default_server_version")]
    pub server_version: String,
}

fn default_server_version() -> String {
    format!("siphon/{}", env!("CARGO_PKG_VERSION"))
}

impl ProxyConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_regular_mode_with_server_version() {
        let cfg = ProxyConfig::from_toml_str("listen_addr = \"127.0.0.1:8080\"\n").unwrap();
        assert_eq!(cfg.mode, Mode::Regular);
        assert!(cfg.server_version.starts_with("siphon/"));
        assert!(cfg.forward_proxy.is_none());
    }

    #[test]
    fn parses_forward_proxy_and_body_limit() {
        let toml = r#"
            listen_addr = "127.0.0.1:8080"
            mode = "upstream"
            body_size_limit = 1048576
            forward_proxy = "10.0.0.1:3128"
        "#;
        let cfg = ProxyConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.mode, Mode::Upstream);
        assert_eq!(cfg.body_size_limit, Some(1048576));
        assert!(cfg.forward_proxy.is_some());
    }
}
