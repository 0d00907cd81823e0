//! Self-signed CA for transparently issuing leaf certificates on the
//! client-facing side of a CONNECT tunnel, and the upstream-facing client
//! config for verifying real server certificates, built on `rcgen` and
//! `rustls`/`tokio-rustls`.

use std::sync::Arc;

use rcgen::{Certificate, CertificateParams, DnType, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::TransportError;

/// A self-signed root certificate plus its key, used to mint per-host leaf
/// certificates on demand.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl CertificateAuthority {
    pub fn generate() -> Result<Self, TransportError> {
        let ca_key = KeyPair::generate().map_err(|e| TransportError::CertGeneration(e.to_string()))?;
        let mut params = CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "siphon proxy CA");
        params.distinguished_name.push(DnType::OrganizationName, "siphon");
        let ca_cert = params.self_signed(&ca_key).map_err(|e| TransportError::CertGeneration(e.to_string()))?;
        Ok(Self { ca_cert, ca_key })
    }

    /// Issues a leaf certificate for `host`, signed by this CA, returning a
    /// `(leaf_cert, leaf_key)` pair suitable for
    /// `rustls::ServerConfig::with_single_cert` (the CA cert is appended
    /// separately to complete the chain).
    pub fn issue_for(&self, host: &str) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), TransportError> {
        let leaf_key = KeyPair::generate().map_err(|e| TransportError::CertGeneration(e.to_string()))?;
        let mut params = CertificateParams::new(vec![host.to_string()]).map_err(|e| TransportError::CertGeneration(e.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, host);
        let cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| TransportError::CertGeneration(e.to_string()))?;
        let leaf_der = cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        Ok((leaf_der, key_der))
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        self.ca_cert.der()
    }

    /// Builds a `TlsAcceptor` presenting a freshly issued certificate for
    /// `host` to the client.
    pub fn tls_acceptor_for(&self, host: &str) -> Result<tokio_rustls::TlsAcceptor, TransportError> {
        let (leaf, key) = self.issue_for(host)?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf, self.ca_cert_der().clone()], key)
            .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;
        Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
    }
}

/// A `TlsConnector` that verifies upstream servers against the Mozilla root
/// set shipped by `webpki-roots`.
pub fn upstream_tls_connector() -> tokio_rustls::TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_a_leaf_cert_for_a_host() {
        let ca = CertificateAuthority::generate().unwrap();
        let (leaf, _key) = ca.issue_for("example.com").unwrap();
        assert!(!leaf.as_ref().is_empty());
    }

    #[test]
    fn builds_a_tls_acceptor_for_a_host() {
        let ca = CertificateAuthority::generate().unwrap();
        assert!(ca.tls_acceptor_for("example.com").is_ok());
    }
}
