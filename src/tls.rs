//! TLS setup for both ends of the tunnel.
//!
//! Mutual TLS with a shared CA: each end presents a certificate and verifies
//! the peer against the configured CA bundle. The server accepts connections
//! without a client certificate at the TLS layer and rejects them at the
//! application layer with an HTTP 403, so misconfigured clients get a
//! readable error instead of a bare handshake alert.
//!
//! TLS 1.2 is pinned to ECDHE + AES-128-GCM with X25519 preferred (P-384 and
//! P-256 allowed for compatibility); TLS 1.3 uses the stack's AES-128-GCM
//! suite.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::config::TlsConfig;
use crate::error::{Error, Result};

fn provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![
            ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
            ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ],
        kx_groups: vec![
            ring::kx_group::X25519,
            ring::kx_group::SECP384R1,
            ring::kx_group::SECP256R1,
        ],
        ..ring::default_provider()
    }
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("failed to open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a PEM private key (PKCS#8, PKCS#1, or SEC1).
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("failed to open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", path.display())))
}

/// Load a PEM CA bundle into a root store.
pub fn load_ca(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Build the server-side TLS configuration.
pub fn server_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(&tls.cert)?;
    let key = load_key(&tls.key)?;
    let roots = load_ca(&tls.ca)?;
    let provider = Arc::new(provider());

    // Verify client certs when presented; absence is handled after the
    // handshake with an HTTP 403.
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .allow_unauthenticated()
        .build()
        .map_err(|e| Error::Config(format!("client certificate verifier: {e}")))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Build the client-side TLS configuration.
///
/// The server is verified against the configured CA only; there is no
/// insecure skip-verify escape hatch.
pub fn client_config(tls: &TlsConfig) -> Result<Arc<ClientConfig>> {
    let certs = load_certs(&tls.cert)?;
    let key = load_key(&tls.key)?;
    let roots = load_ca(&tls.ca)?;

    let config = ClientConfig::builder_with_provider(Arc::new(provider()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Extract the authenticated identity from the peer's leaf certificate: the
/// subject common name.
pub fn peer_name(certs: &[CertificateDer<'_>]) -> Result<String> {
    use x509_parser::prelude::*;

    let leaf = certs.first().ok_or(Error::NoPeerCert)?;
    let (_, cert) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| Error::BadPeerCert(format!("certificate parse: {e}")))?;

    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(ToString::to_string)
        .ok_or_else(|| Error::BadPeerCert("no common name in subject".into()))?;
    Ok(name)
}
