//! TLS server configuration
//!
//! Exactly one protocol version (TLS 1.2) and one cipher suite
//! (`TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256`) are enabled. There is no
//! negotiation fallback: a client that cannot speak this pair is refused
//! during the TLS handshake.

use super::TransportError;
use rustls::crypto::{ring as ring_provider, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// `ring` provider reduced to the single supported cipher suite
pub fn pinned_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![ring_provider::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256],
        ..ring_provider::default_provider()
    }
}

/// Load TLS certificate chain from PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path).map_err(|e| {
        TransportError::Certificate(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate(format!("Failed to parse PEM certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TransportError::Certificate(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    info!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load TLS private key from PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path).map_err(|e| {
        TransportError::Certificate(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TransportError::Certificate(format!("Failed to parse PEM private key: {}", e)))?
        .ok_or_else(|| {
            TransportError::Certificate(format!("No private key found in {}", path.display()))
        })
}

/// Build the pinned server configuration
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, TransportError> {
    ServerConfig::builder_with_provider(Arc::new(pinned_provider()))
        .with_protocol_versions(&[&rustls::version::TLS12])
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))
}

/// Load certificate and key from disk and build the acceptor
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = build_server_config(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
