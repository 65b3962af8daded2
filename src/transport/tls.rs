//! TLS material loading and rustls configuration.
//!
//! The server loads its material from a directory holding `cert.pem`,
//! `key.pem`, and optionally `ca.pem` (enabling mTLS). The client loads a
//! CA bundle plus an optional client certificate pair.

use crate::core::error::{ShuffleError, ShuffleResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Install the process-wide crypto provider; safe to call repeatedly.
fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Server-side TLS material.
#[derive(Debug, Clone)]
pub struct ServerTlsConfig {
    /// PEM certificate chain.
    pub cert_chain_pem: Vec<u8>,
    /// PEM private key.
    pub key_pem: Vec<u8>,
    /// PEM client CA bundle; presence enables mTLS.
    pub client_ca_pem: Option<Vec<u8>>,
}

impl ServerTlsConfig {
    /// Load material from a directory: `cert.pem`, `key.pem`, and
    /// optionally `ca.pem`.
    pub fn from_dir(dir: impl AsRef<Path>) -> ShuffleResult<Self> {
        let dir = dir.as_ref();
        let cert_chain_pem = read_pem(&dir.join("cert.pem"))?;
        let key_pem = read_pem(&dir.join("key.pem"))?;
        let ca_path = dir.join("ca.pem");
        let client_ca_pem = if ca_path.exists() {
            Some(read_pem(&ca_path)?)
        } else {
            None
        };
        Ok(Self {
            cert_chain_pem,
            key_pem,
            client_ca_pem,
        })
    }

    /// Build a TLS acceptor from this material.
    pub fn acceptor(&self) -> ShuffleResult<TlsAcceptor> {
        ensure_crypto_provider();
        let certs = load_certs_from_pem(&self.cert_chain_pem)?;
        let key = load_private_key_from_pem(&self.key_pem)?;

        let config = match &self.client_ca_pem {
            Some(ca_pem) => {
                let mut roots = rustls::RootCertStore::empty();
                for cert in load_certs_from_pem(ca_pem)? {
                    roots.add(cert).map_err(|e| ShuffleError::Tls {
                        detail: format!("failed to add client CA cert: {e}"),
                    })?;
                }
                let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| ShuffleError::Tls {
                        detail: format!("failed to build client verifier: {e}"),
                    })?;
                rustls::ServerConfig::builder()
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
            }
            None => rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key),
        }
        .map_err(|e| ShuffleError::Tls {
            detail: format!("failed to build server config: {e}"),
        })?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Client-side TLS material.
#[derive(Debug, Clone)]
pub struct ClientTlsConfig {
    /// PEM CA bundle used to verify the server.
    pub ca_pem: Vec<u8>,
    /// PEM client certificate chain, for mTLS.
    pub cert_chain_pem: Option<Vec<u8>>,
    /// PEM client private key, for mTLS.
    pub key_pem: Option<Vec<u8>>,
}

impl ClientTlsConfig {
    /// Load material from a directory: `ca.pem`, and optionally
    /// `cert.pem` + `key.pem`.
    pub fn from_dir(dir: impl AsRef<Path>) -> ShuffleResult<Self> {
        let dir = dir.as_ref();
        let ca_pem = read_pem(&dir.join("ca.pem"))?;
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        let (cert_chain_pem, key_pem) = if cert_path.exists() && key_path.exists() {
            (Some(read_pem(&cert_path)?), Some(read_pem(&key_path)?))
        } else {
            (None, None)
        };
        Ok(Self {
            ca_pem,
            cert_chain_pem,
            key_pem,
        })
    }

    /// Build a TLS connector from this material.
    pub fn connector(&self) -> ShuffleResult<TlsConnector> {
        ensure_crypto_provider();
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs_from_pem(&self.ca_pem)? {
            roots.add(cert).map_err(|e| ShuffleError::Tls {
                detail: format!("failed to add CA cert: {e}"),
            })?;
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        let config = match (&self.cert_chain_pem, &self.key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let certs = load_certs_from_pem(cert_pem)?;
                let key = load_private_key_from_pem(key_pem)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| ShuffleError::Tls {
                        detail: format!("failed to set client cert: {e}"),
                    })?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(TlsConnector::from(Arc::new(config)))
    }
}

/// Parse the server name for a TLS handshake, accepting IP literals.
pub fn server_name(host: &str) -> ShuffleResult<ServerName<'static>> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|e| ShuffleError::Tls {
        detail: format!("invalid server name '{host}': {e}"),
    })
}

/// Parse every certificate in a PEM bundle.
pub fn load_certs_from_pem(pem: &[u8]) -> ShuffleResult<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    let mut cursor = std::io::Cursor::new(pem);
    while let Ok(Some(item)) = rustls_pemfile::read_one(&mut cursor) {
        if let rustls_pemfile::Item::X509Certificate(cert) = item {
            certs.push(cert);
        }
    }
    if certs.is_empty() {
        return Err(ShuffleError::Tls {
            detail: "no certificates found in PEM".to_string(),
        });
    }
    Ok(certs)
}

/// Parse the first private key in a PEM bundle.
pub fn load_private_key_from_pem(pem: &[u8]) -> ShuffleResult<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    while let Ok(Some(item)) = rustls_pemfile::read_one(&mut cursor) {
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }
    Err(ShuffleError::Tls {
        detail: "no private key found in PEM".to_string(),
    })
}

fn read_pem(path: &Path) -> ShuffleResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| ShuffleError::Tls {
        detail: format!("failed to read {}: {e}", path.display()),
    })
}
