//! TLS wrapping for broker connections.
//!
//! The protocol layer never sees the handshake: accepted or dialled sockets
//! are wrapped here and handed on as plain byte streams.

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::fs;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::config::TlsConfig;
use crate::error::{Error, Result};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

async fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(Error::Tls(format!("{what} not found: {}", path.display())));
    }
    Ok(fs::read(path).await?)
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificates found".to_string()));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| Error::Tls(format!("failed to parse private key: {e}")))
}

async fn load_roots(path: &Path) -> Result<RootCertStore> {
    let pem = read_pem(path, "CA certificate").await?;
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(&pem)? {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("failed to add CA certificate: {e}")))?;
    }
    Ok(roots)
}

async fn load_identity(
    config: &TlsConfig,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
    match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = parse_certificates(&read_pem(cert_path, "certificate").await?)?;
            let key = parse_private_key(&read_pem(key_path, "private key").await?)?;
            Ok(Some((certs, key)))
        }
        (None, None) => Ok(None),
        _ => Err(Error::Tls(
            "certificate and private key must be configured together".to_string(),
        )),
    }
}

/// Build an acceptor for inbound connections.
///
/// Requires a certificate and key. With a CA configured, clients must
/// present a certificate signed by it.
///
/// # Errors
///
/// Returns an error if any file is missing or unparsable.
pub async fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let (certs, key) = load_identity(config)
        .await?
        .ok_or_else(|| Error::Tls("server certificate and key are required".to_string()))?;

    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("server config error: {e}")))?;

    let server_config = match &config.ca_cert_path {
        Some(ca_path) => {
            let roots = load_roots(ca_path).await?;
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
                .build()
                .map_err(|e| Error::Tls(format!("client verifier error: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| Error::Tls(format!("server config error: {e}")))?;

    debug!("TLS acceptor ready");
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Build a connector for outbound connections.
///
/// Requires a CA to verify the server; a certificate and key are sent as
/// client identity when configured.
///
/// # Errors
///
/// Returns an error if any file is missing or unparsable.
pub async fn connector(config: &TlsConfig) -> Result<TlsConnector> {
    let ca_path = config
        .ca_cert_path
        .as_ref()
        .ok_or_else(|| Error::Tls("CA certificate path not configured".to_string()))?;
    let roots = load_roots(ca_path).await?;

    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("client config error: {e}")))?
        .with_root_certificates(roots);

    let client_config = match load_identity(config).await? {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::Tls(format!("client config error: {e}")))?,
        None => builder.with_no_client_auth(),
    };

    debug!("TLS connector ready");
    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Name used to verify the server certificate
///
/// # Errors
///
/// Returns an error if `host` is neither an IP address nor a DNS name.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name {host}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_acceptor_requires_identity() {
        let result = acceptor(&TlsConfig::default()).await;
        assert!(matches!(result, Err(Error::Tls(_))));
    }

    #[tokio::test]
    async fn test_connector_requires_ca() {
        let result = connector(&TlsConfig::default()).await;
        assert!(matches!(result, Err(Error::Tls(_))));
    }

    #[tokio::test]
    async fn test_missing_file_reported() {
        let cfg = TlsConfig {
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            cert_path: None,
            key_path: None,
        };
        let err = connector(&cfg).await.err().unwrap();
        assert!(err.to_string().contains("CA certificate not found"));
    }

    #[tokio::test]
    async fn test_half_identity_rejected() {
        let cfg = TlsConfig {
            ca_cert_path: None,
            cert_path: Some(PathBuf::from("/cert.pem")),
            key_path: None,
        };
        let result = acceptor(&cfg).await;
        assert!(matches!(result, Err(Error::Tls(_))));
    }

    #[test]
    fn test_server_name_accepts_ip_and_dns() {
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("localhost").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
