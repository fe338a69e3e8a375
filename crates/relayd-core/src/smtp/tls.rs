//! STARTTLS support

use relayd_common::config::TlsConfig;
use relayd_common::{Error, Result};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Build a TLS acceptor from the configured certificate chain and key
pub fn create_tls_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_file = File::open(&tls_config.cert_path)
        .map_err(|e| Error::Config(format!("Failed to open certificate file: {}", e)))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(Error::Config(
            "No certificates found in certificate file".to_string(),
        ));
    }

    info!(count = certs.len(), "Loaded TLS certificates");

    let key_file = File::open(&tls_config.key_path)
        .map_err(|e| Error::Config(format!("Failed to open key file: {}", e)))?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)
        .map_err(|e| Error::Config(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| Error::Config("No private key found in key file".to_string()))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("Failed to create TLS config: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
