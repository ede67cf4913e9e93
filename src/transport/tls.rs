//! TLS Material Loading
//!
//! Mutual TLS 1.3 for the node-to-node transport. The server side requires
//! client certificates whenever a CA bundle is configured; the client side
//! pins the same CA and presents its own identity. Plaintext transport is
//! only possible when TLS is disabled in configuration.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

use super::types::TransportError;
use crate::config::TlsConfig;

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("cannot open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("cannot parse {}: {}", path, e)))
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("cannot open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("cannot parse {}: {}", path, e)))?
        .ok_or_else(|| TransportError::Tls(format!("no private key in {}", path)))
}

/// Build the rustls server config: TLS 1.3 only, mutual auth when a CA
/// bundle is present
pub fn server_config(tls: &TlsConfig) -> Result<ServerConfig, TransportError> {
    let certs = load_certs(&tls.cert_file)?;
    let key = load_private_key(&tls.key_file)?;

    let builder = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);

    let config = match &tls.ca_cert_file {
        Some(ca_file) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_file)? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(format!("bad CA certificate: {}", e)))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TransportError::Tls(format!("client verifier: {}", e)))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    }
    .with_single_cert(certs, key)
    .map_err(|e| TransportError::Tls(format!("server certificate: {}", e)))?;

    Ok(config)
}

/// Build the reqwest client for node-to-node calls, with identity and
/// pinned CA when TLS is enabled
pub fn http_client(
    tls: Option<&TlsConfig>,
    timeout: std::time::Duration,
) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if let Some(tls) = tls {
        builder = builder
            .use_rustls_tls()
            .min_tls_version(reqwest::tls::Version::TLS_1_3);

        if let Some(ca_file) = &tls.ca_cert_file {
            let ca_pem = std::fs::read(ca_file)
                .map_err(|e| TransportError::Tls(format!("cannot read {}: {}", ca_file, e)))?;
            let certificate = reqwest::Certificate::from_pem(&ca_pem)
                .map_err(|e| TransportError::Tls(format!("bad CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(certificate);
        }

        let mut identity_pem = std::fs::read(&tls.cert_file)
            .map_err(|e| TransportError::Tls(format!("cannot read {}: {}", tls.cert_file, e)))?;
        let key_pem = std::fs::read(&tls.key_file)
            .map_err(|e| TransportError::Tls(format!("cannot read {}: {}", tls.key_file, e)))?;
        identity_pem.extend_from_slice(&key_pem);
        let identity = reqwest::Identity::from_pem(&identity_pem)
            .map_err(|e| TransportError::Tls(format!("client identity: {}", e)))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| TransportError::Http(e.to_string()))
}
