//! rustls client configuration for the tls transport.
//!
//! The server is verified against the configured `ssl_ca` bundle only; system
//! roots are deliberately not consulted, as shipping targets are private
//! aggregators with operator-managed CAs. A client certificate/key pair is
//! presented when configured, enabling mutual authentication.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};

use crate::config::Config;
use crate::transport::TransportError;

/// Builds the rustls client configuration from the agent configuration.
///
/// Fails when the CA bundle is missing, unreadable, or contains no
/// certificates, or when the client pair cannot be loaded. These are startup
/// errors, not connection errors.
pub fn client_config(config: &Config) -> Result<Arc<ClientConfig>, TransportError> {
    let ca_path = config
        .ssl_ca
        .as_ref()
        .ok_or_else(|| TransportError::TlsSetup("ssl_ca is not configured".into()))?;

    let mut roots = RootCertStore::empty();
    for cert in read_certs(ca_path)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::TlsSetup(format!("bad CA certificate: {e}")))?;
    }
    if roots.is_empty() {
        return Err(TransportError::TlsSetup(format!(
            "no certificates found in {}",
            ca_path.display()
        )));
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let tls = match (&config.ssl_certificate, &config.ssl_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = read_certs(cert_path)?;
            let key = read_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TransportError::TlsSetup(format!("bad client certificate: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(tls))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsSetup(format!("failed to open {}: {e}", path.display()))
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsSetup(format!("failed to parse {}: {e}", path.display())))
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsSetup(format!("failed to open {}: {e}", path.display()))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TransportError::TlsSetup(format!("failed to parse {}: {e}", path.display())))?
        .ok_or_else(|| {
            TransportError::TlsSetup(format!("no private key found in {}", path.display()))
        })
}
