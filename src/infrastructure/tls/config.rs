/// TLS client configuration for SIP over TLS and secure WebSocket
use crate::infrastructure::protocols::sip::SipError;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::info;

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to CA certificate bundle (PEM) used to verify peers
    pub ca_bundle_path: Option<PathBuf>,

    /// Override for the SNI / verification name (defaults to the target host)
    pub server_name: Option<String>,
}

impl TlsConfig {
    /// Set CA bundle path
    pub fn with_ca_bundle(mut self, ca_path: PathBuf) -> Self {
        self.ca_bundle_path = Some(ca_path);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if let Some(ref path) = self.ca_bundle_path {
            if !path.exists() {
                return Err(format!("CA bundle not found: {:?}", path));
            }
        }
        Ok(())
    }

    /// Build a connector; `None` when no CA bundle is configured.
    pub fn connector(&self) -> Result<Option<TlsConnector>, SipError> {
        let Some(ref path) = self.ca_bundle_path else {
            return Ok(None);
        };
        self.validate().map_err(SipError::TransportError)?;

        let mut roots = RootCertStore::empty();
        for cert in load_certificates(path)? {
            roots
                .add(cert)
                .map_err(|e| SipError::TransportError(format!("bad CA certificate: {}", e)))?;
        }
        info!("Loaded {} CA certificate(s) from {:?}", roots.len(), path);

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Some(TlsConnector::from(Arc::new(config))))
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, SipError> {
    let file = File::open(path)
        .map_err(|e| SipError::TransportError(format!("open {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SipError::TransportError(format!("read {:?}: {}", path, e)))
}
