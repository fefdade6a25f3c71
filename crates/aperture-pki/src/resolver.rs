//! rustls certificate resolver backed by the rotator

use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, warn};

use crate::rotator::CertificateRotator;

/// Serves the rotator's current certificate on every handshake
///
/// Rotation is picked up by the next handshake without rebuilding the rustls
/// config. Unknown SNI names are served the same certificate.
#[derive(Debug, Clone)]
pub struct SniResolver {
    rotator: Arc<CertificateRotator>,
}

impl SniResolver {
    /// Resolver reading from `rotator`
    pub fn new(rotator: Arc<CertificateRotator>) -> Self {
        Self { rotator }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(cert) = self.rotator.current() else {
            warn!("TLS handshake before a serving certificate is available");
            return None;
        };
        if let Some(name) = client_hello.server_name() {
            if !cert.matches_name(name) {
                debug!(server_name = %name, "no certificate for requested name, serving default");
            }
        }
        Some(cert.certified_key())
    }
}
