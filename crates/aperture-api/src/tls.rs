//! rustls configuration for the extension server
//!
//! The serving identity comes from the [`CertificateRotator`] through an
//! [`SniResolver`]. Client certificates are optional and verified against
//! the union of CA bundles contributed by the currently enabled
//! authenticators, so toggling an authenticator changes which client
//! certificates the handshake accepts without rebuilding the config.

use std::fmt;
use std::sync::Arc;

use aperture_auth::AuthenticatorRegistry;
use aperture_pki::{CertificateRotator, SniResolver};
use parking_lot::Mutex;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use tracing::{debug, warn};

use crate::error::{Error, Result};

type CachedVerifier = (String, Arc<dyn ClientCertVerifier>);

/// Client certificate verifier over the registry's CA union
///
/// The webpki verifier for a given CA set is built once and reused until the
/// set's fingerprint changes.
pub struct UnionClientVerifier {
    registry: Arc<AuthenticatorRegistry>,
    provider: Arc<CryptoProvider>,
    cache: Mutex<Option<CachedVerifier>>,
}

impl fmt::Debug for UnionClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnionClientVerifier")
            .field("cached", &self.cache.lock().as_ref().map(|(fp, _)| fp.clone()))
            .finish()
    }
}

impl UnionClientVerifier {
    /// Verifier reading CAs from `registry`
    pub fn new(registry: Arc<AuthenticatorRegistry>, provider: Arc<CryptoProvider>) -> Self {
        Self {
            registry,
            provider,
            cache: Mutex::new(None),
        }
    }

    /// Webpki verifier for the current union, `None` when it is empty
    fn current(&self) -> std::result::Result<Option<Arc<dyn ClientCertVerifier>>, rustls::Error> {
        let bundle = self.registry.client_ca_certificates();
        if bundle.is_empty() {
            return Ok(None);
        }
        let fingerprint = bundle.fingerprint();

        let mut cache = self.cache.lock();
        if let Some((cached, verifier)) = cache.as_ref() {
            if *cached == fingerprint {
                return Ok(Some(verifier.clone()));
            }
        }

        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(bundle.certificates());
        if ignored > 0 {
            warn!(ignored, "client CA certificates rejected by the root store");
        }
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), self.provider.clone())
                .allow_unauthenticated()
                .build()
                .map_err(|e| rustls::Error::General(format!("client verifier: {}", e)))?;

        debug!(fingerprint = %fingerprint, roots = added, "rebuilt client certificate verifier");
        *cache = Some((fingerprint, verifier.clone()));
        Ok(Some(verifier))
    }
}

impl ClientCertVerifier for UnionClientVerifier {
    fn offer_client_auth(&self) -> bool {
        !self.registry.client_ca_certificates().is_empty()
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        match self.current()? {
            Some(verifier) => verifier.verify_client_cert(end_entity, intermediates, now),
            None => Err(rustls::Error::General(
                "no client certificate authorities configured".to_string(),
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Server config serving the rotator's identity and verifying client
/// certificates against the registry
pub fn server_config(
    rotator: Arc<CertificateRotator>,
    registry: Arc<AuthenticatorRegistry>,
) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = Arc::new(UnionClientVerifier::new(registry, provider.clone()));

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Internal(format!("TLS config error: {}", e)))?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(Arc::new(SniResolver::new(rotator)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_auth::{DynamicCaBundle, X509Authenticator};
    use aperture_common::MemorySecretStore;
    use aperture_pki::{parse_pem, CaBundle, CertificateAuthority, RotatorConfig};

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::aws_lc_rs::default_provider())
    }

    fn client_cert(ca: &CertificateAuthority, cn: &str) -> CertificateDer<'static> {
        let (cert_pem, _key) = ca.issue_client_cert(cn, None).unwrap();
        CertificateDer::from(parse_pem(&cert_pem).unwrap())
    }

    fn registry_trusting(ca: &CertificateAuthority) -> (Arc<AuthenticatorRegistry>, Arc<DynamicCaBundle>) {
        let trust = Arc::new(DynamicCaBundle::new(
            "client-ca",
            CaBundle::from_pem(ca.ca_cert_pem()).unwrap(),
        ));
        let registry = Arc::new(AuthenticatorRegistry::new());
        registry.add("x509", X509Authenticator::evaluator(trust.clone(), None), true);
        (registry, trust)
    }

    #[test]
    fn empty_union_offers_no_client_auth() {
        let verifier = UnionClientVerifier::new(Arc::new(AuthenticatorRegistry::new()), provider());
        assert!(!verifier.offer_client_auth());
        assert!(!verifier.client_auth_mandatory());

        let ca = CertificateAuthority::new("stray-ca").unwrap();
        assert!(verifier
            .verify_client_cert(&client_cert(&ca, "alice"), &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn verifies_against_enabled_authenticators() {
        let ca = CertificateAuthority::new("client-ca").unwrap();
        let other = CertificateAuthority::new("other-ca").unwrap();
        let (registry, _) = registry_trusting(&ca);
        let verifier = UnionClientVerifier::new(registry.clone(), provider());

        assert!(verifier.offer_client_auth());
        assert!(verifier
            .verify_client_cert(&client_cert(&ca, "alice"), &[], UnixTime::now())
            .is_ok());
        assert!(verifier
            .verify_client_cert(&client_cert(&other, "mallory"), &[], UnixTime::now())
            .is_err());

        registry.set_enabled("x509", false).unwrap();
        assert!(!verifier.offer_client_auth());
    }

    #[test]
    fn rebuilds_when_trust_changes() {
        let ca = CertificateAuthority::new("client-ca").unwrap();
        let next = CertificateAuthority::new("next-ca").unwrap();
        let (registry, trust) = registry_trusting(&ca);
        let verifier = UnionClientVerifier::new(registry, provider());

        let before = client_cert(&next, "bob");
        assert!(verifier.verify_client_cert(&before, &[], UnixTime::now()).is_err());
        let first = verifier.cache.lock().as_ref().map(|(fp, _)| fp.clone());

        trust.replace(CaBundle::from_pem(next.ca_cert_pem()).unwrap());
        assert!(verifier.verify_client_cert(&before, &[], UnixTime::now()).is_ok());
        let second = verifier.cache.lock().as_ref().map(|(fp, _)| fp.clone());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn server_config_advertises_h2_and_http11() {
        let rotator = Arc::new(
            CertificateRotator::new(
                RotatorConfig::new("aperture-system", "serving-cert", vec!["localhost".to_string()]),
                Arc::new(MemorySecretStore::new()),
            )
            .await,
        );
        let config = server_config(rotator, Arc::new(AuthenticatorRegistry::new())).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
