//! Client certificate authentication
//!
//! The TLS layer stores the peer's certificate chain on each request as a
//! [`ClientCertChain`] extension. [`X509Authenticator`] checks the leaf
//! against a [`DynamicCaBundle`] and maps the subject to an identity: the
//! Common Name becomes the username, each Organization a group.

use std::sync::Arc;

use aperture_common::UserIdentity;
use aperture_pki::CaBundle;
use async_trait::async_trait;
use http::request::Parts;
use rustls::pki_types::CertificateDer;
use tracing::debug;

use crate::authenticator::{Authenticator, CaContentProvider, Evaluator, TrustRefresher};
use crate::error::{AuthError, Result};
use crate::trust::DynamicCaBundle;

/// Client certificate chain extracted from the TLS connection
///
/// Stored as a request extension, leaf first.
#[derive(Clone, Debug, Default)]
pub struct ClientCertChain(pub Vec<Vec<u8>>);

impl ClientCertChain {
    /// Create from certificate DER bytes
    pub fn new(certs: Vec<Vec<u8>>) -> Self {
        Self(certs)
    }

    /// Check if any certificates were provided
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The end-entity certificate
    pub fn leaf(&self) -> Option<&[u8]> {
        self.0.first().map(Vec::as_slice)
    }

    /// Convert to CertificateDer for parsing
    pub fn to_certificate_der(&self) -> Vec<CertificateDer<'static>> {
        self.0
            .iter()
            .map(|bytes| CertificateDer::from(bytes.clone()))
            .collect()
    }
}

/// Verify the leaf of the request's client chain against `trust`
///
/// `Ok(None)` when there is no chain or nothing to verify against.
pub(crate) fn verified_subject(
    request: &Parts,
    trust: &CaBundle,
) -> Result<Option<aperture_pki::VerifiedSubject>> {
    let Some(leaf) = request
        .extensions
        .get::<ClientCertChain>()
        .and_then(ClientCertChain::leaf)
    else {
        return Ok(None);
    };
    if trust.is_empty() {
        return Ok(None);
    }
    trust
        .verify(leaf)
        .map(Some)
        .map_err(|e| AuthError::Unauthorized(e.to_string()))
}

/// Authenticates requests by their verified client certificate
#[derive(Debug)]
pub struct X509Authenticator {
    trust: Arc<DynamicCaBundle>,
}

impl X509Authenticator {
    /// Authenticator trusting `trust`
    pub fn new(trust: Arc<DynamicCaBundle>) -> Self {
        Self { trust }
    }

    /// Evaluator that also contributes `trust` to the TLS handshake
    pub fn evaluator(
        trust: Arc<DynamicCaBundle>,
        refresher: Option<Arc<dyn TrustRefresher>>,
    ) -> Evaluator {
        let evaluator = Evaluator::new(Arc::new(Self::new(trust.clone()))).with_ca_provider(trust);
        match refresher {
            Some(refresher) => evaluator.with_trust_refresher(refresher),
            None => evaluator,
        }
    }
}

#[async_trait]
impl Authenticator for X509Authenticator {
    async fn authenticate(&self, request: &Parts) -> Result<Option<UserIdentity>> {
        let trust = self.trust.current();
        let Some(subject) = verified_subject(request, &trust)? else {
            return Ok(None);
        };
        if subject.common_name.is_empty() {
            return Err(AuthError::Unauthorized(
                "client certificate has no Common Name".to_string(),
            ));
        }
        debug!(cn = %subject.common_name, "authenticated client certificate");
        Ok(Some(
            UserIdentity::new(subject.common_name).with_groups(subject.organizations),
        ))
    }
}

impl CaContentProvider for X509Authenticator {
    fn ca_bundle(&self) -> CaBundle {
        self.trust.ca_bundle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_pki::{parse_pem, CertificateAuthority};

    fn request_with_chain(chain: Option<ClientCertChain>) -> Parts {
        let mut request = http::Request::builder().uri("/apis").body(()).unwrap();
        if let Some(chain) = chain {
            request.extensions_mut().insert(chain);
        }
        request.into_parts().0
    }

    fn client_chain(ca: &CertificateAuthority, cn: &str, group: Option<&str>) -> ClientCertChain {
        let (cert_pem, _) = ca.issue_client_cert(cn, group).unwrap();
        ClientCertChain::new(vec![parse_pem(&cert_pem).unwrap()])
    }

    fn authenticator_trusting(ca: &CertificateAuthority) -> X509Authenticator {
        let bundle = CaBundle::from_pem(ca.ca_cert_pem()).unwrap();
        X509Authenticator::new(Arc::new(DynamicCaBundle::new("client-ca", bundle)))
    }

    #[test]
    fn test_client_cert_chain_empty() {
        let chain = ClientCertChain::new(vec![]);
        assert!(chain.is_empty());
        assert!(chain.leaf().is_none());
    }

    #[test]
    fn test_client_cert_chain_non_empty() {
        let chain = ClientCertChain::new(vec![vec![1, 2, 3], vec![4]]);
        assert!(!chain.is_empty());
        assert_eq!(chain.leaf(), Some(&[1u8, 2, 3][..]));
        assert_eq!(chain.to_certificate_der().len(), 2);
    }

    #[tokio::test]
    async fn trusted_certificate_maps_subject() {
        let ca = CertificateAuthority::new("client-ca").unwrap();
        let auth = authenticator_trusting(&ca);
        let request = request_with_chain(Some(client_chain(&ca, "alice", Some("admins"))));

        let user = auth.authenticate(&request).await.unwrap().unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.groups, vec!["admins".to_string()]);
    }

    #[tokio::test]
    async fn no_certificate_has_no_opinion() {
        let ca = CertificateAuthority::new("client-ca").unwrap();
        let auth = authenticator_trusting(&ca);
        assert!(auth
            .authenticate(&request_with_chain(None))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn empty_trust_has_no_opinion() {
        let ca = CertificateAuthority::new("client-ca").unwrap();
        let auth = X509Authenticator::new(Arc::new(DynamicCaBundle::new(
            "client-ca",
            CaBundle::empty(),
        )));
        let request = request_with_chain(Some(client_chain(&ca, "alice", None)));
        assert!(auth.authenticate(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn foreign_certificate_is_rejected() {
        let trusted = CertificateAuthority::new("trusted").unwrap();
        let other = CertificateAuthority::new("other").unwrap();
        let auth = authenticator_trusting(&trusted);
        let request = request_with_chain(Some(client_chain(&other, "mallory", None)));

        let err = auth.authenticate(&request).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn trust_replacement_applies_to_next_request() {
        let old = CertificateAuthority::new("old").unwrap();
        let new = CertificateAuthority::new("new").unwrap();
        let trust = Arc::new(DynamicCaBundle::new(
            "client-ca",
            CaBundle::from_pem(old.ca_cert_pem()).unwrap(),
        ));
        let auth = X509Authenticator::new(trust.clone());
        let request = request_with_chain(Some(client_chain(&new, "bob", None)));

        assert!(auth.authenticate(&request).await.is_err());
        trust.replace(CaBundle::from_pem(new.ca_cert_pem()).unwrap());
        let user = auth.authenticate(&request).await.unwrap().unwrap();
        assert_eq!(user.username, "bob");
    }

    #[test]
    fn evaluator_declares_ca_provider() {
        let ca = CertificateAuthority::new("client-ca").unwrap();
        let trust = Arc::new(DynamicCaBundle::new(
            "client-ca",
            CaBundle::from_pem(ca.ca_cert_pem()).unwrap(),
        ));
        let evaluator = X509Authenticator::evaluator(trust, None);
        assert_eq!(evaluator.ca_provider().unwrap().ca_bundle().len(), 1);
        assert!(evaluator.trust_refresher().is_none());
    }
}
