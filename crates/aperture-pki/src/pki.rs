//! Certificate generation and inspection
//!
//! The extension server presents a self-signed certificate for its own
//! names (the aggregation layer pins it through the registration record, so
//! no chain of trust is involved). Client certificates on the other hand are
//! checked against CA bundles supplied by whoever operates the callers.
//!
//! # Certificate Rotation
//!
//! Serving certificates are valid for [`SERVING_CERT_VALIDITY_DAYS`] and are
//! renewed once [`ROTATION_THRESHOLD`] of their lifetime has passed, leaving
//! roughly 73 days of overlap for callers to pick up the new one.

use std::net::IpAddr;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

/// Default validity period for serving certificates (1 year)
pub const SERVING_CERT_VALIDITY_DAYS: i64 = 365;

/// Default validity period for CA certificates (10 years)
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Rotation threshold as a fraction of TTL (80%)
pub const ROTATION_THRESHOLD: f64 = 0.80;

/// Organization stamped on certificates aperture generates
const ORGANIZATION: &str = "aperture";

fn now_unix() -> i64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Compute certificate validity period starting now
fn compute_validity(validity: std::time::Duration) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let secs = i64::try_from(validity.as_secs()).unwrap_or(i64::MAX / 2);
    (now, now + ::time::Duration::seconds(secs))
}

fn days(n: i64) -> std::time::Duration {
    std::time::Duration::from_secs(n.unsigned_abs() * 24 * 60 * 60)
}

/// Information about a certificate's validity and subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Subject organizations
    pub organizations: Vec<String>,
    /// DNS and IP subject alternative names
    pub subject_names: Vec<String>,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let organizations = cert
            .subject()
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect();

        let mut subject_names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => subject_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            subject_names.push(ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            organizations,
            subject_names,
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Seconds remaining until certificate expires
    pub fn remaining_secs(&self) -> i64 {
        self.not_after - now_unix()
    }

    /// Check if certificate has expired
    pub fn is_expired(&self) -> bool {
        self.remaining_secs() <= 0
    }

    /// Check if certificate is past [`ROTATION_THRESHOLD`] of its lifetime
    pub fn needs_rotation(&self) -> bool {
        let lifetime = self.lifetime_secs().max(1) as f64;
        let age = (now_unix() - self.not_before) as f64;
        age / lifetime >= ROTATION_THRESHOLD
    }

    /// Whether every name in `names` is covered by the certificate's SANs
    pub fn covers(&self, names: &[String]) -> bool {
        names.iter().all(|n| self.subject_names.contains(n))
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Certificate is not trusted by the bundle
    #[error("certificate not trusted: {0}")]
    Untrusted(String),

    /// Persisting or loading material failed
    #[error("certificate storage error: {0}")]
    Storage(#[from] aperture_common::SecretStoreError),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Parse every `CERTIFICATE` block of a PEM bundle into DER
pub fn parse_pem_bundle(pem_data: &str) -> Result<Vec<Vec<u8>>> {
    let blocks = ::pem::parse_many(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM bundle: {}", e)))?;
    Ok(blocks
        .into_iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .map(|b| b.contents().to_vec())
        .collect())
}

fn san_for(name: &str) -> Result<SanType> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(name.to_string())
        .map(SanType::DnsName)
        .map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("invalid DNS name '{}': {}", name, e))
        })
}

/// rcgen keeps one value per attribute type, so at most one O is written
fn distinguished_name(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    if let Some(org) = organization {
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(org.to_string()),
        );
    }
    dn
}

/// Generate a self-signed serving certificate for `names`
///
/// Returns `(cert_pem, key_pem)`. IP addresses become IP SANs, everything
/// else a DNS SAN.
pub fn generate_self_signed(
    common_name: &str,
    names: &[String],
    validity: std::time::Duration,
) -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name, Some(ORGANIZATION));
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

    let (not_before, not_after) = compute_validity(validity);
    params.not_before = not_before;
    params.not_after = not_after;

    params.subject_alt_names = names
        .iter()
        .map(|n| san_for(n))
        .collect::<Result<Vec<_>>>()?;

    let key_pair = KeyPair::generate().map_err(|e| {
        PkiError::KeyGenerationFailed(format!("failed to generate serving key: {}", e))
    })?;

    let cert = params.self_signed(&key_pair).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to self-sign certificate: {}", e))
    })?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Certificate authority for issuing client certificates
///
/// Aperture never signs anything itself in production; operators bring their
/// own client and front-proxy CAs. This type exists to mint such CAs and
/// their client certificates for local setups.
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, Some(ORGANIZATION));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(days(CA_VALIDITY_DAYS));
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
        })
    }

    /// The CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Issue a client certificate; CN becomes the username, O the group
    ///
    /// Returns `(cert_pem, key_pem)`.
    pub fn issue_client_cert(
        &self,
        common_name: &str,
        group: Option<&str>,
    ) -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, group);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];

        let (not_before, not_after) = compute_validity(days(SERVING_CERT_VALIDITY_DAYS));
        params.not_before = not_before;
        params.not_after = not_after;

        let client_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate client key: {}", e))
        })?;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&client_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign client cert: {}", e))
        })?;

        Ok((cert.pem(), client_key.serialize_pem()))
    }
}

/// Identity carried by a verified client certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSubject {
    /// Subject CN
    pub common_name: String,
    /// Subject O entries
    pub organizations: Vec<String>,
}

/// A set of trusted CA certificates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaBundle {
    certs: Vec<Vec<u8>>,
}

impl CaBundle {
    /// Bundle trusting nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a PEM bundle; every block must be a parseable certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let certs = parse_pem_bundle(pem_data)?;
        for der in &certs {
            X509Certificate::from_der(der)
                .map_err(|e| PkiError::ParseError(format!("invalid CA certificate: {}", e)))?;
        }
        Ok(Self { certs })
    }

    /// Combine bundles, dropping duplicates while keeping order
    pub fn merge<'a>(bundles: impl IntoIterator<Item = &'a CaBundle>) -> Self {
        let mut certs: Vec<Vec<u8>> = Vec::new();
        for bundle in bundles {
            for der in &bundle.certs {
                if !certs.contains(der) {
                    certs.push(der.clone());
                }
            }
        }
        Self { certs }
    }

    /// Number of certificates
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// Whether the bundle trusts nothing
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Certificates in rustls form
    pub fn certificates(&self) -> Vec<CertificateDer<'static>> {
        self.certs
            .iter()
            .map(|der| CertificateDer::from(der.clone()))
            .collect()
    }

    /// SHA-256 over the certificates, stable for identical contents
    pub fn fingerprint(&self) -> String {
        fingerprint(self.certs.iter().map(Vec::as_slice))
    }

    /// Check that `leaf_der` is signed by a CA in the bundle and currently valid
    pub fn verify(&self, leaf_der: &[u8]) -> Result<VerifiedSubject> {
        let (_, leaf) = X509Certificate::from_der(leaf_der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse client cert: {}", e)))?;

        let signed = self.certs.iter().any(|ca_der| {
            X509Certificate::from_der(ca_der)
                .map(|(_, ca)| leaf.verify_signature(Some(ca.public_key())).is_ok())
                .unwrap_or(false)
        });
        if !signed {
            return Err(PkiError::Untrusted(
                "certificate not signed by any trusted CA".to_string(),
            ));
        }

        let now = now_unix();
        if now < leaf.validity().not_before.timestamp() {
            return Err(PkiError::Untrusted("certificate not yet valid".to_string()));
        }
        if now > leaf.validity().not_after.timestamp() {
            return Err(PkiError::Untrusted("certificate expired".to_string()));
        }

        let common_name = leaf
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();
        let organizations = leaf
            .subject()
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect();

        Ok(VerifiedSubject {
            common_name,
            organizations,
        })
    }
}

/// Hex SHA-256 over a sequence of DER blobs
pub fn fingerprint<'a>(ders: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for der in ders {
        hasher.update((der.len() as u64).to_be_bytes());
        hasher.update(der);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn self_signed_cert_carries_names() {
        let sans = names(&["ext.aperture-system.svc", "127.0.0.1"]);
        let (cert_pem, key_pem) =
            generate_self_signed("aperture", &sans, days(SERVING_CERT_VALIDITY_DAYS)).unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));

        let info = CertificateInfo::from_pem(&cert_pem).unwrap();
        assert_eq!(info.common_name, "aperture");
        assert!(info.covers(&sans));
        assert!(!info.covers(&names(&["other.example"])));
        assert_eq!(info.organizations, vec!["aperture".to_string()]);
    }

    #[test]
    fn fresh_cert_does_not_need_rotation() {
        let (cert_pem, _) =
            generate_self_signed("aperture", &names(&["a"]), days(SERVING_CERT_VALIDITY_DAYS))
                .unwrap();
        let info = CertificateInfo::from_pem(&cert_pem).unwrap();
        assert!(!info.needs_rotation());
        assert!(!info.is_expired());
        let expected = days(SERVING_CERT_VALIDITY_DAYS).as_secs() as i64;
        assert!((info.lifetime_secs() - expected).abs() <= 1);
    }

    #[test]
    fn invalid_dns_name_rejected() {
        let err = generate_self_signed("x", &names(&["bücher.example"]), days(1)).unwrap_err();
        assert!(matches!(err, PkiError::CertificateGenerationFailed(_)));
    }

    #[test]
    fn bundle_verifies_issued_client_cert() {
        let ca = CertificateAuthority::new("client-ca").unwrap();
        let (cert_pem, _) = ca
            .issue_client_cert("alice", Some("devs"))
            .unwrap();

        let bundle = CaBundle::from_pem(ca.ca_cert_pem()).unwrap();
        let subject = bundle.verify(&parse_pem(&cert_pem).unwrap()).unwrap();
        assert_eq!(subject.common_name, "alice");
        assert_eq!(subject.organizations, names(&["devs"]));
    }

    #[test]
    fn bundle_rejects_foreign_ca() {
        let trusted = CertificateAuthority::new("trusted").unwrap();
        let rogue = CertificateAuthority::new("rogue").unwrap();
        let (cert_pem, _) = rogue.issue_client_cert("mallory", None).unwrap();

        let bundle = CaBundle::from_pem(trusted.ca_cert_pem()).unwrap();
        let err = bundle.verify(&parse_pem(&cert_pem).unwrap()).unwrap_err();
        assert!(matches!(err, PkiError::Untrusted(_)));
        assert!(CaBundle::empty()
            .verify(&parse_pem(&cert_pem).unwrap())
            .is_err());
    }

    #[test]
    fn merge_deduplicates_and_keeps_order() {
        let a = CertificateAuthority::new("a").unwrap();
        let b = CertificateAuthority::new("b").unwrap();
        let bundle_a = CaBundle::from_pem(a.ca_cert_pem()).unwrap();
        let bundle_ab =
            CaBundle::from_pem(&format!("{}\n{}", a.ca_cert_pem(), b.ca_cert_pem())).unwrap();

        let merged = CaBundle::merge([&bundle_a, &bundle_ab]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged, bundle_ab);
        assert_eq!(merged.fingerprint(), bundle_ab.fingerprint());
        assert_ne!(bundle_a.fingerprint(), bundle_ab.fingerprint());
    }

    #[test]
    fn garbage_pem_is_a_parse_error() {
        assert!(matches!(
            parse_pem("not a pem"),
            Err(PkiError::ParseError(_))
        ));
        assert!(CaBundle::from_pem("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n")
            .is_err());
    }

    #[test]
    fn empty_bundle_has_stable_fingerprint() {
        assert_eq!(
            CaBundle::empty().fingerprint(),
            CaBundle::default().fingerprint()
        );
        assert!(CaBundle::empty().is_empty());
    }
}
