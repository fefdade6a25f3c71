//! TLS identity for the extension server
//!
//! - [`pki`]: certificate generation, inspection and CA bundles
//! - [`rotator`]: keeps a persisted self-signed serving certificate fresh
//! - [`resolver`]: hands the rotator's current certificate to rustls

#![deny(missing_docs)]

pub mod pki;
pub mod resolver;
pub mod rotator;

pub use pki::{
    generate_self_signed, parse_pem, parse_pem_bundle, CaBundle, CertificateAuthority,
    CertificateInfo, PkiError, Result, VerifiedSubject,
};
pub use resolver::SniResolver;
pub use rotator::{CertificateRotator, RotatorConfig, ServingCertificate};
