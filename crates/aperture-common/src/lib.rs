//! Common types for aperture: identity, secret storage and telemetry

#![deny(missing_docs)]

pub mod identity;
pub mod kube_secrets;
pub mod secrets;
pub mod telemetry;

pub use identity::UserIdentity;
pub use kube_secrets::KubeSecretStore;
pub use secrets::{
    MemorySecretStore, SecretEvent, SecretRecord, SecretSelector, SecretStore, SecretStoreError,
};

/// Namespace holding aperture's own records (serving certificate, trust bundles)
pub const APERTURE_SYSTEM_NAMESPACE: &str = "aperture-system";

/// Default HTTPS port for the extension server
pub const DEFAULT_HTTPS_PORT: u16 = 9443;

/// Label applied to every record aperture writes
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] for aperture-owned records
pub const MANAGED_BY_VALUE: &str = "aperture";

/// Secret key holding a PEM certificate (chain)
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Secret key holding a PEM private key
pub const TLS_KEY_KEY: &str = "tls.key";

/// Secret key holding a PEM CA bundle
pub const CA_CERT_KEY: &str = "ca.crt";
