//! Authentication and authorization for the extension server
//!
//! Authentication is a union of named evaluators that can be switched on and
//! off while serving ([`AuthenticatorRegistry`]). Evaluators may also
//! contribute client CA certificates to the TLS handshake and run a
//! background trust refresh; both are declared when the evaluator is built.
//!
//! Authorization is delegated to an external [`Authorizer`], with a fixed
//! allow-list for non-resource paths in front of it.

#![deny(missing_docs)]

pub mod authenticator;
pub mod authorize;
pub mod error;
pub mod registry;
pub mod request_header;
pub mod token_review;
pub mod trust;
pub mod x509;

pub use authenticator::{Authenticator, CaContentProvider, Evaluator, TrustRefresher};
pub use authorize::{
    extract_bearer_token, AllowListAuthorizer, AlwaysAllowAuthorizer, AuthorizationDecision,
    Authorizer, Decision, RequestAttributes, ResourceAttributes, SubjectAccessReviewAuthorizer,
    ALLOWED_NON_RESOURCE_PATHS,
};
pub use error::{AuthError, Result};
pub use registry::AuthenticatorRegistry;
pub use request_header::{RequestHeaderAuthenticator, RequestHeaderConfig};
pub use token_review::TokenReviewAuthenticator;
pub use trust::{CaSource, DynamicCaBundle, SecretCaRefresher};
pub use x509::{ClientCertChain, X509Authenticator};
