//! Authenticator contract and capability tags

use std::fmt;
use std::sync::Arc;

use aperture_common::UserIdentity;
use aperture_pki::CaBundle;
use async_trait::async_trait;
use http::request::Parts;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Decides who sent a request
///
/// Returns `Ok(None)` when the request carries no credentials this
/// authenticator understands, and an error when it does but they are invalid.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate the request head
    async fn authenticate(&self, request: &Parts) -> Result<Option<UserIdentity>>;
}

/// Contributes CA certificates used to verify TLS client certificates
pub trait CaContentProvider: Send + Sync {
    /// Current CA bundle
    fn ca_bundle(&self) -> CaBundle;
}

/// Keeps an evaluator's trust material fresh in the background
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrustRefresher: Send + Sync {
    /// Refresh until `cancel` fires; `workers` bounds concurrent fetches
    async fn run(&self, workers: usize, cancel: CancellationToken);
}

/// An authenticator plus the optional capabilities it declares
///
/// Capabilities are fixed when the evaluator is built, the registry never
/// probes for them at runtime.
#[derive(Clone)]
pub struct Evaluator {
    authenticator: Arc<dyn Authenticator>,
    ca_provider: Option<Arc<dyn CaContentProvider>>,
    trust_refresher: Option<Arc<dyn TrustRefresher>>,
}

impl Evaluator {
    /// Evaluator with no extra capabilities
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            ca_provider: None,
            trust_refresher: None,
        }
    }

    /// Declare that this evaluator contributes client CA certificates
    pub fn with_ca_provider(mut self, provider: Arc<dyn CaContentProvider>) -> Self {
        self.ca_provider = Some(provider);
        self
    }

    /// Declare a background trust refresh task
    pub fn with_trust_refresher(mut self, refresher: Arc<dyn TrustRefresher>) -> Self {
        self.trust_refresher = Some(refresher);
        self
    }

    /// The authenticator
    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    /// CA provider, if declared
    pub fn ca_provider(&self) -> Option<&Arc<dyn CaContentProvider>> {
        self.ca_provider.as_ref()
    }

    /// Trust refresher, if declared
    pub fn trust_refresher(&self) -> Option<&Arc<dyn TrustRefresher>> {
        self.trust_refresher.as_ref()
    }
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("ca_provider", &self.ca_provider.is_some())
            .field("trust_refresher", &self.trust_refresher.is_some())
            .finish_non_exhaustive()
    }
}
