//! Front-proxy authentication
//!
//! An aggregating front proxy terminates the user's connection, authenticates
//! them, then calls us with its own client certificate and the user's
//! identity in request headers. The headers are only believed when the
//! proxy's certificate verifies against the front-proxy CA.

use std::sync::Arc;

use aperture_common::UserIdentity;
use aperture_pki::CaBundle;
use async_trait::async_trait;
use http::request::Parts;
use http::HeaderMap;
use tracing::debug;

use crate::authenticator::{Authenticator, CaContentProvider, Evaluator, TrustRefresher};
use crate::error::{AuthError, Result};
use crate::trust::DynamicCaBundle;
use crate::x509::verified_subject;

/// Default header carrying the username
pub const DEFAULT_USERNAME_HEADER: &str = "X-Remote-User";

/// Default header carrying groups
pub const DEFAULT_GROUP_HEADER: &str = "X-Remote-Group";

/// Which headers to read and which proxies to believe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaderConfig {
    /// Username headers, first non-empty wins
    pub username_headers: Vec<String>,
    /// Group headers, every value of every header is a group
    pub group_headers: Vec<String>,
    /// Accepted proxy certificate CNs; empty accepts any CN
    pub allowed_names: Vec<String>,
}

impl Default for RequestHeaderConfig {
    fn default() -> Self {
        Self {
            username_headers: vec![DEFAULT_USERNAME_HEADER.to_string()],
            group_headers: vec![DEFAULT_GROUP_HEADER.to_string()],
            allowed_names: Vec::new(),
        }
    }
}

impl RequestHeaderConfig {
    fn username(&self, headers: &HeaderMap) -> Option<String> {
        self.username_headers.iter().find_map(|name| {
            headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
    }

    fn groups(&self, headers: &HeaderMap) -> Vec<String> {
        self.group_headers
            .iter()
            .flat_map(|name| headers.get_all(name.as_str()).iter())
            .filter_map(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Trusts identity headers set by a verified front proxy
#[derive(Debug)]
pub struct RequestHeaderAuthenticator {
    config: RequestHeaderConfig,
    trust: Arc<DynamicCaBundle>,
}

impl RequestHeaderAuthenticator {
    /// Authenticator trusting proxies signed by `trust`
    pub fn new(config: RequestHeaderConfig, trust: Arc<DynamicCaBundle>) -> Self {
        Self { config, trust }
    }

    /// Evaluator that also contributes the front-proxy CA to the handshake
    pub fn evaluator(
        config: RequestHeaderConfig,
        trust: Arc<DynamicCaBundle>,
        refresher: Option<Arc<dyn TrustRefresher>>,
    ) -> Evaluator {
        let evaluator =
            Evaluator::new(Arc::new(Self::new(config, trust.clone()))).with_ca_provider(trust);
        match refresher {
            Some(refresher) => evaluator.with_trust_refresher(refresher),
            None => evaluator,
        }
    }
}

#[async_trait]
impl Authenticator for RequestHeaderAuthenticator {
    async fn authenticate(&self, request: &Parts) -> Result<Option<UserIdentity>> {
        let Some(username) = self.config.username(&request.headers) else {
            return Ok(None);
        };

        let trust = self.trust.current();
        let Some(proxy) = verified_subject(request, &trust)? else {
            return Ok(None);
        };
        if !self.config.allowed_names.is_empty()
            && !self.config.allowed_names.contains(&proxy.common_name)
        {
            return Err(AuthError::Unauthorized(format!(
                "front proxy {:?} is not an allowed name",
                proxy.common_name
            )));
        }

        let groups = self.config.groups(&request.headers);
        debug!(proxy = %proxy.common_name, username = %username, "authenticated via front proxy");
        Ok(Some(UserIdentity::new(username).with_groups(groups)))
    }
}

impl CaContentProvider for RequestHeaderAuthenticator {
    fn ca_bundle(&self) -> CaBundle {
        self.trust.ca_bundle()
    }
}
