//! Authorization collaborators
//!
//! Every authenticated request is described as [`RequestAttributes`] and
//! handed to an [`Authorizer`]. Only [`Decision::Allow`] lets the request
//! through; `NoOpinion` is a deny.

use std::sync::Arc;

use aperture_common::UserIdentity;
use async_trait::async_trait;
use http::HeaderMap;
use k8s_openapi::api::authorization::v1::{
    NonResourceAttributes, ResourceAttributes as SarResourceAttributes, SubjectAccessReview,
    SubjectAccessReviewSpec,
};
use kube::{Api, Client};
use tracing::debug;

use crate::error::{AuthError, Result};

/// Non-resource paths that may be authorized at all
pub const ALLOWED_NON_RESOURCE_PATHS: &[&str] = &["/api", "/apis", "/openapi/v2", "/openapi/v3"];

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Permitted
    Allow,
    /// Explicitly refused
    Deny,
    /// The authorizer has no rule for this request
    NoOpinion,
}

/// A decision and its explanation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    /// The decision
    pub decision: Decision,
    /// Human readable reason, may be empty
    pub reason: String,
}

impl AuthorizationDecision {
    /// Allow with a reason
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.into(),
        }
    }

    /// Deny with a reason
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.into(),
        }
    }

    /// No opinion
    pub fn no_opinion(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::NoOpinion,
            reason: reason.into(),
        }
    }

    /// Whether the request may proceed
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// Resource coordinates of a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceAttributes {
    /// API group
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource name
    pub resource: String,
    /// Subresource, empty for none
    pub subresource: String,
    /// Namespace, empty for cluster scope
    pub namespace: String,
    /// Object name, empty for collections
    pub name: String,
}

/// Who is doing what to which path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAttributes {
    /// Authenticated identity
    pub user: UserIdentity,
    /// Kubernetes verb (get, list, watch, create, ...)
    pub verb: String,
    /// Request path
    pub path: String,
    /// Present for resource requests
    pub resource: Option<ResourceAttributes>,
}

/// Authorization collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Decide whether the request may proceed
    async fn authorize(&self, attributes: &RequestAttributes) -> Result<AuthorizationDecision>;
}

/// Restricts non-resource requests to a fixed set of paths
///
/// Resource requests and allowed paths are passed to the wrapped authorizer.
pub struct AllowListAuthorizer {
    allowed: Vec<String>,
    inner: Arc<dyn Authorizer>,
}

impl AllowListAuthorizer {
    /// Allow-list of [`ALLOWED_NON_RESOURCE_PATHS`] in front of `inner`
    pub fn new(inner: Arc<dyn Authorizer>) -> Self {
        Self::with_paths(
            ALLOWED_NON_RESOURCE_PATHS.iter().map(|p| p.to_string()),
            inner,
        )
    }

    /// Custom allow-list in front of `inner`
    pub fn with_paths(paths: impl IntoIterator<Item = String>, inner: Arc<dyn Authorizer>) -> Self {
        Self {
            allowed: paths.into_iter().collect(),
            inner,
        }
    }

    fn path_allowed(&self, path: &str) -> bool {
        self.allowed.iter().any(|allowed| {
            path == allowed
                || path
                    .strip_prefix(allowed.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

#[async_trait]
impl Authorizer for AllowListAuthorizer {
    async fn authorize(&self, attributes: &RequestAttributes) -> Result<AuthorizationDecision> {
        if attributes.resource.is_none() && !self.path_allowed(&attributes.path) {
            debug!(path = %attributes.path, "non-resource path outside allow-list");
            return Ok(AuthorizationDecision::deny(format!(
                "path {} is not served",
                attributes.path
            )));
        }
        self.inner.authorize(attributes).await
    }
}

/// Allows everything; standalone mode only
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAllowAuthorizer;

#[async_trait]
impl Authorizer for AlwaysAllowAuthorizer {
    async fn authorize(&self, _attributes: &RequestAttributes) -> Result<AuthorizationDecision> {
        Ok(AuthorizationDecision::allow(""))
    }
}

/// Delegates decisions to the cluster's SubjectAccessReview API
pub struct SubjectAccessReviewAuthorizer {
    client: Client,
}

impl SubjectAccessReviewAuthorizer {
    /// Create a new SubjectAccessReview authorizer
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn review_spec(attributes: &RequestAttributes) -> SubjectAccessReviewSpec {
    let mut spec = SubjectAccessReviewSpec {
        user: Some(attributes.user.username.clone()),
        groups: Some(attributes.user.groups.clone()),
        ..Default::default()
    };
    match &attributes.resource {
        Some(resource) => {
            let optional = |s: &str| (!s.is_empty()).then(|| s.to_string());
            spec.resource_attributes = Some(SarResourceAttributes {
                group: Some(resource.group.clone()),
                version: optional(&resource.version),
                resource: optional(&resource.resource),
                subresource: optional(&resource.subresource),
                namespace: optional(&resource.namespace),
                name: optional(&resource.name),
                verb: Some(attributes.verb.clone()),
                ..Default::default()
            });
        }
        None => {
            spec.non_resource_attributes = Some(NonResourceAttributes {
                path: Some(attributes.path.clone()),
                verb: Some(attributes.verb.clone()),
            });
        }
    }
    spec
}

#[async_trait]
impl Authorizer for SubjectAccessReviewAuthorizer {
    async fn authorize(&self, attributes: &RequestAttributes) -> Result<AuthorizationDecision> {
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let review = SubjectAccessReview {
            metadata: Default::default(),
            spec: review_spec(attributes),
            status: None,
        };

        let result = api
            .create(&Default::default(), &review)
            .await
            .map_err(|e| AuthError::Backend(format!("SubjectAccessReview API error: {}", e)))?;
        let status = result
            .status
            .ok_or_else(|| AuthError::Backend("SubjectAccessReview returned no status".into()))?;

        let reason = status.reason.unwrap_or_default();
        let decision = if status.allowed {
            AuthorizationDecision::allow(reason)
        } else if status.denied.unwrap_or(false) {
            AuthorizationDecision::deny(reason)
        } else {
            AuthorizationDecision::no_opinion(reason)
        };
        debug!(
            user = %attributes.user.username,
            verb = %attributes.verb,
            path = %attributes.path,
            decision = ?decision.decision,
            "SubjectAccessReview decided"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes(path: &str, resource: Option<ResourceAttributes>) -> RequestAttributes {
        RequestAttributes {
            user: UserIdentity::new("alice").with_groups(["devs"]),
            verb: "get".to_string(),
            path: path.to_string(),
            resource,
        }
    }

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("abc123"));
    }

    #[test]
    fn test_extract_bearer_token_missing() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn test_extract_bearer_token_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Basic abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn allow_list_denies_without_consulting_inner() {
        let mut inner = MockAuthorizer::new();
        inner.expect_authorize().never();
        let authorizer = AllowListAuthorizer::new(Arc::new(inner));

        for path in ["/metrics", "/healthz", "/apisx", "/openapi/v1"] {
            let decision = authorizer.authorize(&attributes(path, None)).await.unwrap();
            assert_eq!(decision.decision, Decision::Deny, "{path}");
        }
    }

    #[tokio::test]
    async fn allow_list_passes_allowed_paths_through() {
        let mut inner = MockAuthorizer::new();
        inner
            .expect_authorize()
            .times(3)
            .returning(|_| Ok(AuthorizationDecision::allow("rbac")));
        let authorizer = AllowListAuthorizer::new(Arc::new(inner));

        for path in ["/apis", "/apis/example.io/v1", "/openapi/v3/apis"] {
            let decision = authorizer.authorize(&attributes(path, None)).await.unwrap();
            assert!(decision.is_allowed(), "{path}");
        }
    }

    #[tokio::test]
    async fn resource_requests_always_reach_inner() {
        let mut inner = MockAuthorizer::new();
        inner
            .expect_authorize()
            .withf(|a| a.resource.as_ref().is_some_and(|r| r.resource == "widgets"))
            .times(1)
            .returning(|_| Ok(AuthorizationDecision::no_opinion("")));
        let authorizer = AllowListAuthorizer::new(Arc::new(inner));

        let resource = ResourceAttributes {
            group: "example.io".to_string(),
            version: "v1".to_string(),
            resource: "widgets".to_string(),
            ..Default::default()
        };
        let decision = authorizer
            .authorize(&attributes("/apis/example.io/v1/widgets", Some(resource)))
            .await
            .unwrap();
        assert!(!decision.is_allowed());
    }

    #[test]
    fn review_spec_for_resource_request() {
        let resource = ResourceAttributes {
            group: "example.io".to_string(),
            version: "v1".to_string(),
            resource: "widgets".to_string(),
            namespace: "default".to_string(),
            name: "w1".to_string(),
            ..Default::default()
        };
        let spec = review_spec(&attributes("/apis/example.io/v1/namespaces/default/widgets/w1", Some(resource)));

        assert_eq!(spec.user.as_deref(), Some("alice"));
        assert!(spec.non_resource_attributes.is_none());
        let sar = spec.resource_attributes.unwrap();
        assert_eq!(sar.namespace.as_deref(), Some("default"));
        assert_eq!(sar.name.as_deref(), Some("w1"));
        assert_eq!(sar.subresource, None);
        assert_eq!(sar.verb.as_deref(), Some("get"));
    }

    #[test]
    fn review_spec_for_non_resource_request() {
        let spec = review_spec(&attributes("/apis", None));
        assert!(spec.resource_attributes.is_none());
        let nra = spec.non_resource_attributes.unwrap();
        assert_eq!(nra.path.as_deref(), Some("/apis"));
    }
}
