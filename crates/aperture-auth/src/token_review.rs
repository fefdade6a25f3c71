//! Bearer token authentication via the Kubernetes TokenReview API
//!
//! ```rust,ignore
//! let client = kube::Client::try_default().await?;
//! let evaluator = Evaluator::new(Arc::new(TokenReviewAuthenticator::new(client)));
//! registry.add("token", evaluator, true);
//! ```

use aperture_common::UserIdentity;
use async_trait::async_trait;
use http::request::Parts;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use kube::{Api, Client};
use tracing::debug;

use crate::authenticator::Authenticator;
use crate::authorize::extract_bearer_token;
use crate::error::{AuthError, Result};

/// Validates bearer tokens with the cluster's TokenReview API
pub struct TokenReviewAuthenticator {
    client: Client,
    audiences: Option<Vec<String>>,
}

impl TokenReviewAuthenticator {
    /// Create a new TokenReview authenticator
    pub fn new(client: Client) -> Self {
        Self {
            client,
            audiences: None,
        }
    }

    /// Create an authenticator requiring specific audiences
    pub fn with_audiences(client: Client, audiences: Vec<String>) -> Self {
        Self {
            client,
            audiences: Some(audiences),
        }
    }

    async fn review(&self, token: &str) -> Result<UserIdentity> {
        let api: Api<TokenReview> = Api::all(self.client.clone());

        let token_review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: self.audiences.clone(),
            },
            status: None,
        };

        let result = api
            .create(&Default::default(), &token_review)
            .await
            .map_err(|e| AuthError::Backend(format!("TokenReview API error: {}", e)))?;

        let status = result
            .status
            .ok_or_else(|| AuthError::Backend("TokenReview returned no status".into()))?;

        validate_status(&status)
    }
}

#[async_trait]
impl Authenticator for TokenReviewAuthenticator {
    async fn authenticate(&self, request: &Parts) -> Result<Option<UserIdentity>> {
        let Some(token) = extract_bearer_token(&request.headers) else {
            return Ok(None);
        };
        self.review(token).await.map(Some)
    }
}

/// Extract user identity from TokenReview status
fn validate_status(status: &TokenReviewStatus) -> Result<UserIdentity> {
    if !status.authenticated.unwrap_or(false) {
        let error_msg = status
            .error
            .as_deref()
            .unwrap_or("token authentication failed");
        return Err(AuthError::Unauthorized(error_msg.to_string()));
    }

    let user = status
        .user
        .as_ref()
        .ok_or_else(|| AuthError::Backend("TokenReview authenticated but no user info".into()))?;

    let username = user
        .username
        .as_ref()
        .ok_or_else(|| AuthError::Backend("TokenReview user has no username".into()))?
        .clone();

    let groups = user.groups.clone().unwrap_or_default();

    debug!(
        username = %username,
        groups = ?groups,
        "TokenReview validated bearer token"
    );

    Ok(UserIdentity { username, groups })
}
