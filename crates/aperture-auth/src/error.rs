//! Error types for authentication and authorization

/// Result type for auth operations
pub type Result<T> = std::result::Result<T, AuthError>;

/// Error type for auth operations
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Credentials were presented but rejected
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// No authenticator registered under the name
    #[error("authenticator not found: {0}")]
    NotFound(String),

    /// Background tasks were requested outside a Tokio runtime
    #[error("no async runtime available: {0}")]
    Runtime(String),

    /// Background tasks are already running
    #[error("authenticator registry is already running")]
    AlreadyRunning,

    /// An upstream API (TokenReview, SubjectAccessReview) failed
    #[error("auth backend error: {0}")]
    Backend(String),
}

impl From<kube::Error> for AuthError {
    fn from(e: kube::Error) -> Self {
        AuthError::Backend(e.to_string())
    }
}
