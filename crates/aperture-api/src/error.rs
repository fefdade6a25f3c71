//! Error types for the extension API server
//!
//! Every error renders as a Kubernetes `Status` object so clients such as
//! kubectl show the message and reason they expect.

use aperture_auth::AuthError;
use aperture_common::SecretStoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Result type for API operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for API operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed request
    #[error("{0}")]
    BadRequest(String),

    /// Authentication failed
    #[error("{0}")]
    Unauthorized(String),

    /// Authorization failed
    #[error("{0}")]
    Forbidden(String),

    /// No such resource or object
    #[error("{0}")]
    NotFound(String),

    /// Verb not supported for the resource
    #[error("{0}")]
    MethodNotAllowed(String),

    /// Object already exists
    #[error("{0}")]
    AlreadyExists(String),

    /// Optimistic concurrency failure
    #[error("{0}")]
    Conflict(String),

    /// None of the media types in `Accept` can be produced
    #[error("only the following media types are accepted: application/json, application/yaml (requested {0:?})")]
    NotAcceptable(String),

    /// Body media type not supported
    #[error("{0}")]
    UnsupportedMediaType(String),

    /// Structured status from a backing store, rendered as given
    #[error("{message}")]
    Status {
        /// HTTP status code
        code: u16,
        /// Machine readable reason
        reason: String,
        /// Human readable message
        message: String,
    },

    /// Anything else
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// HTTP status code this error renders with
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::AlreadyExists(_) | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            Error::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::Status { code, .. } => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Kubernetes `StatusReason`
    pub fn reason(&self) -> &str {
        match self {
            Error::BadRequest(_) => "BadRequest",
            Error::Unauthorized(_) => "Unauthorized",
            Error::Forbidden(_) => "Forbidden",
            Error::NotFound(_) => "NotFound",
            Error::MethodNotAllowed(_) => "MethodNotAllowed",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::Conflict(_) => "Conflict",
            Error::NotAcceptable(_) => "NotAcceptable",
            Error::UnsupportedMediaType(_) => "UnsupportedMediaType",
            Error::Status { reason, .. } => reason,
            Error::Internal(_) => "InternalError",
        }
    }

    /// `Status` body for this error
    pub fn to_status(&self) -> Status {
        Status::failure(self.status_code().as_u16(), self.reason(), self.to_string())
    }

    /// Standard not-found error for an object of `resource`
    pub fn object_not_found(resource: &str, name: &str) -> Self {
        Error::NotFound(format!("{} \"{}\" not found", resource, name))
    }

    /// Whether this is a not-found error, however it was produced
    pub fn is_not_found(&self) -> bool {
        self.status_code() == StatusCode::NOT_FOUND
    }
}

/// Kubernetes `Status` object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Always `Status`
    pub kind: String,
    /// Always `v1`
    pub api_version: String,
    /// `Success` or `Failure`
    pub status: String,
    /// Human readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Machine readable reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// HTTP status code
    pub code: u16,
}

impl Status {
    /// Failure status
    pub fn failure(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "Status".to_string(),
            api_version: "v1".to_string(),
            status: "Failure".to_string(),
            message: message.into(),
            reason: reason.into(),
            code,
        }
    }

    /// Success status, as returned by delete
    pub fn success() -> Self {
        Self {
            kind: "Status".to_string(),
            api_version: "v1".to_string(),
            status: "Success".to_string(),
            message: String::new(),
            reason: String::new(),
            code: 200,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status_code(), axum::Json(self.to_status())).into_response()
    }
}

impl From<SecretStoreError> for Error {
    fn from(e: SecretStoreError) -> Self {
        match e {
            SecretStoreError::NotFound { .. } => Error::NotFound(e.to_string()),
            SecretStoreError::AlreadyExists { .. } => Error::AlreadyExists(e.to_string()),
            SecretStoreError::Conflict { .. } => Error::Conflict(e.to_string()),
            SecretStoreError::Backend(msg) => Error::Internal(msg),
        }
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unauthorized(msg) => Error::Unauthorized(msg),
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => Error::Status {
                code: ae.code,
                reason: ae.reason,
                message: ae.message,
            },
            other => Error::Internal(other.to_string()),
        }
    }
}
