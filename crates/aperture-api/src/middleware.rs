//! Authentication and authorization in front of the resource routes
//!
//! Flow for every request:
//! 1. Authenticate the request head against the registry's current union
//! 2. Describe the request as [`RequestAttributes`]
//! 3. Ask the authorizer; anything but `Allow` is a 403
//! 4. Attach the [`UserIdentity`] for handlers

use std::sync::Arc;

use aperture_auth::{AuthenticatorRegistry, Authorizer, RequestAttributes, ResourceAttributes};
use aperture_common::UserIdentity;
use axum::extract::{Request, State};
use axum::http::{Method, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::debug;

use crate::error::{Error, Result};
use crate::path::{parse_resource_path, split_api_path};

/// Collaborators consulted for every request
#[derive(Clone)]
pub struct AuthState {
    /// Toggleable authenticator union
    pub registry: Arc<AuthenticatorRegistry>,
    /// Authorization decision point
    pub authorizer: Arc<dyn Authorizer>,
}

impl AuthState {
    /// State over `registry` and `authorizer`
    pub fn new(registry: Arc<AuthenticatorRegistry>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            registry,
            authorizer,
        }
    }
}

/// Wrap every route of `router` in authentication and authorization
pub fn protect(router: Router, state: AuthState) -> Router {
    router.layer(middleware::from_fn_with_state(state, authenticate_and_authorize))
}

/// Middleware function; see the module docs
pub async fn authenticate_and_authorize(
    State(state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    match admit(&state, request).await {
        Ok(request) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

async fn admit(state: &AuthState, request: Request) -> Result<Request> {
    let (mut parts, body) = request.into_parts();

    let user = state
        .registry
        .authenticate(&parts)
        .await?
        .ok_or_else(|| Error::Unauthorized("Unauthorized".to_string()))?;

    let attributes = request_attributes(user, &parts.method, &parts.uri);
    let decision = state.authorizer.authorize(&attributes).await.map_err(|e| {
        Error::Forbidden(format!("authorization failed: {}", e))
    })?;
    if !decision.is_allowed() {
        debug!(
            user = %attributes.user.username,
            verb = %attributes.verb,
            path = %attributes.path,
            reason = %decision.reason,
            "request denied"
        );
        return Err(Error::Forbidden(forbidden_message(&attributes, &decision.reason)));
    }

    parts.extensions.insert(attributes.user);
    Ok(Request::from_parts(parts, body))
}

fn forbidden_message(attributes: &RequestAttributes, reason: &str) -> String {
    let target = match &attributes.resource {
        Some(r) if r.group.is_empty() => format!("resource \"{}\"", r.resource),
        Some(r) => format!("resource \"{}\" in API group \"{}\"", r.resource, r.group),
        None => format!("path \"{}\"", attributes.path),
    };
    let mut message = format!(
        "user \"{}\" cannot {} {}",
        attributes.user.username, attributes.verb, target
    );
    if !reason.is_empty() {
        message.push_str(": ");
        message.push_str(reason);
    }
    message
}

/// Describe a request for the authorizer
///
/// Paths below `/apis/{group}/{version}/` that fit the resource grammar are
/// resource requests; everything else, discovery included, is a non-resource
/// request whose verb is the lowercased HTTP method.
pub fn request_attributes(user: UserIdentity, method: &Method, uri: &Uri) -> RequestAttributes {
    let resource = split_api_path(uri.path())
        .filter(|(_, _, rest)| !rest.is_empty())
        .and_then(|(group, version, rest)| {
            let path = parse_resource_path(rest)?;
            Some(ResourceAttributes {
                group: group.to_string(),
                version: version.to_string(),
                resource: path.resource,
                subresource: path.subresource.unwrap_or_default(),
                namespace: path.namespace,
                name: path.name.unwrap_or_default(),
            })
        });

    let verb = match &resource {
        Some(r) => resource_verb(method, !r.name.is_empty(), is_watch(uri)).to_string(),
        None => method.as_str().to_ascii_lowercase(),
    };

    RequestAttributes {
        user,
        verb,
        path: uri.path().to_string(),
        resource,
    }
}

fn is_watch(uri: &Uri) -> bool {
    uri.query()
        .is_some_and(|q| q.split('&').any(|kv| kv == "watch=true" || kv == "watch=1"))
}

/// Map HTTP method to Kubernetes verb
fn resource_verb(method: &Method, named: bool, watch: bool) -> &'static str {
    match *method {
        Method::GET | Method::HEAD if watch => "watch",
        Method::GET | Method::HEAD if named => "get",
        Method::GET | Method::HEAD => "list",
        Method::POST => "create",
        Method::PUT => "update",
        Method::PATCH => "patch",
        Method::DELETE if named => "delete",
        Method::DELETE => "deletecollection",
        _ => "unknown",
    }
}
