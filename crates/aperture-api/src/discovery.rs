//! Discovery documents and request dispatch for registered resources
//!
//! Resources are registered on a [`DiscoveryRouter`] builder, then
//! [`DiscoveryRouter::register_routes`] consumes it and installs the routes.
//! Nothing can be registered once routes exist.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use aperture_common::UserIdentity;
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use bytes::Bytes;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    APIGroup, APIResource, APIResourceList, GroupVersionForDiscovery,
};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::negotiate::{negotiate_or_json, respond};
use crate::path::{parse_resource_path, split_api_path, ResourcePath};

/// Largest request body accepted, matching the API server's limit
pub const MAX_BODY_BYTES: usize = 3 * 1024 * 1024;

/// Verbs a resource supports unless told otherwise
pub const DEFAULT_VERBS: &[&str] = &["create", "delete", "get", "list", "patch", "update", "watch"];

/// An API group and version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersion {
    /// API group
    pub group: String,
    /// Version within the group
    pub version: String,
}

impl GroupVersion {
    /// Group and version
    pub fn new(group: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
        }
    }

    /// Parse `group/version`
    pub fn parse(raw: &str) -> Option<Self> {
        let (group, version) = raw.split_once('/')?;
        if group.is_empty() || version.is_empty() || version.contains('/') {
            return None;
        }
        Some(Self::new(group, version))
    }

    /// `group/version`, as used in `apiVersion`
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

impl fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.version)
    }
}

/// What discovery advertises about a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// Kind, e.g. `Widget`
    pub kind: String,
    /// Plural resource name used in paths, e.g. `widgets`
    pub plural: String,
    /// Singular name, e.g. `widget`
    pub singular: String,
    /// Namespaced or cluster scoped
    pub namespaced: bool,
    /// Supported verbs
    pub verbs: Vec<String>,
    /// Short names for kubectl
    pub short_names: Vec<String>,
}

impl ResourceDescriptor {
    /// Namespaced resource supporting [`DEFAULT_VERBS`]
    pub fn new(kind: impl Into<String>, plural: impl Into<String>) -> Self {
        let kind = kind.into();
        Self {
            singular: kind.to_lowercase(),
            kind,
            plural: plural.into(),
            namespaced: true,
            verbs: DEFAULT_VERBS.iter().map(|v| v.to_string()).collect(),
            short_names: Vec::new(),
        }
    }

    /// Make the resource cluster scoped
    pub fn cluster_scoped(mut self) -> Self {
        self.namespaced = false;
        self
    }

    /// Override the supported verbs
    pub fn with_verbs<I, S>(mut self, verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.verbs = verbs.into_iter().map(Into::into).collect();
        self
    }

    /// Add short names
    pub fn with_short_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.short_names = names.into_iter().map(Into::into).collect();
        self
    }

    fn to_api_resource(&self) -> APIResource {
        APIResource {
            kind: self.kind.clone(),
            name: self.plural.clone(),
            singular_name: self.singular.clone(),
            namespaced: self.namespaced,
            verbs: self.verbs.clone(),
            short_names: (!self.short_names.is_empty()).then(|| self.short_names.clone()),
            ..Default::default()
        }
    }
}

/// A request routed to a resource handler
#[derive(Debug)]
pub struct ResourceRequest {
    /// Request head, including extensions set by middleware
    pub parts: Parts,
    /// Fully read body
    pub body: Bytes,
    /// Namespace, empty for cluster-scoped requests
    pub namespace: String,
    /// Object name, absent for collection requests
    pub name: Option<String>,
}

impl ResourceRequest {
    /// Identity set by the authentication middleware
    pub fn user(&self) -> Option<UserIdentity> {
        self.parts.extensions.get::<UserIdentity>().cloned()
    }
}

/// Serves one resource of one group/version
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Handle a request; errors render as `Status` responses
    async fn handle(&self, request: ResourceRequest) -> Result<Response>;
}

type HandlerKey = (GroupVersion, String);

/// Registration builder for served resources
#[derive(Default)]
pub struct DiscoveryRouter {
    versions: Vec<(GroupVersion, Vec<ResourceDescriptor>)>,
    namespaced: HashMap<HandlerKey, Arc<dyn ResourceHandler>>,
    cluster: HashMap<HandlerKey, Arc<dyn ResourceHandler>>,
}

impl DiscoveryRouter {
    /// Empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource under `group_version`
    ///
    /// Registering the same plural again replaces both the handler and the
    /// discovery entry in place.
    pub fn add_resource(
        &mut self,
        group_version: GroupVersion,
        descriptor: ResourceDescriptor,
        handler: Arc<dyn ResourceHandler>,
    ) -> &mut Self {
        let key = (group_version.clone(), descriptor.plural.clone());
        let index = match self.versions.iter().position(|(gv, _)| *gv == group_version) {
            Some(index) => index,
            None => {
                self.versions.push((group_version.clone(), Vec::new()));
                self.versions.len() - 1
            }
        };
        let resources = &mut self.versions[index].1;
        match resources.iter().position(|r| r.plural == descriptor.plural) {
            Some(existing) => {
                warn!(
                    group_version = %group_version,
                    resource = %descriptor.plural,
                    "resource registered twice, replacing"
                );
                resources[existing] = descriptor.clone();
            }
            None => resources.push(descriptor.clone()),
        }

        self.namespaced.remove(&key);
        self.cluster.remove(&key);
        if descriptor.namespaced {
            self.namespaced.insert(key, handler);
        } else {
            self.cluster.insert(key, handler);
        }
        debug!(group_version = %group_version, resource = %descriptor.plural, "registered resource");
        self
    }

    /// Group versions in registration order
    pub fn group_versions(&self) -> Vec<GroupVersion> {
        self.versions.iter().map(|(gv, _)| gv.clone()).collect()
    }

    /// Install discovery and resource routes on `router`
    pub fn register_routes(self, router: Router) -> Router {
        let mut groups: Vec<String> = Vec::new();
        for (gv, _) in &self.versions {
            if !groups.contains(&gv.group) {
                groups.push(gv.group.clone());
            }
        }
        let versions: Vec<GroupVersion> = self.group_versions();
        let discovery = Arc::new(Discovery {
            versions: self.versions,
            namespaced: self.namespaced,
            cluster: self.cluster,
        });

        let mut router = router.route("/apis", any(root_discovery));

        for group in groups {
            let d = discovery.clone();
            let name = group.clone();
            router = router.route(
                &format!("/apis/{}", group),
                get(move |headers: HeaderMap| {
                    let d = d.clone();
                    let name = name.clone();
                    async move { d.group_document(&name, &headers) }
                }),
            );
        }

        for gv in versions {
            let d = discovery.clone();
            let list_gv = gv.clone();
            router = router.route(
                &format!("/apis/{}/{}", gv.group, gv.version),
                get(move |headers: HeaderMap| {
                    let d = d.clone();
                    let gv = list_gv.clone();
                    async move { d.resource_list(&gv, &headers) }
                }),
            );

            let d = discovery.clone();
            let dispatch_gv = gv.clone();
            router = router.route(
                &format!("/apis/{}/{}/{{*rest}}", gv.group, gv.version),
                any(move |request: Request| {
                    let d = d.clone();
                    let gv = dispatch_gv.clone();
                    async move { d.dispatch(&gv, request).await }
                }),
            );
        }

        router
    }
}

async fn root_discovery() -> Response {
    Error::Status {
        code: StatusCode::NOT_ACCEPTABLE.as_u16(),
        reason: "NotAcceptable".to_string(),
        message: "group discovery is served by the aggregation layer".to_string(),
    }
    .into_response()
}

struct Discovery {
    versions: Vec<(GroupVersion, Vec<ResourceDescriptor>)>,
    namespaced: HashMap<HandlerKey, Arc<dyn ResourceHandler>>,
    cluster: HashMap<HandlerKey, Arc<dyn ResourceHandler>>,
}

impl Discovery {
    fn group_document(&self, group: &str, headers: &HeaderMap) -> Response {
        let versions: Vec<GroupVersionForDiscovery> = self
            .versions
            .iter()
            .filter(|(gv, _)| gv.group == group)
            .map(|(gv, _)| GroupVersionForDiscovery {
                group_version: gv.api_version(),
                version: gv.version.clone(),
            })
            .collect();
        let document = APIGroup {
            name: group.to_string(),
            preferred_version: versions.first().cloned(),
            versions,
            ..Default::default()
        };
        respond(StatusCode::OK, negotiate_or_json(headers), &document)
            .unwrap_or_else(IntoResponse::into_response)
    }

    fn resource_list(&self, gv: &GroupVersion, headers: &HeaderMap) -> Response {
        let resources = self
            .versions
            .iter()
            .find(|(candidate, _)| candidate == gv)
            .map(|(_, resources)| resources.iter().map(ResourceDescriptor::to_api_resource).collect())
            .unwrap_or_default();
        let document = APIResourceList {
            group_version: gv.api_version(),
            resources,
        };
        respond(StatusCode::OK, negotiate_or_json(headers), &document)
            .unwrap_or_else(IntoResponse::into_response)
    }

    fn handler(&self, gv: &GroupVersion, path: &ResourcePath) -> Option<Arc<dyn ResourceHandler>> {
        let key = (gv.clone(), path.resource.clone());
        let handlers = if path.is_namespaced() {
            &self.namespaced
        } else {
            &self.cluster
        };
        handlers.get(&key).cloned()
    }

    async fn dispatch(&self, gv: &GroupVersion, request: Request) -> Response {
        let path = request.uri().path().to_string();
        let parsed = split_api_path(&path).and_then(|(_, _, rest)| parse_resource_path(rest));
        let Some(resource_path) = parsed else {
            return not_found().into_response();
        };
        if resource_path.subresource.is_some() {
            return not_found().into_response();
        }
        let Some(handler) = self.handler(gv, &resource_path) else {
            return not_found().into_response();
        };

        debug!(
            method = %request.method(),
            group_version = %gv,
            resource = %resource_path.resource,
            namespace = %resource_path.namespace,
            name = ?resource_path.name,
            "dispatching resource request"
        );

        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                return Error::BadRequest(format!("failed to read request body: {}", e))
                    .into_response()
            }
        };

        let request = ResourceRequest {
            parts,
            body,
            namespace: resource_path.namespace,
            name: resource_path.name,
        };
        match handler.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                if e.status_code().is_server_error() {
                    warn!(group_version = %gv, error = %e, "resource handler failed");
                }
                e.into_response()
            }
        }
    }
}

fn not_found() -> Error {
    Error::NotFound("the server could not find the requested resource".to_string())
}
