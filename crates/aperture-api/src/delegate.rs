//! Verb dispatch from HTTP requests to a [`Store`]

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Query;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::discovery::{GroupVersion, ResourceDescriptor, ResourceHandler, ResourceRequest};
use crate::error::{Error, Result, Status};
use crate::negotiate::{body_media_type, content_type, negotiate, respond, MediaType, MERGE_PATCH};
use crate::patch::merge_patch;
use crate::store::{ListOptions, RequestContext, Store, WatchEvent};

/// Content type of watch responses
pub const WATCH_CONTENT_TYPE: &str = "application/json;stream=watch";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryParams {
    watch: Option<String>,
    label_selector: Option<String>,
    field_selector: Option<String>,
    resource_version: Option<String>,
}

impl QueryParams {
    fn is_watch(&self) -> bool {
        matches!(self.watch.as_deref(), Some("true" | "1"))
    }

    fn list_options(&self) -> Result<ListOptions> {
        ListOptions::parse(
            self.label_selector.as_deref(),
            self.field_selector.as_deref(),
            self.resource_version.as_deref(),
        )
    }
}

/// Serves one resource from a [`Store`]
pub struct ResourceDelegate<T> {
    group_version: GroupVersion,
    kind: String,
    resource: String,
    namespaced: bool,
    store: Arc<dyn Store<T>>,
}

impl<T> ResourceDelegate<T>
where
    T: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Delegate for `descriptor` backed by `store`
    pub fn new(
        group_version: GroupVersion,
        descriptor: &ResourceDescriptor,
        store: Arc<dyn Store<T>>,
    ) -> Self {
        Self {
            resource: format!("{}.{}", descriptor.plural, group_version.group),
            kind: descriptor.kind.clone(),
            namespaced: descriptor.namespaced,
            group_version,
            store,
        }
    }

    fn decode(&self, request: &ResourceRequest) -> Result<T> {
        body_media_type(&request.parts.headers)?.decode(&request.body)
    }

    /// Reconcile body coordinates with the request path
    fn check_target(&self, mut object: T, ctx: &RequestContext, name: Option<&str>) -> Result<T> {
        if let Some(name) = name {
            match object.meta().name.as_deref() {
                None | Some("") => object.meta_mut().name = Some(name.to_string()),
                Some(body_name) if body_name != name => {
                    return Err(Error::BadRequest(format!(
                        "the name of the object ({}) does not match the name on the URL ({})",
                        body_name, name
                    )))
                }
                Some(_) => {}
            }
        }
        if self.namespaced {
            match object.meta().namespace.as_deref() {
                None | Some("") => object.meta_mut().namespace = Some(ctx.namespace.clone()),
                Some(ns) if ns != ctx.namespace => {
                    return Err(Error::BadRequest(
                        "the namespace of the provided object does not match the namespace sent on the request"
                            .to_string(),
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(object)
    }

    fn require_name<'a>(&self, request: &'a ResourceRequest) -> Result<&'a str> {
        request
            .name
            .as_deref()
            .ok_or_else(|| Error::MethodNotAllowed("unsupported request".to_string()))
    }

    async fn get_or_list(
        &self,
        request: &ResourceRequest,
        ctx: &RequestContext,
        media: MediaType,
    ) -> Result<Response> {
        let query = Query::<QueryParams>::try_from_uri(&request.parts.uri)
            .map(|Query(q)| q)
            .map_err(|e| Error::BadRequest(e.to_string()))?;

        if query.is_watch() {
            let mut options = query.list_options()?;
            if let Some(name) = &request.name {
                let by_name = crate::store::Selector::parse(&format!("metadata.name={}", name))?;
                options.field_selector.0.extend(by_name.0);
            }
            return self.watch(ctx, &options).await;
        }

        match &request.name {
            Some(name) => {
                let object = self.store.get(ctx, name).await?;
                respond(StatusCode::OK, media, &object)
            }
            None => {
                let mut list = self.store.list(ctx, &query.list_options()?).await?;
                list.api_version = self.group_version.api_version();
                list.kind = format!("{}List", self.kind);
                respond(StatusCode::OK, media, &list)
            }
        }
    }

    async fn watch(&self, ctx: &RequestContext, options: &ListOptions) -> Result<Response> {
        let events = self.store.watch(ctx, options).await?;
        debug!(resource = %self.resource, namespace = %ctx.namespace, "watch started");

        let lines = events.map(|event| {
            let event = event.unwrap_or_else(|e| WatchEvent::Error(e.to_status()));
            serde_json::to_vec(&event).map(|mut line| {
                line.push(b'\n');
                Bytes::from(line)
            })
        });
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, WATCH_CONTENT_TYPE)
            .body(Body::from_stream(lines))
            .map_err(|e| Error::Internal(e.to_string()))
    }

    async fn create(
        &self,
        request: &ResourceRequest,
        ctx: &RequestContext,
        media: MediaType,
    ) -> Result<Response> {
        if request.name.is_some() {
            return Err(Error::MethodNotAllowed("unsupported request".to_string()));
        }
        let object = self.check_target(self.decode(request)?, ctx, None)?;
        let created = self.store.create(ctx, object).await?;
        respond(StatusCode::CREATED, media, &created)
    }

    async fn put(
        &self,
        request: &ResourceRequest,
        ctx: &RequestContext,
        media: MediaType,
    ) -> Result<Response> {
        let name = self.require_name(request)?;
        let object = self.check_target(self.decode(request)?, ctx, Some(name))?;

        match self.store.get(ctx, name).await {
            Ok(_) => {
                let updated = self.store.update(ctx, object).await?;
                respond(StatusCode::OK, media, &updated)
            }
            Err(e) if e.is_not_found() => {
                let created = self.store.create(ctx, object).await?;
                respond(StatusCode::CREATED, media, &created)
            }
            Err(e) => Err(e),
        }
    }

    async fn patch(
        &self,
        request: &ResourceRequest,
        ctx: &RequestContext,
        media: MediaType,
    ) -> Result<Response> {
        let name = self.require_name(request)?;
        if content_type(&request.parts.headers) != MERGE_PATCH {
            return Err(Error::UnsupportedMediaType("unsupported patch".to_string()));
        }
        let patch: serde_json::Value = serde_json::from_slice(&request.body)
            .map_err(|e| Error::BadRequest(format!("invalid merge patch: {}", e)))?;

        let current = self.store.get(ctx, name).await?;
        let mut document = serde_json::to_value(&current)
            .map_err(|e| Error::Internal(format!("failed to encode {}: {}", self.resource, e)))?;
        merge_patch(&mut document, &patch);
        let patched: T = serde_json::from_value(document)
            .map_err(|e| Error::BadRequest(format!("patched object is invalid: {}", e)))?;

        let patched = self.check_target(patched, ctx, Some(name))?;
        let updated = self.store.update(ctx, patched).await?;
        respond(StatusCode::OK, media, &updated)
    }
}

#[async_trait]
impl<T> ResourceHandler for ResourceDelegate<T>
where
    T: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn handle(&self, request: ResourceRequest) -> Result<Response> {
        let media = negotiate(&request.parts.headers)?;
        let ctx = RequestContext::new(request.user(), request.namespace.clone());

        match request.parts.method {
            Method::GET => self.get_or_list(&request, &ctx, media).await,
            Method::DELETE => {
                let name = self.require_name(&request)?;
                self.store.delete(&ctx, name).await?;
                respond(StatusCode::OK, media, &Status::success())
            }
            Method::POST => self.create(&request, &ctx, media).await,
            Method::PUT => self.put(&request, &ctx, media).await,
            Method::PATCH => self.patch(&request, &ctx, media).await,
            _ => Err(Error::MethodNotAllowed("unsupported request".to_string())),
        }
    }
}
