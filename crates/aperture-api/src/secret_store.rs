//! A generic [`Store`] persisting objects as secret-store records
//!
//! Each object is one record holding its JSON document. Records are named
//! `<len>.<plural>.<group>.<name>`, where `len` is the length of
//! `<plural>.<group>`, so no two (resource, name) pairs share a record even
//! when group names contain dots or dashes. Records are also labelled with the resource so list and watch can select
//! them. Cluster-scoped objects live in a fixed namespace.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use aperture_common::{
    SecretEvent, SecretRecord, SecretSelector, SecretStore, SecretStoreError,
    APERTURE_SYSTEM_NAMESPACE, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use async_trait::async_trait;
use futures::{future, StreamExt};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::discovery::{GroupVersion, ResourceDescriptor};
use crate::error::{Error, Result};
use crate::store::{ListOptions, RequestContext, ResourceList, Store, WatchEvent, WatchStream};

/// Record data key holding the object's JSON
pub const OBJECT_KEY: &str = "object";

/// Label naming the resource a record belongs to
pub const RESOURCE_LABEL: &str = "aperture.dev/resource";

/// Objects of one resource kept in a [`SecretStore`]
pub struct SecretBackedStore<T> {
    store: Arc<dyn SecretStore>,
    resource: String,
    namespaced: bool,
    cluster_namespace: String,
    _object: PhantomData<fn() -> T>,
}

impl<T> SecretBackedStore<T>
where
    T: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Store for `descriptor` under `group_version`
    pub fn new(
        store: Arc<dyn SecretStore>,
        group_version: &GroupVersion,
        descriptor: &ResourceDescriptor,
    ) -> Self {
        Self {
            store,
            resource: format!("{}.{}", descriptor.plural, group_version.group),
            namespaced: descriptor.namespaced,
            cluster_namespace: APERTURE_SYSTEM_NAMESPACE.to_string(),
            _object: PhantomData,
        }
    }

    /// Keep cluster-scoped objects in `namespace`
    pub fn with_cluster_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.cluster_namespace = namespace.into();
        self
    }

    fn record_namespace(&self, ctx: &RequestContext) -> Result<String> {
        if !self.namespaced {
            return Ok(self.cluster_namespace.clone());
        }
        if ctx.namespace.is_empty() {
            return Err(Error::BadRequest(format!(
                "{} is namespaced, a namespace is required",
                self.resource
            )));
        }
        Ok(ctx.namespace.clone())
    }

    fn record_name(&self, name: &str) -> String {
        format!("{}.{}.{}", self.resource.len(), self.resource, name)
    }

    fn selector(&self, ctx: &RequestContext) -> SecretSelector {
        let namespace = if !self.namespaced {
            Some(self.cluster_namespace.clone())
        } else if ctx.namespace.is_empty() {
            None
        } else {
            Some(ctx.namespace.clone())
        };
        SecretSelector::labelled(namespace, RESOURCE_LABEL, self.resource.clone())
    }

    fn encode(&self, namespace: String, object: &T) -> Result<SecretRecord> {
        let name = object_name(object)?;
        let mut object = object.clone();
        let resource_version = object.meta_mut().resource_version.take();
        let document = serde_json::to_vec(&object)
            .map_err(|e| Error::Internal(format!("failed to encode {}: {}", self.resource, e)))?;

        let mut record = SecretRecord::new(namespace, self.record_name(&name))
            .with_label(RESOURCE_LABEL, self.resource.clone())
            .with_label(MANAGED_BY_LABEL, MANAGED_BY_VALUE)
            .with_data(OBJECT_KEY, document);
        record.resource_version = resource_version.unwrap_or_default();
        Ok(record)
    }

    fn store_error(&self, name: &str, e: SecretStoreError) -> Error {
        match e {
            SecretStoreError::NotFound { .. } => Error::object_not_found(&self.resource, name),
            SecretStoreError::AlreadyExists { .. } => {
                Error::AlreadyExists(format!("{} \"{}\" already exists", self.resource, name))
            }
            SecretStoreError::Conflict { .. } => Error::Conflict(format!(
                "Operation cannot be fulfilled on {} \"{}\": the object has been modified; \
                 please apply your changes to the latest version and try again",
                self.resource, name
            )),
            SecretStoreError::Backend(msg) => Error::Internal(msg),
        }
    }

    fn scoped(&self, mut object: T, namespace: &str) -> T {
        if self.namespaced {
            object.meta_mut().namespace = Some(namespace.to_string());
        } else {
            object.meta_mut().namespace = None;
        }
        object
    }
}

fn object_name<T: Resource>(object: &T) -> Result<String> {
    object
        .meta()
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::BadRequest("metadata.name is required".to_string()))
}

fn decode_record<T>(record: &SecretRecord) -> Result<T>
where
    T: Resource + DeserializeOwned,
{
    let document = record.data.get(OBJECT_KEY).ok_or_else(|| {
        Error::Internal(format!(
            "record {}/{} has no {} entry",
            record.namespace, record.name, OBJECT_KEY
        ))
    })?;
    let mut object: T = serde_json::from_slice(document).map_err(|e| {
        Error::Internal(format!(
            "record {}/{} holds an invalid object: {}",
            record.namespace, record.name, e
        ))
    })?;
    object.meta_mut().resource_version = Some(record.resource_version.clone());
    Ok(object)
}

#[async_trait]
impl<T> Store<T> for SecretBackedStore<T>
where
    T: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn create(&self, ctx: &RequestContext, object: T) -> Result<T> {
        let namespace = self.record_namespace(ctx)?;
        let name = object_name(&object)?;
        let mut record = self.encode(namespace.clone(), &self.scoped(object, &namespace))?;
        record.resource_version.clear();

        let stored = self
            .store
            .create(record)
            .await
            .map_err(|e| self.store_error(&name, e))?;
        debug!(resource = %self.resource, namespace = %namespace, name = %name, "created object");
        decode_record(&stored)
    }

    async fn update(&self, ctx: &RequestContext, object: T) -> Result<T> {
        let namespace = self.record_namespace(ctx)?;
        let name = object_name(&object)?;
        let record = self.encode(namespace.clone(), &self.scoped(object, &namespace))?;

        let stored = self
            .store
            .update(record)
            .await
            .map_err(|e| self.store_error(&name, e))?;
        debug!(resource = %self.resource, namespace = %namespace, name = %name, "updated object");
        decode_record(&stored)
    }

    async fn get(&self, ctx: &RequestContext, name: &str) -> Result<T> {
        let namespace = self.record_namespace(ctx)?;
        let record = self
            .store
            .get(&namespace, &self.record_name(name))
            .await
            .map_err(|e| self.store_error(name, e))?
            .ok_or_else(|| Error::object_not_found(&self.resource, name))?;
        decode_record(&record)
    }

    async fn list(&self, ctx: &RequestContext, options: &ListOptions) -> Result<ResourceList<T>> {
        let records = self
            .store
            .list(&self.selector(ctx))
            .await
            .map_err(|e| self.store_error("", e))?;

        let mut items: Vec<T> = Vec::with_capacity(records.len());
        for record in &records {
            match decode_record::<T>(record) {
                Ok(object) => {
                    let namespace = object.namespace().unwrap_or_default();
                    if options.matches(&object.name_any(), &namespace, object.labels()) {
                        items.push(object);
                    }
                }
                Err(e) => warn!(resource = %self.resource, error = %e, "skipping undecodable record"),
            }
        }
        items.sort_by_key(|o| (o.namespace().unwrap_or_default(), o.name_any()));
        Ok(ResourceList::new(items))
    }

    async fn watch(&self, ctx: &RequestContext, options: &ListOptions) -> Result<WatchStream<T>> {
        let resource = self.resource.clone();
        let options = options.clone();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        let events = self.store.watch(&self.selector(ctx)).filter_map(move |event| {
            let object = match decode_record::<T>(event.record()) {
                Ok(object) => object,
                Err(e) => {
                    warn!(resource = %resource, error = %e, "skipping undecodable record");
                    return future::ready(None);
                }
            };
            let namespace = object.namespace().unwrap_or_default();
            let key = (namespace.clone(), object.name_any());
            let selected = options.matches(&key.1, &namespace, object.labels());

            let out = match event {
                SecretEvent::Deleted(_) => seen.remove(&key).then(|| WatchEvent::Deleted(object)),
                SecretEvent::Applied(_) if selected => {
                    if seen.insert(key) {
                        Some(WatchEvent::Added(object))
                    } else {
                        Some(WatchEvent::Modified(object))
                    }
                }
                // Changed so it no longer matches
                SecretEvent::Applied(_) => seen.remove(&key).then(|| WatchEvent::Deleted(object)),
            };
            future::ready(out.map(Ok))
        });
        Ok(events.boxed())
    }

    async fn delete(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        let namespace = self.record_namespace(ctx)?;
        let removed = self
            .store
            .delete(&namespace, &self.record_name(name))
            .await
            .map_err(|e| self.store_error(name, e))?;
        if !removed {
            return Err(Error::object_not_found(&self.resource, name));
        }
        debug!(resource = %self.resource, namespace = %namespace, name = %name, "deleted object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_common::MemorySecretStore;
    use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
    use std::time::Duration;

    fn api_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("example.io", "v1", "Widget"))
    }

    fn widget(name: &str, size: u32) -> DynamicObject {
        let mut object = DynamicObject::new(name, &api_resource());
        object.data = serde_json::json!({"spec": {"size": size}});
        object
    }

    fn widgets(store: Arc<MemorySecretStore>) -> SecretBackedStore<DynamicObject> {
        SecretBackedStore::new(
            store,
            &GroupVersion::new("example.io", "v1"),
            &ResourceDescriptor::new("Widget", "widgets"),
        )
    }

    fn ctx(namespace: &str) -> RequestContext {
        RequestContext::new(None, namespace)
    }

    #[tokio::test]
    async fn create_get_delete() {
        let backing = Arc::new(MemorySecretStore::new());
        let store = widgets(backing.clone());

        let created = store.create(&ctx("default"), widget("w1", 1)).await.unwrap();
        assert_eq!(created.namespace().as_deref(), Some("default"));
        assert!(created.resource_version().is_some());

        let record = backing
            .get("default", "18.widgets.example.io.w1")
            .await
            .unwrap()
            .expect("record written under prefixed name");
        assert_eq!(record.labels[RESOURCE_LABEL], "widgets.example.io");

        let fetched = store.get(&ctx("default"), "w1").await.unwrap();
        assert_eq!(fetched.data["spec"]["size"], 1);

        store.delete(&ctx("default"), "w1").await.unwrap();
        let err = store.get(&ctx("default"), "w1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.delete(&ctx("default"), "w1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn names_are_unique_per_namespace() {
        let store = widgets(Arc::new(MemorySecretStore::new()));
        store.create(&ctx("a"), widget("w1", 1)).await.unwrap();
        store.create(&ctx("b"), widget("w1", 2)).await.unwrap();

        let err = store.create(&ctx("a"), widget("w1", 3)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn resources_with_overlapping_prefixes_do_not_collide() {
        let backing = Arc::new(MemorySecretStore::new());
        let widgets = widgets(backing.clone());
        let dashed = SecretBackedStore::<DynamicObject>::new(
            backing,
            &GroupVersion::new("example.io-x", "v1"),
            &ResourceDescriptor::new("Widget", "widgets"),
        );

        // Joined naively both would be "widgets.example.io-x-y"
        widgets.create(&ctx("default"), widget("x-y", 1)).await.unwrap();
        dashed.create(&ctx("default"), widget("y", 2)).await.unwrap();

        assert_eq!(widgets.get(&ctx("default"), "x-y").await.unwrap().data["spec"]["size"], 1);
        assert_eq!(dashed.get(&ctx("default"), "y").await.unwrap().data["spec"]["size"], 2);
        assert!(widgets.get(&ctx("default"), "x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn namespaced_resource_requires_namespace() {
        let store = widgets(Arc::new(MemorySecretStore::new()));
        let err = store.create(&ctx(""), widget("w1", 1)).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = widgets(Arc::new(MemorySecretStore::new()));
        let created = store.create(&ctx("default"), widget("w1", 1)).await.unwrap();

        let mut first = created.clone();
        first.data["spec"]["size"] = 2.into();
        store.update(&ctx("default"), first).await.unwrap();

        let mut stale = created;
        stale.data["spec"]["size"] = 3.into();
        let err = store.update(&ctx("default"), stale).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn update_of_missing_object_is_not_found() {
        let store = widgets(Arc::new(MemorySecretStore::new()));
        let err = store.update(&ctx("default"), widget("ghost", 1)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_selectors() {
        let store = widgets(Arc::new(MemorySecretStore::new()));
        let mut gold = widget("w1", 1);
        gold.labels_mut().insert("tier".to_string(), "gold".to_string());
        store.create(&ctx("a"), gold).await.unwrap();
        store.create(&ctx("a"), widget("w2", 2)).await.unwrap();
        store.create(&ctx("b"), widget("w3", 3)).await.unwrap();

        let all = store.list(&ctx(""), &ListOptions::default()).await.unwrap();
        assert_eq!(all.items.len(), 3);

        let in_a = store.list(&ctx("a"), &ListOptions::default()).await.unwrap();
        let names: Vec<String> = in_a.items.iter().map(|o| o.name_any()).collect();
        assert_eq!(names, vec!["w1", "w2"]);

        let options = ListOptions::parse(Some("tier=gold"), None, None).unwrap();
        let gold = store.list(&ctx(""), &options).await.unwrap();
        assert_eq!(gold.items.len(), 1);

        let options = ListOptions::parse(None, Some("metadata.name=w3"), None).unwrap();
        let named = store.list(&ctx(""), &options).await.unwrap();
        assert_eq!(named.items[0].namespace().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn cluster_scoped_objects_live_in_fixed_namespace() {
        let backing = Arc::new(MemorySecretStore::new());
        let store: SecretBackedStore<DynamicObject> = SecretBackedStore::new(
            backing.clone(),
            &GroupVersion::new("example.io", "v1"),
            &ResourceDescriptor::new("Gadget", "gadgets").cluster_scoped(),
        )
        .with_cluster_namespace("gadget-store");

        let created = store.create(&ctx(""), widget("g1", 1)).await.unwrap();
        assert_eq!(created.namespace(), None);
        assert!(backing
            .get("gadget-store", "18.gadgets.example.io.g1")
            .await
            .unwrap()
            .is_some());
    }

    async fn next(events: &mut WatchStream<DynamicObject>) -> WatchEvent<DynamicObject> {
        tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("event in time")
            .expect("stream open")
            .expect("event ok")
    }

    #[tokio::test]
    async fn watch_reports_added_modified_deleted() {
        let store = widgets(Arc::new(MemorySecretStore::new()));
        store.create(&ctx("default"), widget("w1", 1)).await.unwrap();

        let mut events = store
            .watch(&ctx("default"), &ListOptions::default())
            .await
            .unwrap();

        assert!(matches!(next(&mut events).await, WatchEvent::Added(o) if o.name_any() == "w1"));

        let mut current = store.get(&ctx("default"), "w1").await.unwrap();
        current.data["spec"]["size"] = 5.into();
        store.update(&ctx("default"), current).await.unwrap();
        match next(&mut events).await {
            WatchEvent::Modified(o) => assert_eq!(o.data["spec"]["size"], 5),
            other => panic!("unexpected event: {other:?}"),
        }

        store.delete(&ctx("default"), "w1").await.unwrap();
        assert!(matches!(next(&mut events).await, WatchEvent::Deleted(_)));
    }
}
