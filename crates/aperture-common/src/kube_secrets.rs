//! [`SecretStore`] backed by Kubernetes Secrets

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tracing::{debug, warn};

use crate::secrets::{Result, SecretEvent, SecretRecord, SecretSelector, SecretStore, SecretStoreError};

/// Secret store writing `Opaque` Secrets through the API server
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn selected_api(&self, selector: &SecretSelector) -> Api<Secret> {
        match &selector.namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        }
    }
}

fn to_secret(record: &SecretRecord) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(record.name.clone()),
            namespace: Some(record.namespace.clone()),
            labels: (!record.labels.is_empty()).then(|| record.labels.clone()),
            resource_version: (!record.resource_version.is_empty())
                .then(|| record.resource_version.clone()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            record
                .data
                .iter()
                .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                .collect(),
        ),
        ..Default::default()
    }
}

fn from_secret(secret: Secret) -> SecretRecord {
    let data: BTreeMap<String, Vec<u8>> = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.0))
        .collect();
    SecretRecord {
        namespace: secret.metadata.namespace.unwrap_or_default(),
        name: secret.metadata.name.unwrap_or_default(),
        labels: secret.metadata.labels.unwrap_or_default(),
        data,
        resource_version: secret.metadata.resource_version.unwrap_or_default(),
    }
}

fn map_kube_error(e: kube::Error, namespace: &str, name: &str) -> SecretStoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => SecretStoreError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            SecretStoreError::AlreadyExists {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => SecretStoreError::Conflict {
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        other => SecretStoreError::Backend(other.to_string()),
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretRecord>> {
        match self.api(namespace).get(name).await {
            Ok(secret) => Ok(Some(from_secret(secret))),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(map_kube_error(e, namespace, name)),
        }
    }

    async fn create(&self, record: SecretRecord) -> Result<SecretRecord> {
        let mut secret = to_secret(&record);
        secret.metadata.resource_version = None;
        let created = self
            .api(&record.namespace)
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| map_kube_error(e, &record.namespace, &record.name))?;
        debug!(namespace = %record.namespace, name = %record.name, "created secret");
        Ok(from_secret(created))
    }

    async fn update(&self, record: SecretRecord) -> Result<SecretRecord> {
        let replaced = self
            .api(&record.namespace)
            .replace(&record.name, &PostParams::default(), &to_secret(&record))
            .await
            .map_err(|e| map_kube_error(e, &record.namespace, &record.name))?;
        debug!(namespace = %record.namespace, name = %record.name, "updated secret");
        Ok(from_secret(replaced))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(map_kube_error(e, namespace, name)),
        }
    }

    async fn list(&self, selector: &SecretSelector) -> Result<Vec<SecretRecord>> {
        let mut params = ListParams::default();
        if let Some(labels) = selector.label_selector() {
            params = params.labels(&labels);
        }
        if let Some(name) = &selector.name {
            params = params.fields(&format!("metadata.name={}", name));
        }
        let list = self
            .selected_api(selector)
            .list(&params)
            .await
            .map_err(|e| SecretStoreError::Backend(e.to_string()))?;
        Ok(list.items.into_iter().map(from_secret).collect())
    }

    fn watch(&self, selector: &SecretSelector) -> BoxStream<'static, SecretEvent> {
        let mut config = watcher::Config::default();
        if let Some(labels) = selector.label_selector() {
            config = config.labels(&labels);
        }
        if let Some(name) = &selector.name {
            config = config.fields(&format!("metadata.name={}", name));
        }

        watcher::watcher(self.selected_api(selector), config)
            .filter_map(|event| async move {
                match event {
                    Ok(Event::Apply(secret)) | Ok(Event::InitApply(secret)) => {
                        Some(SecretEvent::Applied(from_secret(secret)))
                    }
                    Ok(Event::Delete(secret)) => Some(SecretEvent::Deleted(from_secret(secret))),
                    Ok(Event::Init) | Ok(Event::InitDone) => None,
                    Err(e) => {
                        // The watcher retries on its own
                        warn!(error = %e, "secret watch error");
                        None
                    }
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_secret() {
        let record = SecretRecord::new("ns", "serving")
            .with_label("app", "aperture")
            .with_data("tls.crt", b"cert".to_vec());
        let secret = to_secret(&record);
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert!(secret.metadata.resource_version.is_none());

        let back = from_secret(secret);
        assert_eq!(back, record);
    }

    #[test]
    fn not_found_maps_to_typed_error() {
        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "secrets \"x\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert!(map_kube_error(err, "ns", "x").is_not_found());
    }

    #[test]
    fn conflict_variants_are_distinguished() {
        let exists = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "exists".into(),
            reason: "AlreadyExists".into(),
            code: 409,
        });
        assert!(matches!(
            map_kube_error(exists, "ns", "x"),
            SecretStoreError::AlreadyExists { .. }
        ));

        let stale = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        });
        assert!(matches!(
            map_kube_error(stale, "ns", "x"),
            SecretStoreError::Conflict { .. }
        ));
    }
}
