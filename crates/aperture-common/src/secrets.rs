//! Secret-store collaborator
//!
//! The certificate rotator, trust refreshers and secret-backed resource
//! stores all persist through [`SecretStore`]. Two implementations exist:
//!
//! - [`MemorySecretStore`] keeps records in process, for standalone mode and tests
//! - [`KubeSecretStore`](crate::KubeSecretStore) maps records onto Kubernetes Secrets
//!
//! Records carry an opaque `resource_version`. `update` is optimistic: it
//! fails with [`SecretStoreError::Conflict`] when the version it was given is
//! no longer current.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Errors returned by secret stores
#[derive(Debug, Error)]
pub enum SecretStoreError {
    /// Record does not exist
    #[error("secret {namespace}/{name} not found")]
    NotFound {
        /// Record namespace
        namespace: String,
        /// Record name
        name: String,
    },

    /// Record already exists
    #[error("secret {namespace}/{name} already exists")]
    AlreadyExists {
        /// Record namespace
        namespace: String,
        /// Record name
        name: String,
    },

    /// Resource version was stale
    #[error("secret {namespace}/{name} was modified concurrently")]
    Conflict {
        /// Record namespace
        namespace: String,
        /// Record name
        name: String,
    },

    /// Backend failure
    #[error("secret store error: {0}")]
    Backend(String),
}

impl SecretStoreError {
    /// Whether the error is a missing-record error
    pub fn is_not_found(&self) -> bool {
        matches!(self, SecretStoreError::NotFound { .. })
    }

    /// Whether the error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SecretStoreError::Conflict { .. } | SecretStoreError::AlreadyExists { .. }
        )
    }
}

/// Result type for secret store operations
pub type Result<T> = std::result::Result<T, SecretStoreError>;

/// A named bag of byte values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretRecord {
    /// Namespace of the record
    pub namespace: String,
    /// Name of the record, unique within the namespace
    pub name: String,
    /// Labels used for selection
    pub labels: BTreeMap<String, String>,
    /// Payload
    pub data: BTreeMap<String, Vec<u8>>,
    /// Opaque version assigned by the store; empty on records not yet persisted
    pub resource_version: String,
}

impl SecretRecord {
    /// New, unpersisted record
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a data entry
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Data entry decoded as UTF-8, if present and valid
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}

/// Which records a list or watch covers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretSelector {
    /// Restrict to one namespace
    pub namespace: Option<String>,
    /// Restrict to one name
    pub name: Option<String>,
    /// Every label listed must match exactly
    pub labels: BTreeMap<String, String>,
}

impl SecretSelector {
    /// Selector for exactly one record
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: Some(name.into()),
            labels: BTreeMap::new(),
        }
    }

    /// Selector for records carrying a label, optionally within a namespace
    pub fn labelled(
        namespace: Option<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(key.into(), value.into());
        Self {
            namespace,
            name: None,
            labels,
        }
    }

    /// Whether a record falls under this selector
    pub fn matches(&self, record: &SecretRecord) -> bool {
        if let Some(ns) = &self.namespace {
            if ns != &record.namespace {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if name != &record.name {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| record.labels.get(k) == Some(v))
    }

    /// Kubernetes label selector string (`k=v,k2=v2`)
    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        Some(
            self.labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// Change notification for a watched record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretEvent {
    /// Record was created or modified (also emitted for the initial state)
    Applied(SecretRecord),
    /// Record was removed
    Deleted(SecretRecord),
}

impl SecretEvent {
    /// The record the event refers to
    pub fn record(&self) -> &SecretRecord {
        match self {
            SecretEvent::Applied(r) | SecretEvent::Deleted(r) => r,
        }
    }
}

/// Persistence for named byte bags
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a record, `None` if absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretRecord>>;

    /// Create a record; fails with `AlreadyExists` if the name is taken
    async fn create(&self, record: SecretRecord) -> Result<SecretRecord>;

    /// Replace a record; `record.resource_version` must be current
    async fn update(&self, record: SecretRecord) -> Result<SecretRecord>;

    /// Remove a record; returns whether it existed
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool>;

    /// List records matching the selector
    async fn list(&self, selector: &SecretSelector) -> Result<Vec<SecretRecord>>;

    /// Stream the current matching records followed by live changes
    fn watch(&self, selector: &SecretSelector) -> BoxStream<'static, SecretEvent>;
}

const MEMORY_EVENT_CAPACITY: usize = 256;

/// In-process [`SecretStore`]
pub struct MemorySecretStore {
    records: RwLock<BTreeMap<(String, String), SecretRecord>>,
    version: AtomicU64,
    events: broadcast::Sender<SecretEvent>,
}

impl MemorySecretStore {
    /// Empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(MEMORY_EVENT_CAPACITY);
        Self {
            records: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            events,
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, event: SecretEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretRecord>> {
        let records = self.records.read();
        Ok(records
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, mut record: SecretRecord) -> Result<SecretRecord> {
        let stored = {
            let mut records = self.records.write();
            let key = (record.namespace.clone(), record.name.clone());
            if records.contains_key(&key) {
                return Err(SecretStoreError::AlreadyExists {
                    namespace: record.namespace,
                    name: record.name,
                });
            }
            record.resource_version = self.next_version();
            records.insert(key, record.clone());
            record
        };
        debug!(namespace = %stored.namespace, name = %stored.name, "created secret");
        self.publish(SecretEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, mut record: SecretRecord) -> Result<SecretRecord> {
        let stored = {
            let mut records = self.records.write();
            let key = (record.namespace.clone(), record.name.clone());
            let Some(existing) = records.get(&key) else {
                return Err(SecretStoreError::NotFound {
                    namespace: record.namespace,
                    name: record.name,
                });
            };
            if !record.resource_version.is_empty()
                && existing.resource_version != record.resource_version
            {
                return Err(SecretStoreError::Conflict {
                    namespace: record.namespace,
                    name: record.name,
                });
            }
            record.resource_version = self.next_version();
            records.insert(key, record.clone());
            record
        };
        debug!(namespace = %stored.namespace, name = %stored.name, "updated secret");
        self.publish(SecretEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        let removed = self
            .records
            .write()
            .remove(&(namespace.to_string(), name.to_string()));
        match removed {
            Some(record) => {
                self.publish(SecretEvent::Deleted(record));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, selector: &SecretSelector) -> Result<Vec<SecretRecord>> {
        let records = self.records.read();
        Ok(records
            .values()
            .filter(|r| selector.matches(r))
            .cloned()
            .collect())
    }

    fn watch(&self, selector: &SecretSelector) -> BoxStream<'static, SecretEvent> {
        // Subscribe before snapshotting so nothing between the two is lost
        let live = BroadcastStream::new(self.events.subscribe());
        let initial: Vec<SecretEvent> = self
            .records
            .read()
            .values()
            .filter(|r| selector.matches(r))
            .cloned()
            .map(SecretEvent::Applied)
            .collect();

        let live_selector = selector.clone();
        let live = live.filter_map(move |event| {
            let out = match event {
                Ok(event) if live_selector.matches(event.record()) => Some(event),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "secret watch lagged, events dropped");
                    None
                }
            };
            futures::future::ready(out)
        });

        stream::iter(initial).chain(live).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> SecretRecord {
        SecretRecord::new("ns", name)
            .with_label("kind", "widget")
            .with_data("value", b"one".to_vec())
    }

    #[tokio::test]
    async fn create_then_get_assigns_version() {
        let store = MemorySecretStore::new();
        let created = store.create(record("a")).await.unwrap();
        assert!(!created.resource_version.is_empty());

        let fetched = store.get("ns", "a").await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert!(store.get("ns", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let store = MemorySecretStore::new();
        store.create(record("a")).await.unwrap();
        let err = store.create(record("a")).await.unwrap_err();
        assert!(matches!(err, SecretStoreError::AlreadyExists { .. }));
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = MemorySecretStore::new();
        let v1 = store.create(record("a")).await.unwrap();
        let v2 = store
            .update(v1.clone().with_data("value", b"two".to_vec()))
            .await
            .unwrap();
        assert_ne!(v1.resource_version, v2.resource_version);

        let err = store.update(v1).await.unwrap_err();
        assert!(matches!(err, SecretStoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = MemorySecretStore::new();
        let err = store.update(record("ghost")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_selector() {
        let store = MemorySecretStore::new();
        store.create(record("a")).await.unwrap();
        store.create(record("b")).await.unwrap();
        store
            .create(SecretRecord::new("other", "c").with_label("kind", "widget"))
            .await
            .unwrap();
        store.create(SecretRecord::new("ns", "d")).await.unwrap();

        let in_ns = store
            .list(&SecretSelector::labelled(Some("ns".into()), "kind", "widget"))
            .await
            .unwrap();
        assert_eq!(in_ns.len(), 2);

        let everywhere = store
            .list(&SecretSelector::labelled(None, "kind", "widget"))
            .await
            .unwrap();
        assert_eq!(everywhere.len(), 3);
    }

    #[tokio::test]
    async fn watch_replays_state_then_streams_changes() {
        let store = MemorySecretStore::new();
        store.create(record("a")).await.unwrap();

        let mut events = store.watch(&SecretSelector::named("ns", "a"));
        let first = events.next().await.unwrap();
        assert!(matches!(first, SecretEvent::Applied(ref r) if r.name == "a"));

        // Changes to other records are filtered out
        store.create(record("b")).await.unwrap();
        assert!(store.delete("ns", "a").await.unwrap());

        let next = events.next().await.unwrap();
        assert!(matches!(next, SecretEvent::Deleted(ref r) if r.name == "a"));
    }

    #[tokio::test]
    async fn delete_missing_reports_false() {
        let store = MemorySecretStore::new();
        assert!(!store.delete("ns", "nope").await.unwrap());
    }

    #[test]
    fn label_selector_renders_pairs() {
        let mut selector = SecretSelector::labelled(None, "a", "1");
        selector.labels.insert("b".into(), "2".into());
        assert_eq!(selector.label_selector().as_deref(), Some("a=1,b=2"));
        assert_eq!(SecretSelector::default().label_selector(), None);
    }
}
