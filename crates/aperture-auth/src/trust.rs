//! Swappable CA bundles and their background refresh
//!
//! Client-certificate and front-proxy authenticators verify against a
//! [`DynamicCaBundle`]. A [`SecretCaRefresher`] keeps one up to date from
//! secret-store records, reacting to watch events and re-reading on an
//! interval in case an event was missed.

use std::sync::Arc;
use std::time::Duration;

use aperture_common::{SecretSelector, SecretStore, CA_CERT_KEY};
use aperture_pki::CaBundle;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authenticator::{CaContentProvider, TrustRefresher};

/// Default resync interval for trust refresh
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A CA bundle that can be replaced while readers hold snapshots
#[derive(Debug)]
pub struct DynamicCaBundle {
    name: String,
    bundle: ArcSwap<CaBundle>,
}

impl DynamicCaBundle {
    /// Named bundle with initial contents
    pub fn new(name: impl Into<String>, initial: CaBundle) -> Self {
        Self {
            name: name.into(),
            bundle: ArcSwap::from_pointee(initial),
        }
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current contents
    pub fn current(&self) -> Arc<CaBundle> {
        self.bundle.load_full()
    }

    /// Replace the contents; returns whether anything changed
    pub fn replace(&self, bundle: CaBundle) -> bool {
        if **self.bundle.load() == bundle {
            return false;
        }
        info!(
            bundle = %self.name,
            certificates = bundle.len(),
            fingerprint = %bundle.fingerprint(),
            "CA bundle updated"
        );
        self.bundle.store(Arc::new(bundle));
        true
    }
}

impl CaContentProvider for DynamicCaBundle {
    fn ca_bundle(&self) -> CaBundle {
        self.current().as_ref().clone()
    }
}

/// Location of a PEM CA bundle in the secret store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaSource {
    /// Record namespace
    pub namespace: String,
    /// Record name
    pub name: String,
    /// Data key holding the PEM bundle
    pub key: String,
}

impl CaSource {
    /// Source reading the conventional `ca.crt` key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            key: CA_CERT_KEY.to_string(),
        }
    }

    /// Read a different data key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

/// Refreshes a [`DynamicCaBundle`] from secret-store records
pub struct SecretCaRefresher {
    store: Arc<dyn SecretStore>,
    sources: Vec<CaSource>,
    target: Arc<DynamicCaBundle>,
    interval: Duration,
}

impl SecretCaRefresher {
    /// Refresher merging all `sources` into `target`
    pub fn new(
        store: Arc<dyn SecretStore>,
        sources: Vec<CaSource>,
        target: Arc<DynamicCaBundle>,
    ) -> Self {
        Self {
            store,
            sources,
            target,
            interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    /// Override the resync interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    async fn fetch(&self, source: &CaSource) -> Result<Option<CaBundle>, String> {
        let record = self
            .store
            .get(&source.namespace, &source.name)
            .await
            .map_err(|e| e.to_string())?;
        let Some(record) = record else {
            debug!(namespace = %source.namespace, name = %source.name, "CA source not present");
            return Ok(None);
        };
        let Some(pem) = record.data_str(&source.key) else {
            return Err(format!(
                "{}/{} has no {} entry",
                source.namespace, source.name, source.key
            ));
        };
        CaBundle::from_pem(pem).map(Some).map_err(|e| e.to_string())
    }

    /// Re-read every source and swap the merged result in
    ///
    /// A failed source leaves the current bundle untouched.
    pub async fn refresh(&self, workers: usize) -> bool {
        let fetches: Vec<_> = self.sources.iter().map(|source| self.fetch(source)).collect();
        let results: Vec<Result<Option<CaBundle>, String>> = stream::iter(fetches)
            .buffered(workers.max(1))
            .collect()
            .await;

        let mut bundles = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(Some(bundle)) => bundles.push(bundle),
                Ok(None) => {}
                Err(e) => {
                    warn!(bundle = %self.target.name(), error = %e, "CA refresh failed, keeping current bundle");
                    return false;
                }
            }
        }
        self.target.replace(CaBundle::merge(&bundles))
    }
}

#[async_trait]
impl TrustRefresher for SecretCaRefresher {
    async fn run(&self, workers: usize, cancel: CancellationToken) {
        let watches = self.sources.iter().map(|source| {
            self.store
                .watch(&SecretSelector::named(&source.namespace, &source.name))
        });
        let mut events = stream::select_all(watches);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    self.refresh(workers).await;
                }
                event = events.next(), if !events.is_empty() => {
                    if event.is_some() {
                        self.refresh(workers).await;
                    }
                }
            }
        }
    }
}
