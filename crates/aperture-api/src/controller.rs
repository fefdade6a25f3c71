//! On/off control of the extension server
//!
//! Enabling starts the listener and the certificate rotator together.
//! Disabling stops both and removes the server's registration with the
//! aggregation layer, so the cluster stops routing to a server that no longer
//! answers.

use std::sync::Arc;

use aperture_listener::{ListenerError, ManagedListener};
use aperture_pki::{CertificateRotator, PkiError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::Client;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::GroupVersion;

/// Errors from enabling or disabling the server
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Listener transition failed
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    /// No serving certificate could be produced
    #[error("certificate error: {0}")]
    Certificate(#[from] PkiError),

    /// Registration cleanup failed
    #[error("cleanup failed: {0}")]
    Cleanup(String),
}

/// Removes the server's registration when it is turned off
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistrationCleaner: Send + Sync {
    /// Delete every registration record; already-missing records are fine
    async fn cleanup(&self) -> Result<(), ControllerError>;
}

/// Deletes APIService records and the fronting Service
pub struct KubeRegistrationCleaner {
    client: Client,
    group_versions: Vec<GroupVersion>,
    service: Option<(String, String)>,
}

impl KubeRegistrationCleaner {
    /// Cleaner for the APIServices of `group_versions`
    pub fn new(client: Client, group_versions: Vec<GroupVersion>) -> Self {
        Self {
            client,
            group_versions,
            service: None,
        }
    }

    /// Also delete the Service `namespace/name`
    pub fn with_service(mut self, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        self.service = Some((namespace.into(), name.into()));
        self
    }

    fn api_services(&self) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(&GroupVersionKind {
            group: "apiregistration.k8s.io".to_string(),
            version: "v1".to_string(),
            kind: "APIService".to_string(),
        });
        Api::all_with(self.client.clone(), &resource)
    }
}

/// APIService name for a group/version
pub fn api_service_name(gv: &GroupVersion) -> String {
    format!("{}.{}", gv.version, gv.group)
}

#[async_trait]
impl RegistrationCleaner for KubeRegistrationCleaner {
    async fn cleanup(&self) -> Result<(), ControllerError> {
        let mut failures = Vec::new();

        let api_services = self.api_services();
        for gv in &self.group_versions {
            let name = api_service_name(gv);
            match api_services.delete(&name, &DeleteParams::default()).await {
                Ok(_) => info!(apiservice = %name, "APIService deleted"),
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    debug!(apiservice = %name, "APIService already gone")
                }
                Err(e) => failures.push(format!("apiservice {}: {}", name, e)),
            }
        }

        if let Some((namespace, name)) = &self.service {
            let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
            match services.delete(name, &DeleteParams::default()).await {
                Ok(_) => info!(namespace = %namespace, service = %name, "Service deleted"),
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    debug!(namespace = %namespace, service = %name, "Service already gone")
                }
                Err(e) => failures.push(format!("service {}/{}: {}", namespace, name, e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ControllerError::Cleanup(failures.join("; ")))
        }
    }
}

#[derive(Default)]
struct ControllerState {
    rotation: Option<(CancellationToken, JoinHandle<()>)>,
}

/// Turns the listener and rotator on and off together
pub struct ExtensionController {
    listener: Arc<ManagedListener>,
    rotator: Arc<CertificateRotator>,
    cleaner: Arc<dyn RegistrationCleaner>,
    cancel: CancellationToken,
    /// `None` until the first toggle; written only under `state`
    enabled: watch::Sender<Option<bool>>,
    /// Serialises transitions; never held across secret-store calls
    state: Mutex<ControllerState>,
}

impl ExtensionController {
    /// Controller over `listener` and `rotator`; background work runs under
    /// children of `cancel`
    pub fn new(
        listener: Arc<ManagedListener>,
        rotator: Arc<CertificateRotator>,
        cleaner: Arc<dyn RegistrationCleaner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            listener,
            rotator,
            cleaner,
            cancel,
            enabled: watch::Sender::new(None),
            state: Mutex::new(ControllerState::default()),
        }
    }

    /// Whether the server is currently on
    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow() == Some(true)
    }

    /// Receiver notified on every toggle
    pub fn subscribe(&self) -> watch::Receiver<Option<bool>> {
        self.enabled.subscribe()
    }

    /// Turn the server on or off; repeating the current setting is a no-op
    ///
    /// The first call to turn off also cleans up, so a server that starts
    /// disabled removes registrations left behind by an earlier run.
    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ControllerError> {
        if enabled && !self.is_enabled() {
            self.rotator.rotate_if_needed().await?;
        }

        let mut state = self.state.lock().await;
        let previous = *self.enabled.borrow();
        if previous == Some(enabled) {
            return Ok(());
        }

        if enabled {
            self.listener.start().await?;

            let token = self.cancel.child_token();
            let rotator = self.rotator.clone();
            let run_token = token.clone();
            let handle = tokio::spawn(async move { rotator.run(run_token).await });
            state.rotation = Some((token, handle));
            self.enabled.send_replace(Some(true));
            info!("extension server enabled");
            return Ok(());
        }

        if previous == Some(true) {
            self.listener.stop().await?;
        }
        let rotation = state.rotation.take();
        self.enabled.send_replace(Some(false));
        drop(state);

        if let Some(rotation) = rotation {
            stop_rotation(rotation).await;
        }
        info!("extension server disabled");

        self.cleaner.cleanup().await
    }

    /// Close the listener for good and stop rotation
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        let rotation = state.rotation.take();
        self.listener.close().await?;
        drop(state);

        if let Some(rotation) = rotation {
            stop_rotation(rotation).await;
        }
        Ok(())
    }
}

async fn stop_rotation((token, handle): (CancellationToken, JoinHandle<()>)) {
    token.cancel();
    if let Err(e) = handle.await {
        warn!(error = %e, "certificate rotation task failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use aperture_common::secrets::Result as StoreResult;
    use aperture_common::{MemorySecretStore, SecretEvent, SecretRecord, SecretSelector, SecretStore};
    use futures::stream::BoxStream;
    use tokio::sync::Notify;
    use aperture_listener::ListenerState;
    use aperture_pki::RotatorConfig;

    async fn controller(cleaner: MockRegistrationCleaner) -> ExtensionController {
        let rotator = Arc::new(
            CertificateRotator::new(
                RotatorConfig::new("aperture-system", "serving-cert", vec!["localhost".to_string()]),
                Arc::new(MemorySecretStore::new()),
            )
            .await,
        );
        ExtensionController::new(
            Arc::new(ManagedListener::new("127.0.0.1:0".parse().unwrap())),
            rotator,
            Arc::new(cleaner),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn enable_starts_listener_and_certificate() {
        let mut cleaner = MockRegistrationCleaner::new();
        cleaner.expect_cleanup().never();
        let controller = controller(cleaner).await;

        controller.set_enabled(true).await.unwrap();
        assert!(controller.is_enabled());
        assert_eq!(controller.listener.state().await, ListenerState::Started);
        assert!(controller.rotator.current().is_some());

        // repeated enable is a no-op rather than AlreadyStarted
        controller.set_enabled(true).await.unwrap();
    }

    #[tokio::test]
    async fn disable_stops_and_cleans_up() {
        let mut cleaner = MockRegistrationCleaner::new();
        cleaner.expect_cleanup().times(1).returning(|| Ok(()));
        let controller = controller(cleaner).await;

        controller.set_enabled(true).await.unwrap();
        controller.set_enabled(false).await.unwrap();
        assert!(!controller.is_enabled());
        assert_eq!(controller.listener.state().await, ListenerState::Stopped);
        assert!(controller.state.lock().await.rotation.is_none());

        controller.set_enabled(false).await.unwrap();
    }

    #[tokio::test]
    async fn starting_disabled_cleans_up_once() {
        let mut cleaner = MockRegistrationCleaner::new();
        cleaner.expect_cleanup().times(1).returning(|| Ok(()));
        let controller = controller(cleaner).await;

        controller.set_enabled(false).await.unwrap();
        assert_eq!(controller.listener.state().await, ListenerState::Stopped);
    }

    #[tokio::test]
    async fn cleanup_failure_is_reported() {
        let mut cleaner = MockRegistrationCleaner::new();
        cleaner
            .expect_cleanup()
            .returning(|| Err(ControllerError::Cleanup("apiservice v1.example.io: boom".into())));
        let controller = controller(cleaner).await;

        controller.set_enabled(true).await.unwrap();
        let err = controller.set_enabled(false).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        // the server is off regardless
        assert!(!controller.is_enabled());
    }

    #[tokio::test]
    async fn can_be_toggled_back_on() {
        let mut cleaner = MockRegistrationCleaner::new();
        cleaner.expect_cleanup().returning(|| Ok(()));
        let controller = controller(cleaner).await;

        for _ in 0..2 {
            controller.set_enabled(true).await.unwrap();
            controller.set_enabled(false).await.unwrap();
        }
        controller.set_enabled(true).await.unwrap();
        assert_eq!(controller.listener.state().await, ListenerState::Started);

        controller.shutdown().await.unwrap();
        assert_eq!(controller.listener.state().await, ListenerState::Closed);
    }

    /// Holds `get` calls until released while `stalled` is set
    #[derive(Default)]
    struct StallingStore {
        inner: MemorySecretStore,
        stalled: AtomicBool,
        release: Notify,
    }

    #[async_trait]
    impl SecretStore for StallingStore {
        async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<SecretRecord>> {
            if self.stalled.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            self.inner.get(namespace, name).await
        }

        async fn create(&self, record: SecretRecord) -> StoreResult<SecretRecord> {
            self.inner.create(record).await
        }

        async fn update(&self, record: SecretRecord) -> StoreResult<SecretRecord> {
            self.inner.update(record).await
        }

        async fn delete(&self, namespace: &str, name: &str) -> StoreResult<bool> {
            self.inner.delete(namespace, name).await
        }

        async fn list(&self, selector: &SecretSelector) -> StoreResult<Vec<SecretRecord>> {
            self.inner.list(selector).await
        }

        fn watch(&self, selector: &SecretSelector) -> BoxStream<'static, SecretEvent> {
            self.inner.watch(selector)
        }
    }

    #[tokio::test]
    async fn slow_store_does_not_hold_the_transition_lock() {
        let store = Arc::new(StallingStore::default());
        let rotator = Arc::new(
            CertificateRotator::new(
                RotatorConfig::new("aperture-system", "serving-cert", vec!["localhost".to_string()]),
                store.clone(),
            )
            .await,
        );
        let mut cleaner = MockRegistrationCleaner::new();
        cleaner.expect_cleanup().never();
        let controller = Arc::new(ExtensionController::new(
            Arc::new(ManagedListener::new("127.0.0.1:0".parse().unwrap())),
            rotator,
            Arc::new(cleaner),
            CancellationToken::new(),
        ));

        store.stalled.store(true, Ordering::SeqCst);
        let enabling = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.set_enabled(true).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!enabling.is_finished());
        assert!(!controller.is_enabled());
        assert!(controller.state.try_lock().is_ok(), "lock held across store I/O");

        store.stalled.store(false, Ordering::SeqCst);
        store.release.notify_one();
        tokio::time::timeout(Duration::from_secs(5), enabling)
            .await
            .expect("enable completes once the store answers")
            .unwrap()
            .unwrap();
        assert!(controller.is_enabled());
        assert!(controller.rotator.current().is_some());

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn subscribers_see_toggles() {
        let mut cleaner = MockRegistrationCleaner::new();
        cleaner.expect_cleanup().returning(|| Ok(()));
        let controller = controller(cleaner).await;
        let updates = controller.subscribe();
        assert_eq!(*updates.borrow(), None);

        controller.set_enabled(true).await.unwrap();
        assert_eq!(*updates.borrow(), Some(true));
        controller.set_enabled(false).await.unwrap();
        assert_eq!(*updates.borrow(), Some(false));
    }

    #[test]
    fn api_service_names() {
        assert_eq!(
            api_service_name(&GroupVersion::new("example.io", "v1beta1")),
            "v1beta1.example.io"
        );
    }
}
