//! Runtime switches read from a ConfigMap
//!
//! Keys:
//! - `enabled`: `"true"` or `"false"`, turns the whole server on or off
//! - `authenticator.<name>`: `"true"` or `"false"`, toggles one authenticator
//!
//! Missing keys leave the current setting alone, as does deleting the
//! ConfigMap.

use std::collections::BTreeMap;
use std::sync::Arc;

use aperture_api::ExtensionController;
use aperture_auth::AuthenticatorRegistry;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ENABLED_KEY: &str = "enabled";
const AUTHENTICATOR_PREFIX: &str = "authenticator.";

/// Switches parsed from ConfigMap data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub enabled: Option<bool>,
    pub authenticators: BTreeMap<String, bool>,
}

fn parse_bool(key: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        other => {
            warn!(key = %key, value = %other, "ignoring non-boolean setting");
            None
        }
    }
}

impl Settings {
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let mut settings = Settings::default();
        for (key, value) in data {
            if key == ENABLED_KEY {
                settings.enabled = parse_bool(key, value);
            } else if let Some(name) = key.strip_prefix(AUTHENTICATOR_PREFIX) {
                if let Some(enabled) = parse_bool(key, value) {
                    settings.authenticators.insert(name.to_string(), enabled);
                }
            }
        }
        settings
    }

    /// Push the switches into the registry and controller
    ///
    /// Authenticators are toggled first so a server coming up already uses
    /// the configured set.
    pub async fn apply(&self, registry: &AuthenticatorRegistry, controller: &ExtensionController) {
        for (name, enabled) in &self.authenticators {
            match registry.set_enabled(name, *enabled) {
                Ok(()) => debug!(authenticator = %name, enabled, "authenticator toggled"),
                Err(e) => warn!(authenticator = %name, error = %e, "cannot toggle authenticator"),
            }
        }
        if let Some(enabled) = self.enabled {
            if let Err(e) = controller.set_enabled(enabled).await {
                error!(enabled, error = %e, "failed to apply enabled setting");
            }
        }
    }
}

/// Follow the settings ConfigMap until `cancel` fires
pub async fn watch_settings(
    client: Client,
    namespace: String,
    name: String,
    registry: Arc<AuthenticatorRegistry>,
    controller: Arc<ExtensionController>,
    cancel: CancellationToken,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
    let mut stream = watcher::watcher(api, config).boxed();
    info!(namespace = %namespace, configmap = %name, "watching settings");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(Event::Apply(cm))) | Some(Ok(Event::InitApply(cm))) => {
                let settings = Settings::from_data(&cm.data.unwrap_or_default());
                info!(?settings, "settings changed");
                settings.apply(&registry, &controller).await;
            }
            Some(Ok(Event::Delete(_))) => {
                warn!(configmap = %name, "settings ConfigMap deleted, keeping current settings");
            }
            Some(Ok(Event::Init)) | Some(Ok(Event::InitDone)) => {}
            Some(Err(e)) => warn!(error = %e, "settings watch error"),
            None => break,
        }
    }
    debug!("settings watch stopped");
}
