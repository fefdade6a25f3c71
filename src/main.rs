//! Aperture - API extension server with live-rotated TLS and toggleable
//! authentication

mod config;
mod settings;

use std::sync::Arc;

use anyhow::Context;
use aperture_api::controller::{ControllerError, RegistrationCleaner};
use aperture_api::middleware::AuthState;
use aperture_api::{
    server, server_config, DiscoveryRouter, ExtensionController, KubeRegistrationCleaner,
    ResourceDelegate, SecretBackedStore,
};
use aperture_auth::{
    AllowListAuthorizer, AlwaysAllowAuthorizer, AuthenticatorRegistry, Authorizer, CaSource,
    DynamicCaBundle, Evaluator, RequestHeaderAuthenticator, SecretCaRefresher,
    SubjectAccessReviewAuthorizer, TokenReviewAuthenticator, TrustRefresher, X509Authenticator,
};
use aperture_common::telemetry::{init_telemetry, TelemetryConfig};
use aperture_common::{KubeSecretStore, MemorySecretStore, SecretStore};
use aperture_listener::ManagedListener;
use aperture_pki::{CaBundle, CertificateRotator};
use async_trait::async_trait;
use clap::Parser;
use kube::api::DynamicObject;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Cli;

/// Cleaner for standalone mode, where nothing is registered
pub(crate) struct NoRegistration;

#[async_trait]
impl RegistrationCleaner for NoRegistration {
    async fn cleanup(&self) -> Result<(), ControllerError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig {
        json: !cli.log_text,
        ..TelemetryConfig::default()
    })?;

    let client = if cli.standalone {
        info!("running standalone: in-memory storage, allow-all authorization");
        None
    } else {
        Some(
            Client::try_default()
                .await
                .context("failed to create Kubernetes client")?,
        )
    };

    let secrets: Arc<dyn SecretStore> = match &client {
        Some(client) => Arc::new(KubeSecretStore::new(client.clone())),
        None => Arc::new(MemorySecretStore::new()),
    };

    let cancel = CancellationToken::new();

    let rotator = Arc::new(CertificateRotator::new(cli.rotator_config(), secrets.clone()).await);

    let registry = Arc::new(AuthenticatorRegistry::new());
    register_authenticators(&cli, &registry, &secrets, client.as_ref());
    registry.run(cancel.clone(), cli.trust_workers)?;

    let authorizer: Arc<dyn Authorizer> = match &client {
        Some(client) => Arc::new(AllowListAuthorizer::new(Arc::new(
            SubjectAccessReviewAuthorizer::new(client.clone()),
        ))),
        None => Arc::new(AllowListAuthorizer::new(Arc::new(AlwaysAllowAuthorizer))),
    };

    let mut discovery = DiscoveryRouter::new();
    for spec in &cli.resources {
        let descriptor = spec.descriptor();
        let store = Arc::new(SecretBackedStore::<DynamicObject>::new(
            secrets.clone(),
            &spec.group_version,
            &descriptor,
        ));
        let delegate = ResourceDelegate::new(spec.group_version.clone(), &descriptor, store);
        discovery.add_resource(spec.group_version.clone(), descriptor, Arc::new(delegate));
        info!(group_version = %spec.group_version, kind = %spec.kind, "serving resource");
    }
    if cli.resources.is_empty() {
        warn!("no resources configured, only discovery will be served");
    }
    let group_versions = discovery.group_versions();

    let cleaner: Arc<dyn RegistrationCleaner> = match &client {
        Some(client) => {
            let cleaner = KubeRegistrationCleaner::new(client.clone(), group_versions);
            Arc::new(match &cli.service_name {
                Some(service) => cleaner.with_service(cli.namespace.clone(), service.clone()),
                None => cleaner,
            })
        }
        None => Arc::new(NoRegistration),
    };

    let app = server::app(discovery, AuthState::new(registry.clone(), authorizer));
    let tls = server_config(rotator.clone(), registry.clone())?;
    let listener = Arc::new(ManagedListener::new(cli.bind_address));
    let controller = Arc::new(ExtensionController::new(
        listener.clone(),
        rotator,
        cleaner,
        cancel.clone(),
    ));

    let accept_loop = tokio::spawn(server::serve(listener, tls, app, cancel.clone()));

    if let Err(e) = controller.set_enabled(cli.enabled).await {
        warn!(error = %e, enabled = cli.enabled, "initial toggle failed");
    }
    if let Some(client) = client {
        tokio::spawn(settings::watch_settings(
            client,
            cli.namespace.clone(),
            cli.settings_configmap.clone(),
            registry.clone(),
            controller.clone(),
            cancel.clone(),
        ));
    }

    shutdown_signal().await;
    info!("shutting down");
    cancel.cancel();
    controller.shutdown().await?;
    accept_loop.await?;
    Ok(())
}

/// Register the built-in authenticators the flags call for
fn register_authenticators(
    cli: &Cli,
    registry: &AuthenticatorRegistry,
    secrets: &Arc<dyn SecretStore>,
    client: Option<&Client>,
) {
    let trust_from = |name: &str, secret: &str| -> (Arc<DynamicCaBundle>, Arc<dyn TrustRefresher>) {
        let trust = Arc::new(DynamicCaBundle::new(name, CaBundle::empty()));
        let refresher = SecretCaRefresher::new(
            secrets.clone(),
            vec![CaSource::new(cli.namespace.clone(), secret)],
            trust.clone(),
        );
        (trust, Arc::new(refresher))
    };

    if let Some(secret) = &cli.client_ca_secret {
        let (trust, refresher) = trust_from("client-ca", secret);
        registry.add("x509", X509Authenticator::evaluator(trust, Some(refresher)), true);
    }

    if let Some(secret) = &cli.requestheader_ca_secret {
        let (trust, refresher) = trust_from("requestheader-ca", secret);
        registry.add(
            "requestheader",
            RequestHeaderAuthenticator::evaluator(cli.request_header_config(), trust, Some(refresher)),
            true,
        );
    }

    if let Some(client) = client {
        let token_review = if cli.token_audiences.is_empty() {
            TokenReviewAuthenticator::new(client.clone())
        } else {
            TokenReviewAuthenticator::with_audiences(client.clone(), cli.token_audiences.clone())
        };
        registry.add("tokenreview", Evaluator::new(Arc::new(token_review)), true);
    }

    for (name, enabled) in registry.entries() {
        info!(authenticator = %name, enabled, "authenticator registered");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
