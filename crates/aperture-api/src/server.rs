//! HTTPS accept loop over a [`ManagedListener`]
//!
//! Each accepted connection gets its own task: TLS handshake with the
//! rustls acceptor, then HTTP/1.1 or HTTP/2 serving through hyper. The peer's
//! certificate chain from the handshake is attached to every request on the
//! connection as a [`ClientCertChain`] extension for the x509 and front-proxy
//! authenticators.
//!
//! Stopping the listener parks the loop; closing it ends the loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aperture_auth::ClientCertChain;
use aperture_listener::{is_listener_closed, ManagedListener};
use axum::Router;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use http::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::discovery::DiscoveryRouter;
use crate::middleware::{protect, AuthState};

/// How long open connections may drain after cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Pause after an accept error unrelated to stopping
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Full application router: discovery and resource routes behind auth
pub fn app(discovery: DiscoveryRouter, auth: AuthState) -> Router {
    protect(discovery.register_routes(Router::new()), auth)
}

/// Serve `app` over TLS on `listener` until it is closed or `cancel` fires
pub async fn serve(
    listener: Arc<ManagedListener>,
    tls: Arc<ServerConfig>,
    app: Router,
    cancel: CancellationToken,
) {
    let acceptor = RustlsAcceptor::new(RustlsConfig::from_config(tls));
    info!(addr = %listener.addr(), "accept loop started");

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) if is_listener_closed(&e) => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(acceptor, stream, peer, app, cancel).await {
                debug!(peer = %peer, error = %e, "connection ended with error");
            }
        });
    }

    info!(addr = %listener.addr(), "accept loop stopped");
}

async fn serve_connection(
    acceptor: RustlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    cancel: CancellationToken,
) -> Result<(), BoxError> {
    let (tls, ()) = acceptor.accept(stream, ()).await?;

    let chain = ClientCertChain::new(
        tls.get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
            .unwrap_or_default(),
    );
    debug!(peer = %peer, client_cert = !chain.is_empty(), "TLS handshake complete");

    let service = app.map_request(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(chain.clone());
        request
    });

    let builder = Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(tls), TowerToHyperService::new(service));
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result,
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            match tokio::time::timeout(SHUTDOWN_GRACE, conn.as_mut()).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(peer = %peer, "connection did not drain in time");
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_auth::{AlwaysAllowAuthorizer, AuthenticatorRegistry};
    use aperture_common::MemorySecretStore;
    use aperture_pki::{CertificateRotator, RotatorConfig};

    async fn tls_config() -> Arc<ServerConfig> {
        let rotator = Arc::new(
            CertificateRotator::new(
                RotatorConfig::new("aperture-system", "serving-cert", vec!["localhost".to_string()]),
                Arc::new(MemorySecretStore::new()),
            )
            .await,
        );
        rotator.rotate_if_needed().await.unwrap();
        crate::tls::server_config(rotator, Arc::new(AuthenticatorRegistry::new())).unwrap()
    }

    fn test_app() -> Router {
        let auth = AuthState::new(
            Arc::new(AuthenticatorRegistry::new()),
            Arc::new(AlwaysAllowAuthorizer),
        );
        app(DiscoveryRouter::new(), auth)
    }

    #[tokio::test]
    async fn closing_the_listener_ends_the_loop() {
        let listener = Arc::new(ManagedListener::new("127.0.0.1:0".parse().unwrap()));
        listener.start().await.unwrap();

        let handle = tokio::spawn(serve(
            listener.clone(),
            tls_config().await,
            test_app(),
            CancellationToken::new(),
        ));
        listener.close().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should exit after close")
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_ends_a_stopped_loop() {
        let listener = Arc::new(ManagedListener::new("127.0.0.1:0".parse().unwrap()));
        let cancel = CancellationToken::new();

        // never started: the loop is parked in accept
        let handle = tokio::spawn(serve(listener, tls_config().await, test_app(), cancel.clone()));
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should exit after cancel")
            .unwrap();
    }
}
