//! End-to-end HTTPS tests: rotator identity, client certificate
//! authentication, discovery and a resource round trip over a real socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aperture_api::{
    middleware::AuthState, server, server_config, DiscoveryRouter, GroupVersion,
    ResourceDelegate, ResourceDescriptor, SecretBackedStore,
};
use aperture_auth::{AlwaysAllowAuthorizer, AuthenticatorRegistry, DynamicCaBundle, X509Authenticator};
use aperture_common::MemorySecretStore;
use aperture_listener::ManagedListener;
use aperture_pki::{CaBundle, CertificateAuthority, CertificateRotator, RotatorConfig};
use kube::api::DynamicObject;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
    addr: SocketAddr,
    server_ca_pem: String,
    client_ca: CertificateAuthority,
    listener: Arc<ManagedListener>,
    handle: JoinHandle<()>,
}

async fn start() -> Harness {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let secrets = Arc::new(MemorySecretStore::new());
    let rotator = Arc::new(
        CertificateRotator::new(
            RotatorConfig::new("aperture-system", "serving-cert", vec!["localhost".to_string()]),
            secrets.clone(),
        )
        .await,
    );
    rotator.rotate_if_needed().await.expect("serving certificate");

    let client_ca = CertificateAuthority::new("e2e-client-ca").unwrap();
    let trust = Arc::new(DynamicCaBundle::new(
        "client-ca",
        CaBundle::from_pem(client_ca.ca_cert_pem()).unwrap(),
    ));
    let registry = Arc::new(AuthenticatorRegistry::new());
    registry.add("x509", X509Authenticator::evaluator(trust, None), true);

    let gv = GroupVersion::new("example.io", "v1");
    let widgets = ResourceDescriptor::new("Widget", "widgets");
    let store = Arc::new(SecretBackedStore::<DynamicObject>::new(secrets, &gv, &widgets));
    let mut discovery = DiscoveryRouter::new();
    discovery.add_resource(
        gv.clone(),
        widgets.clone(),
        Arc::new(ResourceDelegate::new(gv, &widgets, store)),
    );

    let app = server::app(
        discovery,
        AuthState::new(registry.clone(), Arc::new(AlwaysAllowAuthorizer)),
    );
    let tls = server_config(rotator.clone(), registry).unwrap();

    let listener = Arc::new(ManagedListener::new("127.0.0.1:0".parse().unwrap()));
    listener.start().await.unwrap();
    let addr = listener.local_addr().await.expect("bound address");
    let handle = tokio::spawn(server::serve(
        listener.clone(),
        tls,
        app,
        CancellationToken::new(),
    ));

    Harness {
        addr,
        server_ca_pem: rotator.current_pem().expect("current certificate"),
        client_ca,
        listener,
        handle,
    }
}

impl Harness {
    fn client(&self, user: Option<&str>) -> reqwest::Client {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(
                reqwest::Certificate::from_pem(self.server_ca_pem.as_bytes()).unwrap(),
            )
            .resolve("localhost", self.addr)
            .timeout(Duration::from_secs(10));
        if let Some(user) = user {
            let (cert_pem, key_pem) = self.client_ca.issue_client_cert(user, Some("devs")).unwrap();
            let identity = reqwest::Identity::from_pem(format!("{key_pem}{cert_pem}").as_bytes())
                .unwrap();
            builder = builder.identity(identity);
        }
        builder.build().unwrap()
    }

    fn url(&self, path: &str) -> String {
        format!("https://localhost:{}{}", self.addr.port(), path)
    }

    async fn stop(self) {
        self.listener.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("accept loop exits after close")
            .unwrap();
    }
}

#[tokio::test]
async fn discovery_over_https_with_client_certificate() {
    let harness = start().await;
    let client = harness.client(Some("alice"));

    let response = client
        .get(harness.url("/apis/example.io/v1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "APIResourceList");
    assert_eq!(body["groupVersion"], "example.io/v1");
    assert_eq!(body["resources"][0]["name"], "widgets");

    harness.stop().await;
}

#[tokio::test]
async fn resource_round_trip_over_https() {
    let harness = start().await;
    let client = harness.client(Some("alice"));
    let collection = harness.url("/apis/example.io/v1/namespaces/default/widgets");

    let created = client
        .post(&collection)
        .json(&json!({
            "apiVersion": "example.io/v1",
            "kind": "Widget",
            "metadata": {"name": "w1"},
            "spec": {"size": 3}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);

    let list: Value = client
        .get(&collection)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["kind"], "WidgetList");
    assert_eq!(list["items"][0]["metadata"]["name"], "w1");
    assert_eq!(list["items"][0]["spec"]["size"], 3);

    harness.stop().await;
}

#[tokio::test]
async fn request_without_credentials_is_unauthorized() {
    let harness = start().await;
    let client = harness.client(None);

    let response = client
        .get(harness.url("/apis/example.io/v1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let status: Value = response.json().await.unwrap();
    assert_eq!(status["kind"], "Status");
    assert_eq!(status["code"], 401);

    harness.stop().await;
}

#[tokio::test]
async fn listener_restart_keeps_serving() {
    let mut harness = start().await;

    harness.listener.stop().await.unwrap();
    harness.listener.start().await.unwrap();
    // port 0 rebinds to a fresh ephemeral port
    harness.addr = harness.listener.local_addr().await.expect("bound address");
    let client = harness.client(Some("alice"));

    let response = client
        .get(harness.url("/apis/example.io"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let group: Value = response.json().await.unwrap();
    assert_eq!(group["kind"], "APIGroup");

    harness.stop().await;
}
