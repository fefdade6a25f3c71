//! API extension server
//!
//! Serves resource kinds under `/apis/{group}/{version}` the way the
//! Kubernetes aggregation layer expects:
//!
//! - [`discovery`]: discovery documents and request dispatch
//! - [`delegate`]: HTTP verbs mapped onto a [`Store`]
//! - [`middleware`]: authentication and authorization in front of the routes
//! - [`tls`] and [`server`]: rustls config and the accept loop
//! - [`controller`]: turning the whole server on and off
//!
//! # Usage
//!
//! ```rust,ignore
//! let gv = GroupVersion::new("example.io", "v1");
//! let widgets = ResourceDescriptor::new("Widget", "widgets");
//! let store = Arc::new(SecretBackedStore::<DynamicObject>::new(secrets, &gv, &widgets));
//!
//! let mut discovery = DiscoveryRouter::new();
//! discovery.add_resource(gv.clone(), widgets.clone(), Arc::new(ResourceDelegate::new(gv, &widgets, store)));
//!
//! let app = server::app(discovery, AuthState::new(registry.clone(), authorizer));
//! server::serve(listener, tls::server_config(rotator, registry)?, app, cancel).await;
//! ```

#![deny(missing_docs)]

pub mod controller;
pub mod delegate;
pub mod discovery;
pub mod error;
pub mod middleware;
pub mod negotiate;
pub mod patch;
pub mod path;
pub mod secret_store;
pub mod server;
pub mod store;
pub mod tls;

pub use controller::{ControllerError, ExtensionController, KubeRegistrationCleaner, RegistrationCleaner};
pub use delegate::ResourceDelegate;
pub use discovery::{DiscoveryRouter, GroupVersion, ResourceDescriptor, ResourceHandler, ResourceRequest};
pub use error::{Error, Result, Status};
pub use middleware::AuthState;
pub use negotiate::MediaType;
pub use secret_store::SecretBackedStore;
pub use store::{ListOptions, RequestContext, ResourceList, Store, WatchEvent, WatchStream};
pub use tls::{server_config, UnionClientVerifier};
