//! neon-proxy: the proxy model and HAProxy configuration synthesis.
//!
//! Everything needed to turn store contents into a deployable bundle for
//! one proxy instance, without any scheduling or leadership concerns.
//!
//! # Components
//!
//! - **`settings`** / **`route`**: documents stored under the manager's
//!   config prefix
//! - **`certificate`**: certificates loaded from the secret store, host
//!   coverage, and per-pass reference tracking
//! - **`route_table`**: loads a [`ProxyDefinition`], bootstrapping settings
//! - **`definition`**: joint validation of settings and routes
//! - **`haproxy`**: deterministic config rendering
//! - **`bundle`**: normalized tar.gz packaging

pub mod bundle;
pub mod certificate;
pub mod definition;
pub mod error;
pub mod haproxy;
pub mod keys;
pub mod route;
pub mod route_table;
pub mod settings;

pub use bundle::{build_bundle, read_bundle};
pub use certificate::{CertInfo, CertificateDocument, CertificateRegistry, ReferencedCertificates};
pub use definition::{ProxyDefinition, ValidationOptions, ValidationResult};
pub use error::{ProxyError, ProxyResult};
pub use haproxy::{CertManifestEntry, RenderedConfig, render};
pub use route::{HttpBackend, HttpFrontend, HttpRoute, ProxyRoute, TcpBackend, TcpFrontend, TcpRoute};
pub use route_table::RouteTable;
pub use settings::{ProxyResolver, ProxySettings, ProxyTimeouts};
