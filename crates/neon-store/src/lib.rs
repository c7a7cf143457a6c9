//! neon-store: clients for the cluster's config store and secret store.
//!
//! The proxy manager consumes two collaborators through narrow async
//! interfaces:
//!
//! - [`ConfigStore`]: typed get/put/list, atomic multi-key writes, prefix
//!   watches, and TTL-bound lock sessions
//! - [`SecretStore`]: read-only access to named secret documents
//!
//! # Architecture
//!
//! [`ClusterStore`] implements both against an embedded
//! [redb](https://docs.rs/redb) database. It is `Clone` + `Send` + `Sync`
//! (backed by `Arc<Database>`) and can be shared across async tasks.
//! [`LockHandle`] keeps a granted [`Lease`] alive in the background and
//! reports when its session is lost.

pub mod error;
pub mod lock;
pub mod store;
pub mod tables;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use lock::{LeaseGuard, LockHandle};
pub use store::ClusterStore;
pub use traits::{ConfigStore, KeyWatcher, Lease, SecretStore, WatchEvent};
