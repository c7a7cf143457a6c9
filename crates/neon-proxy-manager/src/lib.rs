//! neon-proxy-manager: publishes HAProxy bundles for Neon proxies.
//!
//! One manager instance at a time holds the leader lock. While it does,
//! it watches the config store and, for each proxy, loads certificates and
//! routes, validates and renders them, and publishes the resulting bundle
//! when its hash differs from the published one.
//!
//! # Components
//!
//! - **`leader`**: lock acquisition with unbounded retry
//! - **`monitor`**: watch/poll loop with debouncing
//! - **`generator`**: one proxy's load, validate, render and publish cycle
//! - **`change`** / **`publisher`**: content hashing and atomic publish
//! - **`service`**: leadership terms, cancellation and shutdown

pub mod change;
pub mod config;
pub mod error;
pub mod generator;
pub mod leader;
pub mod monitor;
pub mod publisher;
pub mod service;

pub use change::ChangeDetector;
pub use config::{ManagerConfig, RunOptions};
pub use error::{CycleError, CycleResult};
pub use generator::{ConfigGenerator, CycleSummary, PreparedBundle};
pub use leader::LeaderCoordinator;
pub use monitor::Monitor;
pub use publisher::{PublishOutcome, Publisher};
pub use service::ProxyManager;
