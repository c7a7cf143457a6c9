//! Generation cycle errors.

use neon_proxy::ProxyError;
use neon_store::StoreError;
use thiserror::Error;

/// Result type alias for one generation cycle.
pub type CycleResult<T> = Result<T, CycleError>;

/// Why a generation cycle did not complete.
///
/// The variant decides what happens next: store and validation failures
/// are retried on the next trigger, leadership loss sends the manager back
/// to waiting for the lock, and fatal errors end the process.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("invalid proxy definition: {0}")]
    Validation(ProxyError),

    #[error("leadership lost during generation")]
    LeadershipLost,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CycleError {
    /// Whether the process must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CycleError::Fatal(_))
    }
}

impl From<ProxyError> for CycleError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Store(e) => CycleError::Store(e),
            ProxyError::Bundle(reason) => CycleError::Fatal(reason),
            other => CycleError::Validation(other),
        }
    }
}
