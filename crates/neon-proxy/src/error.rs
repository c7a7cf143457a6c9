//! Proxy model error types.

use thiserror::Error;

/// Result type alias for proxy model operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors raised while loading, validating, or rendering a proxy definition.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("store error: {0}")]
    Store(#[from] neon_store::StoreError),

    #[error("invalid settings document for proxy [{proxy}]: {reason}")]
    Settings { proxy: String, reason: String },

    #[error("invalid route document at [{key}]: {reason}")]
    Route { key: String, reason: String },

    #[error("invalid certificate [{name}]: {reason}")]
    Certificate { name: String, reason: String },

    #[error("proxy [{proxy}] failed validation with {count} error(s)")]
    Validation { proxy: String, count: usize },

    #[error("port {port} mixes TLS and non-TLS frontends")]
    TlsConflict { port: u16 },

    #[error("certificate [{0}] is referenced but not loaded")]
    MissingCertificate(String),

    #[error("bundle error: {0}")]
    Bundle(String),
}
