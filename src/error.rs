//! Error taxonomy (spec.md §7).
//!
//! Three per-subsystem enums (`DbError`, `CloudError`, `ConfigError`) plus
//! `ProtocolError` for malformed inbound topic payloads, following the
//! teacher's convention of one `thiserror::Error` enum per subsystem
//! (`BusError` in `src/bus/mod.rs`). `KioskError` is the crate-wide sum
//! type returned from fallible public APIs.

use thiserror::Error;

/// Persistence errors (spec.md §6, repository contract).
#[derive(Debug, Error)]
pub enum DbError {
    #[error("{func}: {message}")]
    Transient {
        func: String,
        message: String,
        #[source]
        internal: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Irrecoverable failure at startup; fatal.
    #[error("database is unusable: {0}")]
    Broken(String),
}

impl DbError {
    pub fn transient(func: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            func: func.into(),
            message: message.into(),
            internal: None,
        }
    }
}

/// Cloud HTTP/REST errors (spec.md §6).
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("endpoint '{0}' not found in configuration")]
    NotFound(String),

    #[error("malformed response: {0}")]
    FormatError(String),

    #[error("server returned {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("request timed out")]
    TimeoutError,

    #[error("image download failed: {0}")]
    ImageDownloadError(String),
}

/// Configuration errors; fatal at startup (spec.md §7).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required configuration option '{0}' is missing")]
    Missing(String),

    #[error("configuration option '{0}' is empty")]
    Empty(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Malformed inbound cloud-topic payload; logged and dropped (spec.md §7).
#[derive(Debug, Error)]
#[error("malformed {topic} payload: {message}")]
pub struct ProtocolError {
    pub topic: String,
    pub message: String,
}

/// A feature the running configuration asked for but the build does not
/// support; fatal at startup alongside `DbError::Broken`/`ConfigError`.
#[derive(Debug, Error)]
#[error("unsupported feature: {0}")]
pub struct UnsupportedFeatureError(pub String);

/// Crate-wide error returned from fallible public APIs.
#[derive(Debug, Error)]
pub enum KioskError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    UnsupportedFeature(#[from] UnsupportedFeatureError),

    #[error("operation timed out")]
    Timeout,
}

/// The three startup-fatal error classes (spec.md §7 propagation policy).
pub fn is_fatal_at_startup(err: &KioskError) -> bool {
    matches!(
        err,
        KioskError::Db(DbError::Broken(_))
            | KioskError::Config(_)
            | KioskError::UnsupportedFeature(_)
    )
}
