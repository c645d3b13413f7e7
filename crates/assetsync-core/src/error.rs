//! Error types for the sync engine.
//!
//! The taxonomy separates errors that are recovered locally (per-file and
//! per-entity failures, aggregated into a run report) from errors that must
//! terminate a run (authentication and configuration failures).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    // Local filesystem errors
    #[error("Cannot access {path}: {message}")]
    Access {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Failed to read {path}: {message}")]
    PerFile { path: PathBuf, message: String },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Remote store errors
    #[error("Transient network error: {message}")]
    TransientNetwork {
        message: String,
        status: Option<u16>,
    },

    #[error("Authentication rejected by {service}: {message}")]
    Auth { service: String, message: String },

    #[error("Object not found: {key}")]
    NotFound { key: String },

    // Integrity errors
    #[error("Integrity mismatch for {key}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Serializable error classification recorded in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Access,
    PerFile,
    Io,
    TransientNetwork,
    Auth,
    NotFound,
    IntegrityMismatch,
    Json,
    Config,
    Cancelled,
    Other,
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return status_error(status.as_u16(), &err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            SyncError::TransientNetwork {
                message: err.to_string(),
                status: None,
            }
        } else {
            SyncError::Other(format!("HTTP error: {}", err))
        }
    }
}

/// Map an HTTP status code to the error taxonomy.
///
/// - 401/403: authentication failure (fatal, never retried)
/// - 408/429/5xx: transient (retryable)
/// - 404: not found
pub fn status_error(status: u16, context: &str) -> SyncError {
    match status {
        401 | 403 => SyncError::Auth {
            service: context.to_string(),
            message: format!("HTTP {}", status),
        },
        408 | 429 | 500..=599 => SyncError::TransientNetwork {
            message: format!("{} returned HTTP {}", context, status),
            status: Some(status),
        },
        404 => SyncError::NotFound {
            key: context.to_string(),
        },
        _ => SyncError::Other(format!("{} returned HTTP {}", context, status)),
    }
}

impl SyncError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SyncError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a per-file error for a single unreadable or corrupt asset.
    pub fn per_file(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        SyncError::PerFile {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork { .. })
    }

    /// Check if this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Auth { .. } | SyncError::Config { .. })
    }

    /// Classification used in run reports.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Access { .. } => ErrorKind::Access,
            SyncError::PerFile { .. } => ErrorKind::PerFile,
            SyncError::Io { .. } => ErrorKind::Io,
            SyncError::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            SyncError::Auth { .. } => ErrorKind::Auth,
            SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            SyncError::Json { .. } => ErrorKind::Json,
            SyncError::Config { .. } => ErrorKind::Config,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Other(_) => ErrorKind::Other,
        }
    }

    /// The local path this error refers to, if any.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            SyncError::Access { path, .. } | SyncError::PerFile { path, .. } => Some(path),
            SyncError::Io { path, .. } => path.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::IntegrityMismatch {
            key: "chars/e1/a.png".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(
            err.to_string(),
            "Integrity mismatch for chars/e1/a.png: expected aa, got bb"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(status_error(401, "store"), SyncError::Auth { .. }));
        assert!(matches!(status_error(403, "store"), SyncError::Auth { .. }));
        assert!(status_error(503, "store").is_retryable());
        assert!(status_error(429, "store").is_retryable());
        assert!(status_error(408, "store").is_retryable());
        assert!(matches!(status_error(404, "k"), SyncError::NotFound { .. }));
        assert!(!status_error(400, "store").is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(status_error(401, "store").is_fatal());
        assert!(SyncError::Config {
            message: "missing token".into()
        }
        .is_fatal());
        assert!(!SyncError::per_file("/tmp/a.png", "corrupt").is_fatal());
        assert!(!status_error(500, "store").is_fatal());
    }

    #[test]
    fn test_kind_serializes_camel_case() {
        let kind = SyncError::per_file("/tmp/a.png", "corrupt").kind();
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"perFile\"");
    }
}
