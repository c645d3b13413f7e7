//! Engine constants and the migration configuration document.
//!
//! Constants follow the associated-const layout used across the engine;
//! per-deployment settings live in a JSON document loaded by
//! [`MigrationConfig::load`].

use crate::error::{Result, SyncError};
use crate::remote::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fixed engine parameters.
pub struct EngineConfig;

impl EngineConfig {
    /// Read size for streaming fingerprints (1MB).
    pub const FINGERPRINT_CHUNK_SIZE: usize = 1024 * 1024;
    /// Maximum number of cached fingerprints kept in memory.
    pub const FINGERPRINT_CACHE_CAPACITY: u64 = 200_000;
    /// Default number of entity pipelines run concurrently.
    pub const DEFAULT_CONCURRENCY: usize = 4;
    /// Default number of keys per listing page.
    pub const DEFAULT_PAGE_SIZE: usize = 1000;
    /// Objects at or above this size are stored as multipart (64MB).
    pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
    /// Part size used for multipart objects (16MB).
    pub const DEFAULT_PART_SIZE: u64 = 16 * 1024 * 1024;
    /// Per-request timeout for HTTP object stores.
    pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
}

/// File and directory names shared between components.
pub struct PathsConfig;

impl PathsConfig {
    /// Per-entity descriptor inside an entity's source directory.
    pub const ENTITY_DESCRIPTOR: &'static str = "entity.json";
    /// Directory holding shared group assets, both in source and destination.
    pub const GROUPS_DIR_NAME: &'static str = "_groups";
    /// Run summary document inside the manifest directory.
    pub const SUMMARY_FILENAME: &'static str = "_summary.json";
    /// Sidecar metadata directory of the filesystem object store.
    pub const STORE_META_DIR_NAME: &'static str = ".meta";
}

/// Retry settings as written in the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter)
    }
}

/// Object storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BackendConfig {
    /// A local directory acting as a bucket.
    Fs {
        root: PathBuf,
        #[serde(default)]
        multipart_threshold_bytes: Option<u64>,
        #[serde(default)]
        part_size_bytes: Option<u64>,
        #[serde(default)]
        page_size: Option<usize>,
    },
    /// An HTTP object gateway.
    Http {
        base_url: String,
        /// Name of the environment variable holding the bearer token.
        #[serde(default)]
        token_env: Option<String>,
    },
}

impl BackendConfig {
    /// Resolve the bearer token for HTTP backends.
    ///
    /// A configured but unset variable is a configuration error: running
    /// without credentials would only surface as auth failures later.
    pub fn resolve_token(&self) -> Result<Option<String>> {
        match self {
            BackendConfig::Http {
                token_env: Some(var),
                ..
            } => match std::env::var(var) {
                Ok(token) if !token.trim().is_empty() => Ok(Some(token)),
                _ => Err(SyncError::Config {
                    message: format!("credentials variable {} is not set", var),
                }),
            },
            _ => Ok(None),
        }
    }
}

/// Configuration for a migration deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfig {
    /// Root holding one directory per entity plus `_groups/`.
    pub source_root: PathBuf,
    /// Where entity manifests and the run summary are written.
    pub manifest_dir: PathBuf,
    /// Key prefix under which entities are stored remotely.
    #[serde(default)]
    pub destination_prefix: String,
    pub backend: BackendConfig,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Glob restricting which files count as assets.
    #[serde(default)]
    pub asset_pattern: Option<String>,
}

impl MigrationConfig {
    /// Load and validate a configuration document.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| SyncError::Config {
            message: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        let config: MigrationConfig =
            serde_json::from_str(&contents).map_err(|e| SyncError::Config {
                message: format!("Failed to parse config {}: {}", path.display(), e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(SyncError::Config {
                message: "concurrency must be at least 1".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config {
                message: "retry.maxAttempts must be at least 1".into(),
            });
        }
        match &self.backend {
            BackendConfig::Fs {
                part_size_bytes: Some(0),
                ..
            }
            | BackendConfig::Fs {
                page_size: Some(0), ..
            } => Err(SyncError::Config {
                message: "fs backend part and page sizes must be positive".into(),
            }),
            BackendConfig::Http { base_url, .. } => url::Url::parse(base_url)
                .map(|_| ())
                .map_err(|e| SyncError::Config {
                    message: format!("invalid baseUrl {}: {}", base_url, e),
                }),
            BackendConfig::Fs { .. } => Ok(()),
        }
    }
}

fn default_concurrency() -> usize {
    EngineConfig::DEFAULT_CONCURRENCY
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}
