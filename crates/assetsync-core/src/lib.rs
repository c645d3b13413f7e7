//! assetsync core - Hash-verified asset synchronization and manifest engine.
//!
//! This crate migrates character training assets from a local source tree
//! into an object store. Equality is always decided by content fingerprint,
//! never by file name, so re-runs are idempotent and drift is detectable.
//! It has no CLI or HTTP layer of its own.
//!
//! # Example
//!
//! ```rust,ignore
//! use assetsync_core::{EntityFilter, MigrationConfig, MigrationMode, MigrationOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> assetsync_core::Result<()> {
//!     let config = MigrationConfig::load("migration.json".as_ref())?;
//!     let orchestrator = MigrationOrchestrator::from_config(&config)?;
//!
//!     // Simulate first; nothing at the destination changes
//!     let run = orchestrator.run(&EntityFilter::all(), MigrationMode::DryRun).await?;
//!     println!("Would copy {} files", run.files_copied);
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod entity;
pub mod error;
pub mod fingerprint;
pub mod manifest;
pub mod migration;
pub mod remote;
pub mod resolver;
pub mod scanner;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::{BackendConfig, EngineConfig, MigrationConfig, PathsConfig, RetrySettings};
pub use entity::{Entity, EntityCatalog, EntityDescriptor, EntityFilter};
pub use error::{ErrorKind, Result, SyncError};
pub use fingerprint::{Fingerprint, FingerprintCache, FingerprintKind};
pub use manifest::{
    EntityManifest, GroupedAsset, ManifestBuilder, ManifestStatistics, ManifestStore,
    MANIFEST_SCHEMA_VERSION,
};
pub use migration::{
    EntityError, EntitySummary, MigrationMode, MigrationOrchestrator, MigrationRun,
};
pub use remote::{
    open_store, FsObjectStore, HttpObjectStore, ObjectStore, RemoteAssetLister,
    RemoteObjectRecord, RetryPolicy,
};
pub use resolver::{resolve, PrefixIdentity, ResolvedAsset, SyncReport, SyncState};
pub use scanner::{AssetKind, AssetPattern, AssetRecord, LocalAssetScanner};
