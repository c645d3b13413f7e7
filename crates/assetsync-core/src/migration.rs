//! Migration orchestration.
//!
//! [`MigrationOrchestrator::run`] drives one pipeline per selected entity:
//! scan, fingerprint, destination check, copy, manifest. Pipelines run on a
//! bounded pool; within a pipeline the steps are strictly sequential, so a
//! persisted manifest only ever lists assets already at the destination.
//!
//! Per-file and per-entity failures are collected into the returned
//! [`MigrationRun`]. Only fatal errors (authentication, configuration)
//! escape `run`.

use crate::cancel::CancellationToken;
use crate::config::{EngineConfig, MigrationConfig, PathsConfig};
use crate::entity::{EntityCatalog, EntityFilter};
use crate::error::{ErrorKind, Result, SyncError};
use crate::fingerprint::{composite_fingerprint_file, Fingerprint, FingerprintCache, FingerprintKind};
use crate::manifest::{EntityManifest, GroupedAsset, ManifestBuilder, ManifestStore};
use crate::remote::{join_key, open_store, ObjectStore, RemoteAssetLister, RemoteObjectRecord, RetryPolicy};
use crate::resolver::{resolve, PrefixIdentity, SyncReport, SyncState};
use crate::scanner::{AssetPattern, AssetRecord, LocalAssetScanner};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Whether a run may change the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationMode {
    /// Every read and compute step, no copies, nothing persisted.
    DryRun,
    Apply,
}

impl MigrationMode {
    pub fn is_apply(&self) -> bool {
        matches!(self, MigrationMode::Apply)
    }
}

/// Per-entity totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySummary {
    pub entity_id: String,
    pub files_copied: u64,
    pub files_skipped: u64,
    pub bytes_copied: u64,
    /// Assets listed in the entity's manifest.
    pub total_files: u64,
    pub total_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<PathBuf>,
}

/// A failure recorded against one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityError {
    pub entity_id: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl EntityError {
    pub fn new(entity_id: &str, err: &SyncError) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            kind: err.kind(),
            message: err.to_string(),
            path: err.path().cloned(),
        }
    }
}

/// Outcome of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRun {
    pub run_id: String,
    pub mode: MigrationMode,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Entities whose pipeline ran to completion.
    pub entities_processed: u64,
    pub files_copied: u64,
    pub files_skipped: u64,
    pub bytes_copied: u64,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub entities: Vec<EntitySummary>,
    #[serde(default)]
    pub errors: Vec<EntityError>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl MigrationRun {
    fn start(mode: MigrationMode) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            mode,
            started_at: Utc::now(),
            finished_at: None,
            entities_processed: 0,
            files_copied: 0,
            files_skipped: 0,
            bytes_copied: 0,
            cancelled: false,
            entities: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn entity(&self, entity_id: &str) -> Option<&EntitySummary> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }

    fn record(&mut self, outcome: EntityOutcome) {
        self.entities_processed += 1;
        self.record_partial(outcome);
    }

    /// Keep the counters of a pipeline that stopped early. Copies it made
    /// are already at the destination.
    fn record_partial(&mut self, outcome: EntityOutcome) {
        self.files_copied += outcome.summary.files_copied;
        self.files_skipped += outcome.summary.files_skipped;
        self.bytes_copied += outcome.summary.bytes_copied;
        self.entities.push(outcome.summary);
        self.errors.extend(outcome.errors);
        self.warnings.extend(outcome.warnings);
    }

    fn finish(&mut self, cancelled: bool) {
        self.entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        self.errors.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        self.cancelled = cancelled;
        self.finished_at = Some(Utc::now());
    }
}

/// Counters and diagnostics collected while a pipeline runs.
#[derive(Debug, Default)]
struct EntityOutcome {
    summary: EntitySummary,
    errors: Vec<EntityError>,
    warnings: Vec<String>,
}

impl EntityOutcome {
    fn new(entity_id: &str) -> Self {
        Self {
            summary: EntitySummary {
                entity_id: entity_id.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn file_error(&mut self, err: SyncError) {
        warn!("{}: {}", self.summary.entity_id, err);
        self.errors.push(EntityError::new(&self.summary.entity_id, &err));
    }

    fn copied(&mut self, asset: &AssetRecord) {
        self.summary.files_copied += 1;
        self.summary.bytes_copied += asset.size_bytes;
    }

    fn skipped(&mut self) {
        self.summary.files_skipped += 1;
    }

    fn interrupted(&mut self) {
        let message = format!(
            "{} interrupted after {} copies; manifest not written",
            self.summary.entity_id, self.summary.files_copied
        );
        info!("{}", message);
        self.warnings.push(message);
    }
}

/// Result of syncing one group directory. Computed once per run; the first
/// entity to reach the group owns its counters and diagnostics.
#[derive(Debug, Default)]
struct GroupSync {
    owner: String,
    present: Vec<GroupedAsset>,
    files_copied: u64,
    files_skipped: u64,
    bytes_copied: u64,
    errors: Vec<EntityError>,
    warnings: Vec<String>,
}

#[derive(Default)]
struct GroupLedger {
    cells: Mutex<HashMap<String, Arc<OnceCell<GroupSync>>>>,
}

impl GroupLedger {
    fn cell(&self, group_key: &str) -> Arc<OnceCell<GroupSync>> {
        let mut cells = match self.cells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cells.entry(group_key.to_string()).or_default().clone()
    }
}

enum CopyResult {
    Copied,
    Failed,
}

/// Runs migrations from a source root into an object store.
pub struct MigrationOrchestrator {
    catalog: EntityCatalog,
    store: Arc<dyn ObjectStore>,
    lister: RemoteAssetLister,
    manifests: ManifestStore,
    builder: ManifestBuilder,
    cache: FingerprintCache,
    pattern: AssetPattern,
    prefix: String,
    concurrency: usize,
    cancel: CancellationToken,
}

impl MigrationOrchestrator {
    pub fn new(
        source_root: impl Into<PathBuf>,
        manifest_dir: impl Into<PathBuf>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            catalog: EntityCatalog::new(source_root),
            lister: RemoteAssetLister::new(store.clone(), RetryPolicy::default()),
            store,
            manifests: ManifestStore::new(manifest_dir),
            builder: ManifestBuilder::new(),
            cache: FingerprintCache::new(),
            pattern: AssetPattern::any(),
            prefix: String::new(),
            concurrency: EngineConfig::DEFAULT_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }

    /// Build an orchestrator from a validated configuration document.
    pub fn from_config(config: &MigrationConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.backend)?;
        let pattern = match &config.asset_pattern {
            Some(glob) => AssetPattern::glob(glob)?,
            None => AssetPattern::any(),
        };
        Ok(Self::new(&config.source_root, &config.manifest_dir, store)
            .with_prefix(&config.destination_prefix)
            .with_concurrency(config.concurrency)
            .with_retry(config.retry.to_policy())
            .with_pattern(pattern))
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim_matches('/').to_string();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.lister = RemoteAssetLister::new(self.store.clone(), retry);
        self
    }

    pub fn with_cache(mut self, cache: FingerprintCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_pattern(mut self, pattern: AssetPattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Destination key prefix of an entity's base assets.
    pub fn entity_prefix(&self, entity_id: &str) -> String {
        join_key(&self.prefix, entity_id)
    }

    /// Destination key prefix of a group's shared assets.
    pub fn group_prefix(&self, group_key: &str) -> String {
        join_key(
            &self.prefix,
            &format!("{}/{}", PathsConfig::GROUPS_DIR_NAME, group_key),
        )
    }

    /// Migrate the entities selected by `filter`.
    pub async fn run(&self, filter: &EntityFilter, mode: MigrationMode) -> Result<MigrationRun> {
        let mut run = MigrationRun::start(mode);
        info!(
            "Starting {:?} run {} from {}",
            mode,
            run.run_id,
            self.catalog.root().display()
        );

        let ids = self.catalog.list_ids()?;
        for requested in filter.ids.iter().filter(|id| !ids.contains(*id)) {
            let err = SyncError::NotFound {
                key: requested.clone(),
            };
            run.errors.push(EntityError::new(requested, &err));
        }
        let selected: Vec<String> = filter.select(&ids).into_iter().cloned().collect();
        debug!("Selected {} of {} entities", selected.len(), ids.len());

        let ledger = GroupLedger::default();
        let ledger = &ledger;
        let mut pipelines = stream::iter(selected)
            .map(|entity_id| async move {
                if self.cancel.is_cancelled() {
                    return (entity_id, None);
                }
                let mut outcome = EntityOutcome::new(&entity_id);
                let result = self.process_entity(&entity_id, mode, ledger, &mut outcome).await;
                (entity_id, Some((outcome, result)))
            })
            .buffer_unordered(self.concurrency);

        while let Some((entity_id, finished)) = pipelines.next().await {
            let Some((mut outcome, result)) = finished else {
                debug!("Not starting {} after cancellation", entity_id);
                continue;
            };
            match result {
                Ok(()) => {
                    info!(
                        "{}: {} copied, {} skipped",
                        entity_id, outcome.summary.files_copied, outcome.summary.files_skipped
                    );
                    run.record(outcome);
                }
                Err(SyncError::Cancelled) => {
                    outcome.interrupted();
                    run.record_partial(outcome);
                }
                Err(e) if e.is_fatal() => {
                    warn!("Aborting run {}: {}", run.run_id, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("{}: failed: {}", entity_id, e);
                    run.errors.push(EntityError::new(&entity_id, &e));
                    run.record_partial(outcome);
                }
            }
        }
        drop(pipelines);

        run.finish(self.cancel.is_cancelled());
        if mode.is_apply() {
            if let Err(e) = self.manifests.persist_summary(&run) {
                warn!("Failed to write run summary: {}", e);
                run.warnings.push(format!("run summary not written: {}", e));
            }
        }

        info!(
            "Run {} finished: {} entities, {} copied, {} skipped, {} errors",
            run.run_id,
            run.entities_processed,
            run.files_copied,
            run.files_skipped,
            run.errors.len()
        );
        Ok(run)
    }

    /// Classify an entity's base assets against the destination without
    /// changing anything.
    pub async fn drift_report(&self, entity_id: &str) -> Result<SyncReport> {
        let entity = self.catalog.load(entity_id)?;
        let mut outcome = EntityOutcome::new(entity_id);
        let scanned = self.scan_dir(entity.dir.clone(), &mut outcome).await?;
        let assets = self.fingerprint_all(scanned, &mut outcome).await?;

        let prefix = self.entity_prefix(&entity.id);
        let remote = self.lister.collect(&format!("{}/", prefix)).await?;
        Ok(SyncReport::new(resolve(
            assets,
            remote,
            &PrefixIdentity::new(prefix),
        )))
    }

    async fn process_entity(
        &self,
        entity_id: &str,
        mode: MigrationMode,
        ledger: &GroupLedger,
        outcome: &mut EntityOutcome,
    ) -> Result<()> {
        let entity = self.catalog.load(entity_id)?;

        let scanned = self.scan_dir(entity.dir.clone(), outcome).await?;
        let assets = self.fingerprint_all(scanned, outcome).await?;
        let base = self.sync_base(&entity.id, assets, mode, outcome).await?;

        let mut grouped = Vec::new();
        for group_key in entity.group_keys() {
            let cell = ledger.cell(&group_key);
            let group = cell
                .get_or_try_init(|| self.sync_group(&group_key, &entity.id, mode))
                .await?;
            if group.owner == entity.id {
                outcome.summary.files_copied += group.files_copied;
                outcome.summary.files_skipped += group.files_skipped;
                outcome.summary.bytes_copied += group.bytes_copied;
                outcome.errors.extend(group.errors.iter().cloned());
                outcome.warnings.extend(group.warnings.iter().cloned());
            }
            grouped.extend(group.present.iter().cloned());
        }

        let manifest =
            self.builder
                .build(&entity.id, entity.name(), base, grouped, entity.metadata());
        outcome.summary.total_files = manifest.statistics.total_files;
        outcome.summary.total_size_bytes = manifest.statistics.total_size_bytes;

        if mode.is_apply() {
            self.cancel.check()?;
            outcome.summary.manifest_path = Some(self.persist_manifest(manifest).await?);
        }
        Ok(())
    }

    /// Copy missing or changed base assets; returns the assets present at
    /// the destination afterwards.
    async fn sync_base(
        &self,
        entity_id: &str,
        assets: Vec<AssetRecord>,
        mode: MigrationMode,
        outcome: &mut EntityOutcome,
    ) -> Result<Vec<AssetRecord>> {
        let prefix = self.entity_prefix(entity_id);
        let remote = self.lister.collect(&format!("{}/", prefix)).await?;
        let resolved = resolve(assets, remote, &PrefixIdentity::new(prefix.as_str()));

        let mut present = Vec::new();
        for entry in resolved {
            let Some(local) = entry.local else {
                continue;
            };
            self.cancel.check()?;

            let needs_copy = match entry.state {
                SyncState::Synced => false,
                SyncState::Missing | SyncState::Drifted => true,
                SyncState::Unverified => match &entry.remote {
                    Some(remote) => !self.matches_composite(&local, remote).await?,
                    None => true,
                },
                SyncState::Absent => continue,
            };

            if !needs_copy {
                outcome.skipped();
                present.push(local);
                continue;
            }

            let key = join_key(&prefix, &entry.identity);
            match self.copy_asset(&key, &local, mode, outcome).await? {
                CopyResult::Copied => present.push(local),
                CopyResult::Failed => {}
            }
        }
        Ok(present)
    }

    /// Sync one group directory. Group assets are only ever created at the
    /// destination; a differing remote copy is reported and left alone.
    async fn sync_group(
        &self,
        group_key: &str,
        owner: &str,
        mode: MigrationMode,
    ) -> Result<GroupSync> {
        let mut group = GroupSync {
            owner: owner.to_string(),
            ..Default::default()
        };
        let dir = self.catalog.group_dir(group_key);
        if !dir.is_dir() {
            group
                .warnings
                .push(format!("group '{}' referenced by {} does not exist", group_key, owner));
            return Ok(group);
        }

        let mut outcome = EntityOutcome::new(owner);
        let scanned = self.scan_dir(dir, &mut outcome).await?;
        let assets = self.fingerprint_all(scanned, &mut outcome).await?;

        let prefix = self.group_prefix(group_key);
        let remote = self.lister.collect(&format!("{}/", prefix)).await?;
        for entry in resolve(assets, remote, &PrefixIdentity::new(prefix.as_str())) {
            let Some(local) = entry.local else {
                continue;
            };
            if self.cancel.is_cancelled() {
                debug!("Group '{}' interrupted by cancellation", group_key);
                break;
            }
            let key = join_key(&prefix, &entry.identity);
            let composite_match = match (entry.state, &entry.remote) {
                (SyncState::Unverified, Some(remote)) => {
                    self.matches_composite(&local, remote).await?
                }
                _ => false,
            };

            let keep = match entry.state {
                SyncState::Synced => {
                    outcome.skipped();
                    true
                }
                SyncState::Unverified if composite_match => {
                    outcome.skipped();
                    true
                }
                SyncState::Missing => matches!(
                    self.copy_asset(&key, &local, mode, &mut outcome).await?,
                    CopyResult::Copied
                ),
                _ => {
                    warn!("Shared asset {} differs at destination, not overwriting", key);
                    group.warnings.push(format!(
                        "shared asset {} is not identical to group '{}' source; left unchanged",
                        key, group_key
                    ));
                    false
                }
            };

            if keep {
                group.present.push(GroupedAsset {
                    group_key: group_key.to_string(),
                    asset: local,
                });
            }
        }

        group.files_copied = outcome.summary.files_copied;
        group.files_skipped = outcome.summary.files_skipped;
        group.bytes_copied = outcome.summary.bytes_copied;
        group.warnings.extend(outcome.warnings);
        group.errors = outcome.errors;
        Ok(group)
    }

    /// Copy one asset (or count it in a dry run) and verify the result.
    ///
    /// Per-file failures are recorded and reported as [`CopyResult::Failed`];
    /// anything else aborts the entity.
    async fn copy_asset(
        &self,
        key: &str,
        local: &AssetRecord,
        mode: MigrationMode,
        outcome: &mut EntityOutcome,
    ) -> Result<CopyResult> {
        if !mode.is_apply() {
            debug!("Would copy {} -> {}", local.absolute_path.display(), key);
            outcome.copied(local);
            return Ok(CopyResult::Copied);
        }

        let uploaded = match self.lister.put_file(key, &local.absolute_path).await {
            Ok(record) => record,
            Err(e @ SyncError::PerFile { .. }) => {
                outcome.file_error(e);
                return Ok(CopyResult::Failed);
            }
            Err(e) => return Err(e),
        };

        match self.verify_upload(key, local, &uploaded, outcome).await {
            Ok(()) => {
                debug!("Copied {} -> {}", local.absolute_path.display(), key);
                outcome.copied(local);
                Ok(CopyResult::Copied)
            }
            Err(e @ SyncError::IntegrityMismatch { .. }) => {
                outcome.file_error(e);
                Ok(CopyResult::Failed)
            }
            Err(e) => Err(e),
        }
    }

    async fn verify_upload(
        &self,
        key: &str,
        local: &AssetRecord,
        uploaded: &RemoteObjectRecord,
        outcome: &mut EntityOutcome,
    ) -> Result<()> {
        let Some(expected) = &local.fingerprint else {
            return Ok(());
        };
        let verified = match uploaded.fingerprint_kind {
            FingerprintKind::Simple => uploaded.fingerprint == *expected,
            FingerprintKind::Composite => match self.local_composite(local).await? {
                Some(composite) => composite == uploaded.fingerprint,
                None => {
                    // No part size: only the size can be compared
                    let sized = uploaded.size_bytes == local.size_bytes;
                    if sized {
                        warn!("{} stored as a multipart object; content not verified", key);
                        outcome.warnings.push(format!(
                            "{} stored as a multipart object with unknown part size; only its size was verified",
                            key
                        ));
                    }
                    sized
                }
            },
        };
        if verified {
            Ok(())
        } else {
            Err(SyncError::IntegrityMismatch {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: uploaded.fingerprint.to_string(),
            })
        }
    }

    /// Whether a composite remote value matches the local file when split
    /// with the store's part size. Unknown part size never matches.
    async fn matches_composite(&self, local: &AssetRecord, remote: &RemoteObjectRecord) -> Result<bool> {
        if !remote.is_composite() || local.size_bytes != remote.size_bytes {
            return Ok(false);
        }
        Ok(self
            .local_composite(local)
            .await?
            .is_some_and(|composite| composite == remote.fingerprint))
    }

    async fn local_composite(&self, local: &AssetRecord) -> Result<Option<Fingerprint>> {
        let Some(part_size) = self.store.multipart_part_size() else {
            return Ok(None);
        };
        let path = local.absolute_path.clone();
        let composite = tokio::task::spawn_blocking(move || composite_fingerprint_file(&path, part_size))
            .await
            .map_err(|e| SyncError::Other(format!("Fingerprint task failed: {}", e)))??;
        Ok(Some(composite))
    }

    /// Scan a directory on the blocking pool; per-file problems are recorded.
    async fn scan_dir(&self, dir: PathBuf, outcome: &mut EntityOutcome) -> Result<Vec<AssetRecord>> {
        let pattern = self.pattern.clone();
        let (records, errors, vanished) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut scan = LocalAssetScanner::new().scan(&dir, &pattern)?;
            let mut records = Vec::new();
            let mut errors = Vec::new();
            for item in scan.by_ref() {
                match item {
                    Ok(record) => records.push(record),
                    Err(e) => errors.push(e),
                }
            }
            let vanished = (scan.vanished() > 0)
                .then(|| format!("{} entries vanished during scan of {}", scan.vanished(), dir.display()));
            Ok((records, errors, vanished))
        })
        .await
        .map_err(|e| SyncError::Other(format!("Scan task failed: {}", e)))??;

        for err in errors {
            outcome.file_error(err);
        }
        outcome.warnings.extend(vanished);
        Ok(records)
    }

    async fn fingerprint_all(
        &self,
        scanned: Vec<AssetRecord>,
        outcome: &mut EntityOutcome,
    ) -> Result<Vec<AssetRecord>> {
        let mut assets = Vec::with_capacity(scanned.len());
        for record in scanned {
            self.cancel.check()?;
            match self.cache.fingerprint_record(&record).await {
                Ok(record) => assets.push(record),
                Err(e @ SyncError::PerFile { .. }) => outcome.file_error(e),
                Err(e) => return Err(e),
            }
        }
        Ok(assets)
    }

    async fn persist_manifest(&self, manifest: EntityManifest) -> Result<PathBuf> {
        let store = self.manifests.clone();
        tokio::task::spawn_blocking(move || store.persist(&manifest))
            .await
            .map_err(|e| SyncError::Other(format!("Manifest task failed: {}", e)))?
    }
}

/// Paths of every manifest written by an Apply run.
pub fn manifest_paths(run: &MigrationRun) -> impl Iterator<Item = &Path> {
    run.entities
        .iter()
        .filter_map(|e| e.manifest_path.as_deref())
}
