//! Manifest persistence.

use super::atomic::{atomic_read_json, atomic_write_json};
use super::EntityManifest;
use crate::config::PathsConfig;
use crate::error::{Result, SyncError};
use crate::migration::MigrationRun;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory of per-entity manifests plus the run summary.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<entity_id>.json`
    pub fn path_for(&self, entity_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", entity_id))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(PathsConfig::SUMMARY_FILENAME)
    }

    /// Replace the entity's manifest atomically.
    pub fn persist(&self, manifest: &EntityManifest) -> Result<PathBuf> {
        let path = self.path_for(&manifest.entity_id);
        atomic_write_json(&path, manifest)?;
        debug!("Wrote manifest {}", path.display());
        Ok(path)
    }

    /// Read a manifest written by this or an older schema version.
    ///
    /// Statistics are always recomputed from the asset lists; a stored
    /// value that disagrees is logged and replaced.
    pub fn load(&self, entity_id: &str) -> Result<Option<EntityManifest>> {
        let path = self.path_for(entity_id);
        let Some(manifest) = atomic_read_json::<EntityManifest>(&path)? else {
            return Ok(None);
        };

        if manifest.entity_id != entity_id {
            return Err(SyncError::Json {
                message: format!(
                    "manifest {} belongs to entity {}",
                    path.display(),
                    manifest.entity_id
                ),
                source: None,
            });
        }
        if !manifest.statistics_consistent() {
            warn!(
                "Stored statistics in {} disagree with its assets, recomputing",
                path.display()
            );
        }
        Ok(Some(manifest.normalize()))
    }

    pub fn persist_summary(&self, run: &MigrationRun) -> Result<PathBuf> {
        let path = self.summary_path();
        atomic_write_json(&path, run)?;
        Ok(path)
    }

    pub fn load_summary(&self) -> Result<Option<MigrationRun>> {
        atomic_read_json(&self.summary_path())
    }

    /// Entity ids with a manifest on disk, sorted.
    pub fn list_entities(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SyncError::io_with_path(e, &self.dir)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::io_with_path(e, &self.dir))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('_') || stem.starts_with('.') {
                continue;
            }
            ids.push(stem.to_string());
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ManifestBuilder, MANIFEST_SCHEMA_VERSION};
    use crate::scanner::{AssetKind, AssetRecord};
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    fn asset(path: &str, size: u64) -> AssetRecord {
        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        AssetRecord {
            relative_path: path.to_string(),
            absolute_path: PathBuf::from("/src").join(path),
            size_bytes: size,
            created_at: ts,
            modified_at: ts,
            fingerprint: None,
            kind: AssetKind::from_path(Path::new(path)),
        }
    }

    #[test]
    fn test_persist_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = ManifestStore::new(temp_dir.path().join("manifests"));
        let manifest = ManifestBuilder::new().build(
            "e1",
            "Aria",
            vec![asset("a.png", 10), asset("a.txt", 2)],
            vec![],
            vec![("category".into(), "knights".into())],
        );

        let path = store.persist(&manifest).unwrap();
        assert_eq!(path, store.path_for("e1"));

        let loaded = store.load("e1").unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert!(store.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_persist_is_byte_stable() {
        let temp_dir = TempDir::new().unwrap();
        let store = ManifestStore::new(temp_dir.path());
        let manifest =
            ManifestBuilder::new().build("e1", "", vec![asset("a.png", 1)], vec![], Vec::new());

        store.persist(&manifest).unwrap();
        let first = std::fs::read(store.path_for("e1")).unwrap();
        store.persist(&manifest).unwrap();
        let second = std::fs::read(store.path_for("e1")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_load_tolerates_older_schema() {
        let temp_dir = TempDir::new().unwrap();
        let store = ManifestStore::new(temp_dir.path());
        std::fs::write(
            store.path_for("old"),
            r#"{
                "entityId": "old",
                "baseAssets": [{
                    "relativePath": "a.png",
                    "absolutePath": "/src/old/a.png",
                    "sizeBytes": 7,
                    "createdAt": "2024-01-01T00:00:00Z",
                    "modifiedAt": "2024-01-01T00:00:00Z"
                }],
                "statistics": { "totalFiles": 99, "totalSizeBytes": 0 }
            }"#,
        )
        .unwrap();

        let loaded = store.load("old").unwrap().unwrap();
        assert_eq!(loaded.schema_version, 1);
        assert_eq!(loaded.entity_name, "old");
        assert_eq!(loaded.statistics.total_files, 1);
        assert_eq!(loaded.statistics.total_size_bytes, 7);
        assert!(loaded.base_assets[0].fingerprint.is_none());
        assert!(MANIFEST_SCHEMA_VERSION > loaded.schema_version);
    }

    #[test]
    fn test_load_rejects_foreign_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let store = ManifestStore::new(temp_dir.path());
        std::fs::write(store.path_for("e1"), r#"{ "entityId": "e2" }"#).unwrap();
        assert!(store.load("e1").is_err());
    }

    #[test]
    fn test_list_entities_skips_summary() {
        let temp_dir = TempDir::new().unwrap();
        let store = ManifestStore::new(temp_dir.path());
        for id in ["b", "a"] {
            let manifest = ManifestBuilder::new().build(id, "", vec![], vec![], Vec::new());
            store.persist(&manifest).unwrap();
        }
        std::fs::write(store.summary_path(), "{}").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(store.list_entities().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_list_entities_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let store = ManifestStore::new(temp_dir.path().join("nope"));
        assert!(store.list_entities().unwrap().is_empty());
    }
}
