//! Directory-backed object store.
//!
//! Objects live at `<root>/<key>`. Integrity metadata is kept in a sidecar
//! document under `<root>/.meta/<key>.json`, written after the object itself
//! so a crash between the two leaves a stale sidecar that no longer matches
//! the source, which the next run treats as drift and rewrites.

use super::{ListPage, ObjectStore, RemoteObjectRecord};
use crate::config::{EngineConfig, PathsConfig};
use crate::error::{Result, SyncError};
use crate::fingerprint::{composite_fingerprint_file, fingerprint_file, Fingerprint};
use crate::manifest::atomic::{atomic_read_json, atomic_write_json, temp_path_for};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Sidecar integrity metadata for one stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    fingerprint: Fingerprint,
    size_bytes: u64,
    last_modified: DateTime<Utc>,
    #[serde(default = "one")]
    parts: u64,
}

fn one() -> u64 {
    1
}

/// A local directory acting as a bucket.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    multipart_threshold: u64,
    part_size: u64,
    page_size: usize,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            multipart_threshold: EngineConfig::DEFAULT_MULTIPART_THRESHOLD,
            part_size: EngineConfig::DEFAULT_PART_SIZE,
            page_size: EngineConfig::DEFAULT_PAGE_SIZE,
        }
    }

    /// Store objects of at least `threshold` bytes as multipart uploads.
    pub fn with_multipart(mut self, threshold: u64, part_size: u64) -> Self {
        self.multipart_threshold = threshold;
        self.part_size = part_size.max(1);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the bytes of `key` are stored.
    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn meta_root(&self) -> PathBuf {
        self.root.join(PathsConfig::STORE_META_DIR_NAME)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.meta_root().join(format!("{}.json", key))
    }

    fn list_blocking(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        let dir_part = prefix.rfind('/').map(|i| &prefix[..i]).unwrap_or("");
        let walk_root = self.root.join(dir_part);
        if !walk_root.is_dir() {
            return Ok(ListPage::default());
        }

        let meta_root = self.meta_root();
        let mut keys = Vec::new();
        for entry in WalkDir::new(&walk_root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.path() != meta_root.as_path())
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e)
                    if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) =>
                {
                    continue
                }
                Err(e) => return Err(SyncError::Other(format!("Failed to list store: {}", e))),
            };
            if !entry.file_type().is_file() || entry.file_name().to_string_lossy().ends_with(".tmp")
            {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) && continuation.map_or(true, |c| key.as_str() > c) {
                keys.push(key);
            }
        }

        keys.sort();
        let more = keys.len() > self.page_size;
        keys.truncate(self.page_size);
        let next = if more { keys.last().cloned() } else { None };

        let mut objects = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(record) = self.record_blocking(key)? {
                objects.push(record);
            }
        }
        Ok(ListPage { objects, next })
    }

    fn record_blocking(&self, key: &str) -> Result<Option<RemoteObjectRecord>> {
        let path = self.object_path(key);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io_with_path(e, path)),
        };

        if let Some(meta) = atomic_read_json::<ObjectMeta>(&self.meta_path(key))? {
            if meta.size_bytes == metadata.len() {
                return Ok(Some(RemoteObjectRecord::new(
                    key,
                    meta.fingerprint,
                    meta.size_bytes,
                    meta.last_modified,
                )));
            }
            debug!("Sidecar for {} does not match object size, recomputing", key);
        }

        // placed without going through the store: compute integrity on read
        let fingerprint = fingerprint_file(&path)?;
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(RemoteObjectRecord::new(
            key,
            fingerprint,
            metadata.len(),
            modified,
        )))
    }

    fn put_blocking(&self, key: &str, source: &Path) -> Result<RemoteObjectRecord> {
        validate_key(key)?;
        let dest = self.object_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::io_with_path(e, parent))?;
        }

        let source_meta =
            fs::metadata(source).map_err(|e| SyncError::per_file(source, e.to_string()))?;
        let temp = temp_path_for(&dest);

        let copied = copy_hashing(source, &temp);
        let (size_bytes, digest) = match copied {
            Ok(result) => result,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(e);
            }
        };

        let (fingerprint, parts) = if size_bytes >= self.multipart_threshold {
            let composite = composite_fingerprint_file(&temp, self.part_size)?;
            let parts = size_bytes.div_ceil(self.part_size).max(1);
            (composite, parts)
        } else {
            (digest, 1)
        };

        if let Err(e) = filetime::set_file_times(
            &temp,
            FileTime::from_last_access_time(&source_meta),
            FileTime::from_last_modification_time(&source_meta),
        ) {
            warn!("Could not preserve timestamps on {}: {}", dest.display(), e);
        }

        fs::rename(&temp, &dest).map_err(|e| {
            let _ = fs::remove_file(&temp);
            SyncError::io_with_path(e, &dest)
        })?;

        let meta = ObjectMeta {
            fingerprint,
            size_bytes,
            last_modified: Utc::now(),
            parts,
        };
        atomic_write_json(&self.meta_path(key), &meta)?;

        debug!("Stored {} ({} bytes, {} parts)", key, size_bytes, parts);
        Ok(RemoteObjectRecord::new(
            key,
            meta.fingerprint,
            meta.size_bytes,
            meta.last_modified,
        ))
    }
}

/// Copy `source` to `dest`, returning the byte count and content digest.
fn copy_hashing(source: &Path, dest: &Path) -> Result<(u64, Fingerprint)> {
    let mut reader = File::open(source).map_err(|e| SyncError::per_file(source, e.to_string()))?;
    let mut writer = File::create(dest).map_err(|e| SyncError::io_with_path(e, dest))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; EngineConfig::FINGERPRINT_CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| SyncError::per_file(source, e.to_string()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| SyncError::io_with_path(e, dest))?;
        total += bytes_read as u64;
    }
    writer
        .sync_all()
        .map_err(|e| SyncError::io_with_path(e, dest))?;

    Ok((total, Fingerprint::from_hex(hex::encode(hasher.finalize()))))
}

fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key.contains('\\')
        || key.split('/').next() == Some(PathsConfig::STORE_META_DIR_NAME)
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        Err(SyncError::Other(format!("Invalid object key: {:?}", key)))
    } else {
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn name(&self) -> &str {
        "fs"
    }

    async fn list_page(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        let store = self.clone();
        let prefix = prefix.to_string();
        let continuation = continuation.map(str::to_string);
        tokio::task::spawn_blocking(move || store.list_blocking(&prefix, continuation.as_deref()))
            .await
            .map_err(|e| SyncError::Other(format!("Listing task failed: {}", e)))?
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteObjectRecord>> {
        let store = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.record_blocking(&key))
            .await
            .map_err(|e| SyncError::Other(format!("Head task failed: {}", e)))?
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<RemoteObjectRecord> {
        let store = self.clone();
        let key = key.to_string();
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || store.put_blocking(&key, &source))
            .await
            .map_err(|e| SyncError::Other(format!("Upload task failed: {}", e)))?
    }

    fn multipart_part_size(&self) -> Option<u64> {
        Some(self.part_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{fingerprint_bytes, FingerprintKind};
    use tempfile::TempDir;

    fn source_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_put_then_head() {
        let bucket = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let store = FsObjectStore::new(bucket.path());
        let file = source_file(src.path(), "a.png", &[9u8; 100]);

        let stored = store.put_file("chars/e1/a.png", &file).await.unwrap();
        assert_eq!(stored.fingerprint, fingerprint_bytes(&[9u8; 100]));
        assert_eq!(stored.fingerprint_kind, FingerprintKind::Simple);
        assert_eq!(stored.size_bytes, 100);

        let head = store.head("chars/e1/a.png").await.unwrap().unwrap();
        assert_eq!(head.fingerprint, stored.fingerprint);
        assert_eq!(
            fs::read(store.object_path("chars/e1/a.png")).unwrap(),
            vec![9u8; 100]
        );
        assert!(store.head("chars/e1/missing.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_preserves_modification_time() {
        let bucket = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let store = FsObjectStore::new(bucket.path());
        let file = source_file(src.path(), "a.png", b"pixels");
        let mtime = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&file, mtime).unwrap();

        store.put_file("e1/a.png", &file).await.unwrap();

        let stored_meta = fs::metadata(store.object_path("e1/a.png")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&stored_meta), mtime);
    }

    #[tokio::test]
    async fn test_list_paginates_in_key_order() {
        let bucket = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let store = FsObjectStore::new(bucket.path()).with_page_size(2);
        let file = source_file(src.path(), "x.png", b"x");
        for key in ["p/c.png", "p/a.png", "p/sub/b.png", "q/z.png"] {
            store.put_file(key, &file).await.unwrap();
        }

        let first = store.list_page("p/", None).await.unwrap();
        let keys: Vec<_> = first.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["p/a.png", "p/c.png"]);
        assert_eq!(first.next.as_deref(), Some("p/c.png"));

        let second = store.list_page("p/", first.next.as_deref()).await.unwrap();
        let keys: Vec<_> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["p/sub/b.png"]);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let bucket = TempDir::new().unwrap();
        let store = FsObjectStore::new(bucket.path());
        let page = store.list_page("nothing/here/", None).await.unwrap();
        assert!(page.objects.is_empty());
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_large_objects_get_composite_fingerprints() {
        let bucket = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let store = FsObjectStore::new(bucket.path()).with_multipart(32, 16);
        let file = source_file(src.path(), "big.png", &[3u8; 40]);

        let stored = store.put_file("e1/big.png", &file).await.unwrap();
        assert!(stored.is_composite());
        assert!(stored.fingerprint.as_str().ends_with("-3"));
        assert_eq!(
            stored.fingerprint,
            composite_fingerprint_file(&file, 16).unwrap()
        );
        assert_eq!(store.multipart_part_size(), Some(16));
    }

    #[tokio::test]
    async fn test_objects_placed_outside_store_are_fingerprinted() {
        let bucket = TempDir::new().unwrap();
        let store = FsObjectStore::new(bucket.path());
        fs::create_dir_all(bucket.path().join("e1")).unwrap();
        fs::write(bucket.path().join("e1/manual.txt"), b"hand placed").unwrap();

        let head = store.head("e1/manual.txt").await.unwrap().unwrap();
        assert_eq!(head.fingerprint, fingerprint_bytes(b"hand placed"));
    }

    #[tokio::test]
    async fn test_invalid_keys_are_rejected() {
        let bucket = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let store = FsObjectStore::new(bucket.path());
        let file = source_file(src.path(), "a.png", b"x");

        for key in ["", "../escape.png", ".meta/x.json", "/abs.png", "a/./b.png"] {
            assert!(store.put_file(key, &file).await.is_err(), "{key} accepted");
        }
    }
}
