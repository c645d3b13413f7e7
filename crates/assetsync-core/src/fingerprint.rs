//! Content fingerprints.
//!
//! A fingerprint is the lowercase hex SHA-256 of an asset's bytes. Object
//! stores report the same digest for single-part objects, so local and remote
//! values compare directly. Multipart objects carry a composite value
//! (`<digest of part digests>-<part count>`) that is only comparable to a
//! composite computed with the same part size.

use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::scanner::AssetRecord;
use chrono::{DateTime, Utc};
use mini_moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A fixed-length content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an integrity value reported by a store or read from a manifest.
    pub fn from_hex(value: impl Into<String>) -> Self {
        Fingerprint(value.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> FingerprintKind {
        FingerprintKind::of(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether an integrity value is a plain content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FingerprintKind {
    Simple,
    /// Multipart marker, not comparable to a whole-content digest.
    Composite,
}

impl FingerprintKind {
    /// Classify an integrity value by its `-<parts>` suffix.
    pub fn of(value: &str) -> Self {
        match value.rsplit_once('-') {
            Some((digest, parts))
                if !digest.is_empty()
                    && !parts.is_empty()
                    && parts.bytes().all(|b| b.is_ascii_digit()) =>
            {
                FingerprintKind::Composite
            }
            _ => FingerprintKind::Simple,
        }
    }
}

/// Fingerprint everything a reader yields, in bounded chunks.
pub fn fingerprint_reader<R: Read>(mut reader: R) -> std::io::Result<Fingerprint> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; EngineConfig::FINGERPRINT_CHUNK_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

pub fn fingerprint_bytes(bytes: &[u8]) -> Fingerprint {
    Fingerprint(hex::encode(Sha256::digest(bytes)))
}

/// Fingerprint a file's content.
pub fn fingerprint_file(path: impl AsRef<Path>) -> Result<Fingerprint> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|e| SyncError::per_file(path, e.to_string()))?;
    fingerprint_reader(file).map_err(|e| SyncError::per_file(path, e.to_string()))
}

/// Fingerprint a file on the blocking thread pool.
pub async fn fingerprint_file_async(path: impl AsRef<Path>) -> Result<Fingerprint> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || fingerprint_file(&path))
        .await
        .map_err(|e| SyncError::Other(format!("Fingerprint task failed: {}", e)))?
}

/// Compute the multipart integrity value of a file split into `part_size`
/// parts: the digest of the concatenated raw part digests, suffixed with the
/// part count. An empty file counts as one empty part.
pub fn composite_fingerprint_file(path: impl AsRef<Path>, part_size: u64) -> Result<Fingerprint> {
    let path = path.as_ref();
    if part_size == 0 {
        return Err(SyncError::Other("part size must be positive".into()));
    }
    let mut file =
        std::fs::File::open(path).map_err(|e| SyncError::per_file(path, e.to_string()))?;

    let mut outer = Sha256::new();
    let mut parts: u64 = 0;
    let mut buffer = vec![0u8; EngineConfig::FINGERPRINT_CHUNK_SIZE];
    loop {
        let mut part = Sha256::new();
        let mut remaining = part_size;
        let mut part_len: u64 = 0;
        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let bytes_read = file
                .read(&mut buffer[..want])
                .map_err(|e| SyncError::per_file(path, e.to_string()))?;
            if bytes_read == 0 {
                break;
            }
            part.update(&buffer[..bytes_read]);
            part_len += bytes_read as u64;
            remaining -= bytes_read as u64;
        }
        if part_len == 0 && parts > 0 {
            break;
        }
        outer.update(part.finalize());
        parts += 1;
        if part_len < part_size {
            break;
        }
    }

    Ok(Fingerprint(format!(
        "{}-{}",
        hex::encode(outer.finalize()),
        parts
    )))
}

#[derive(Debug, Clone)]
struct CachedFingerprint {
    size_bytes: u64,
    modified_at: DateTime<Utc>,
    fingerprint: Fingerprint,
}

/// Fingerprints already computed in this process, keyed by absolute path.
///
/// An entry is valid only while the file's size and modification time match
/// the values recorded with it; a mismatching lookup evicts the entry.
#[derive(Clone)]
pub struct FingerprintCache {
    entries: Cache<PathBuf, CachedFingerprint>,
}

impl Default for FingerprintCache {
    fn default() -> Self {
        Self::with_capacity(EngineConfig::FINGERPRINT_CACHE_CAPACITY)
    }
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Look up a fingerprint, invalidating it if the file changed since.
    pub fn get(&self, path: &Path, size_bytes: u64, modified_at: DateTime<Utc>) -> Option<Fingerprint> {
        let key = path.to_path_buf();
        let cached = self.entries.get(&key)?;
        if cached.size_bytes == size_bytes && cached.modified_at == modified_at {
            Some(cached.fingerprint)
        } else {
            debug!("Fingerprint cache entry stale for {}", path.display());
            self.entries.invalidate(&key);
            None
        }
    }

    pub fn insert(
        &self,
        path: &Path,
        size_bytes: u64,
        modified_at: DateTime<Utc>,
        fingerprint: Fingerprint,
    ) {
        self.entries.insert(
            path.to_path_buf(),
            CachedFingerprint {
                size_bytes,
                modified_at,
                fingerprint,
            },
        );
    }

    /// Return a copy of `record` carrying its fingerprint, computing it only
    /// when the cache has no valid entry.
    pub async fn fingerprint_record(&self, record: &AssetRecord) -> Result<AssetRecord> {
        if let Some(fingerprint) = &record.fingerprint {
            return Ok(record.clone().with_fingerprint(fingerprint.clone()));
        }
        if let Some(fingerprint) =
            self.get(&record.absolute_path, record.size_bytes, record.modified_at)
        {
            return Ok(record.clone().with_fingerprint(fingerprint));
        }

        let fingerprint = fingerprint_file_async(&record.absolute_path).await?;
        self.insert(
            &record.absolute_path,
            record.size_bytes,
            record.modified_at,
            fingerprint.clone(),
        );
        Ok(record.clone().with_fingerprint(fingerprint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_empty_input_is_valid_content() {
        assert_eq!(fingerprint_bytes(b"").as_str(), EMPTY_SHA256);
        let file = NamedTempFile::new().unwrap();
        assert_eq!(fingerprint_file(file.path()).unwrap().as_str(), EMPTY_SHA256);
    }

    #[test]
    fn test_identical_bytes_identical_digest() {
        let mut a = NamedTempFile::new().unwrap();
        let mut b = NamedTempFile::new().unwrap();
        a.write_all(b"caption: a knight at dawn").unwrap();
        b.write_all(b"caption: a knight at dawn").unwrap();

        let fa = fingerprint_file(a.path()).unwrap();
        let fb = fingerprint_file(b.path()).unwrap();
        assert_eq!(fa, fb);
        assert_eq!(fa, fingerprint_bytes(b"caption: a knight at dawn"));
        assert_eq!(fa.as_str().len(), 64);
    }

    #[test]
    fn test_single_byte_difference_changes_digest() {
        let base = vec![7u8; 4096];
        let base_fp = fingerprint_bytes(&base);
        let mut seen = std::collections::HashSet::new();
        seen.insert(base_fp.clone());
        for i in (0..base.len()).step_by(97) {
            let mut variant = base.clone();
            variant[i] ^= 0x01;
            assert!(seen.insert(fingerprint_bytes(&variant)), "collision at byte {}", i);
        }
    }

    #[test]
    fn test_reader_streams_across_chunks() {
        let data = vec![42u8; EngineConfig::FINGERPRINT_CHUNK_SIZE * 2 + 17];
        let streamed = fingerprint_reader(std::io::Cursor::new(&data)).unwrap();
        assert_eq!(streamed, fingerprint_bytes(&data));
    }

    #[test]
    fn test_fingerprint_kind() {
        assert_eq!(FingerprintKind::of(EMPTY_SHA256), FingerprintKind::Simple);
        assert_eq!(
            FingerprintKind::of("9b2cf535f27731c974343645a3985328-12"),
            FingerprintKind::Composite
        );
        assert_eq!(FingerprintKind::of("abc-"), FingerprintKind::Simple);
        assert_eq!(FingerprintKind::of("-3"), FingerprintKind::Simple);
    }

    #[test]
    fn test_composite_fingerprint_counts_parts() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![1u8; 25]).unwrap();
        file.flush().unwrap();

        let composite = composite_fingerprint_file(file.path(), 10).unwrap();
        assert!(composite.as_str().ends_with("-3"));
        assert_eq!(composite.kind(), FingerprintKind::Composite);

        let exact = composite_fingerprint_file(file.path(), 25).unwrap();
        assert!(exact.as_str().ends_with("-1"));
        assert_ne!(composite, exact);
    }

    #[test]
    fn test_cache_invalidates_on_modification_time() {
        let cache = FingerprintCache::new();
        let path = Path::new("/assets/e1/a.png");
        let t1 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let t2 = DateTime::from_timestamp(1_700_000_100, 0).unwrap();

        cache.insert(path, 100, t1, fingerprint_bytes(b"one"));
        assert_eq!(cache.get(path, 100, t1), Some(fingerprint_bytes(b"one")));
        assert_eq!(cache.get(path, 100, t2), None);
        // the stale entry was evicted
        assert_eq!(cache.get(path, 100, t1), None);
    }
}
