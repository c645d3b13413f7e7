//! Local asset enumeration.
//!
//! [`LocalAssetScanner::scan`] walks a directory tree lazily and yields one
//! [`AssetRecord`] per matching file. Records are snapshots: nothing is
//! cached between scans, and fingerprints are attached later by producing a
//! new record.

use crate::config::PathsConfig;
use crate::error::{Result, SyncError};
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// What an asset is used for in a training set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum AssetKind {
    Image,
    Caption,
    #[default]
    Other,
}

impl AssetKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("png" | "jpg" | "jpeg" | "webp" | "gif" | "bmp") => AssetKind::Image,
            Some("txt" | "caption") => AssetKind::Caption,
            _ => AssetKind::Other,
        }
    }
}

/// A local file observed at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    /// Path relative to the scan root, `/`-separated.
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Absent until computed; such records are unverified.
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
    #[serde(default)]
    pub kind: AssetKind,
}

impl AssetRecord {
    /// Consume the snapshot and return one carrying `fingerprint`.
    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn is_verified(&self) -> bool {
        self.fingerprint.is_some()
    }
}

/// File-name filter applied during a scan.
#[derive(Debug, Clone)]
pub struct AssetPattern {
    regex: Option<Regex>,
}

impl AssetPattern {
    /// Match every file.
    pub fn any() -> Self {
        Self { regex: None }
    }

    /// Compile a file-name glob supporting `*`, `?` and `{a,b}` alternation.
    pub fn glob(pattern: &str) -> Result<Self> {
        let mut expr = String::from("^");
        let mut in_group = false;
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                '{' if !in_group => {
                    in_group = true;
                    expr.push_str("(?:");
                }
                '}' if in_group => {
                    in_group = false;
                    expr.push(')');
                }
                ',' if in_group => expr.push('|'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        if in_group {
            return Err(SyncError::Config {
                message: format!("unterminated '{{' in asset pattern {}", pattern),
            });
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| SyncError::Config {
            message: format!("invalid asset pattern {}: {}", pattern, e),
        })?;
        Ok(Self { regex: Some(regex) })
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.regex
            .as_ref()
            .map(|re| re.is_match(file_name))
            .unwrap_or(true)
    }
}

impl Default for AssetPattern {
    fn default() -> Self {
        Self::any()
    }
}

/// Files that are never assets, whatever the pattern says.
fn is_excluded(file_name: &str) -> bool {
    file_name == PathsConfig::ENTITY_DESCRIPTOR
        || file_name.starts_with('.')
        || file_name.ends_with(".tmp")
}

/// Stateless scanner; every call to [`scan`](Self::scan) re-walks the tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalAssetScanner;

impl LocalAssetScanner {
    pub fn new() -> Self {
        Self
    }

    /// Start a scan of `root`.
    ///
    /// Fails with [`SyncError::Access`] if the root cannot be read. Problems
    /// with individual files are yielded as items instead.
    pub fn scan(&self, root: impl AsRef<Path>, pattern: &AssetPattern) -> Result<AssetScan> {
        let root = root.as_ref().to_path_buf();
        std::fs::read_dir(&root).map_err(|e| SyncError::Access {
            path: root.clone(),
            message: e.to_string(),
            source: Some(e),
        })?;

        let walker = WalkDir::new(&root)
            .min_depth(1)
            .follow_links(true)
            .into_iter();

        Ok(AssetScan {
            root,
            pattern: pattern.clone(),
            walker,
            vanished: 0,
        })
    }
}

/// Lazy sequence of scanned assets.
pub struct AssetScan {
    root: PathBuf,
    pattern: AssetPattern,
    walker: walkdir::IntoIter,
    vanished: usize,
}

impl AssetScan {
    /// Entries that disappeared between listing and inspection.
    pub fn vanished(&self) -> usize {
        self.vanished
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_for(&self, path: &Path, metadata: &std::fs::Metadata) -> Option<AssetRecord> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let relative_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let created = metadata.created().unwrap_or(modified);

        Some(AssetRecord {
            relative_path,
            absolute_path: path.to_path_buf(),
            size_bytes: metadata.len(),
            created_at: DateTime::<Utc>::from(created),
            modified_at: DateTime::<Utc>::from(modified),
            fingerprint: None,
            kind: AssetKind::from_path(path),
        })
    }
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .map(|e| e.kind() == std::io::ErrorKind::NotFound)
        .unwrap_or(false)
}

impl Iterator for AssetScan {
    type Item = Result<AssetRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) if is_not_found(&e) => {
                    self.vanished += 1;
                    warn!("Entry vanished during scan: {}", e);
                    continue;
                }
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                    return Some(Err(SyncError::per_file(path, e.to_string())));
                }
            };

            let file_name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                if file_name.starts_with('.') {
                    debug!("Skipping hidden directory {}", entry.path().display());
                    self.walker.skip_current_dir();
                }
                continue;
            }
            if is_excluded(&file_name) || !self.pattern.matches(&file_name) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) if is_not_found(&e) => {
                    self.vanished += 1;
                    warn!("File vanished during scan: {}", entry.path().display());
                    continue;
                }
                Err(e) => return Some(Err(SyncError::per_file(entry.path(), e.to_string()))),
            };
            if !metadata.is_file() {
                continue;
            }

            if let Some(record) = self.record_for(entry.path(), &metadata) {
                return Some(Ok(record));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn scan_paths(root: &Path, pattern: &AssetPattern) -> Vec<String> {
        let mut paths: Vec<String> = LocalAssetScanner::new()
            .scan(root, pattern)
            .unwrap()
            .map(|r| r.unwrap().relative_path)
            .collect();
        paths.sort();
        paths
    }

    #[test]
    fn test_scan_emits_relative_paths() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "a.png", b"png");
        write(temp_dir.path(), "poses/b.png", b"png2");
        write(temp_dir.path(), "poses/b.txt", b"a caption");

        assert_eq!(
            scan_paths(temp_dir.path(), &AssetPattern::any()),
            vec!["a.png", "poses/b.png", "poses/b.txt"]
        );
    }

    #[test]
    fn test_scan_records_metadata_without_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "a.png", &[0u8; 100]);
        write(temp_dir.path(), "empty.txt", b"");

        let mut records: Vec<AssetRecord> = LocalAssetScanner::new()
            .scan(temp_dir.path(), &AssetPattern::any())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        assert_eq!(records[0].size_bytes, 100);
        assert_eq!(records[0].kind, AssetKind::Image);
        assert!(!records[0].is_verified());
        assert_eq!(records[1].size_bytes, 0);
        assert_eq!(records[1].kind, AssetKind::Caption);
    }

    #[test]
    fn test_scan_skips_descriptor_hidden_and_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "entity.json", b"{}");
        write(temp_dir.path(), ".DS_Store", b"x");
        write(temp_dir.path(), "upload.tmp", b"x");
        write(temp_dir.path(), ".cache/thumb.png", b"x");
        write(temp_dir.path(), "keep.png", b"x");

        assert_eq!(scan_paths(temp_dir.path(), &AssetPattern::any()), vec!["keep.png"]);
    }

    #[test]
    fn test_glob_pattern() {
        let pattern = AssetPattern::glob("*.{png,txt}").unwrap();
        assert!(pattern.matches("a.png"));
        assert!(pattern.matches("a.txt"));
        assert!(!pattern.matches("a.jpg"));
        assert!(!pattern.matches("apng"));

        let single = AssetPattern::glob("img_?.png").unwrap();
        assert!(single.matches("img_1.png"));
        assert!(!single.matches("img_10.png"));

        assert!(AssetPattern::glob("*.{png").is_err());
    }

    #[test]
    fn test_scan_applies_pattern() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "a.png", b"x");
        write(temp_dir.path(), "notes.md", b"x");

        let pattern = AssetPattern::glob("*.png").unwrap();
        assert_eq!(scan_paths(temp_dir.path(), &pattern), vec!["a.png"]);
    }

    #[test]
    fn test_scan_missing_root_is_access_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = LocalAssetScanner::new().scan(temp_dir.path().join("nope"), &AssetPattern::any());
        assert!(matches!(result, Err(SyncError::Access { .. })));
    }

    #[test]
    fn test_scan_is_restartable() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "a.png", b"x");
        assert_eq!(scan_paths(temp_dir.path(), &AssetPattern::any()).len(), 1);

        write(temp_dir.path(), "b.png", b"y");
        assert_eq!(scan_paths(temp_dir.path(), &AssetPattern::any()).len(), 2);
    }

    #[test]
    fn test_scan_counts_vanished_files() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["a.png", "b.png", "c.png"] {
            write(temp_dir.path(), name, b"x");
        }

        let mut scan = LocalAssetScanner::new()
            .scan(temp_dir.path(), &AssetPattern::any())
            .unwrap();
        let first = scan.next().unwrap().unwrap();
        for name in ["a.png", "b.png", "c.png"] {
            if name != first.relative_path {
                fs::remove_file(temp_dir.path().join(name)).unwrap();
            }
        }

        let rest: Vec<_> = scan.by_ref().collect();
        assert!(rest.iter().all(|r| r.is_ok()));
        assert_eq!(rest.len(), 0);
        assert!(scan.vanished() >= 1);
    }
}
