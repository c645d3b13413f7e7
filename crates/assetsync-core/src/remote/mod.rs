//! Remote object storage.
//!
//! This module provides:
//! - The [`ObjectStore`] seam implemented by each storage backend
//! - [`RemoteAssetLister`], a paginated lazy listing with injected retries
//! - A filesystem-backed bucket and an HTTP gateway client

mod fs;
mod http;
mod retry;

pub use fs::FsObjectStore;
pub use http::HttpObjectStore;
pub use retry::{retry_async, RetryPolicy, RetryStats};

use crate::config::{BackendConfig, EngineConfig};
use crate::error::{Result, SyncError};
use crate::fingerprint::{Fingerprint, FingerprintKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// An object as reported by a store listing. Never carries content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObjectRecord {
    pub key: String,
    /// Integrity value supplied by the backend, authoritative for equality.
    pub fingerprint: Fingerprint,
    pub fingerprint_kind: FingerprintKind,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

impl RemoteObjectRecord {
    /// Build a record, classifying the integrity value.
    pub fn new(
        key: impl Into<String>,
        fingerprint: Fingerprint,
        size_bytes: u64,
        last_modified: DateTime<Utc>,
    ) -> Self {
        let fingerprint_kind = fingerprint.kind();
        Self {
            key: key.into(),
            fingerprint,
            fingerprint_kind,
            size_bytes,
            last_modified,
        }
    }

    pub fn is_composite(&self) -> bool {
        self.fingerprint_kind == FingerprintKind::Composite
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<RemoteObjectRecord>,
    /// Continuation token for the next page, `None` on the last page.
    pub next: Option<String>,
}

/// Storage backend operations used by the engine.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// List one page of objects whose key starts with `prefix`.
    async fn list_page(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage>;

    /// Fetch a single object's record, `None` if it does not exist.
    async fn head(&self, key: &str) -> Result<Option<RemoteObjectRecord>>;

    /// Upload a local file, replacing any existing object at `key`.
    async fn put_file(&self, key: &str, source: &Path) -> Result<RemoteObjectRecord>;

    /// Part size used for multipart objects, if the backend advertises one.
    fn multipart_part_size(&self) -> Option<u64> {
        None
    }
}

/// Lists and writes remote objects through an [`ObjectStore`], applying the
/// injected retry policy to every call.
#[derive(Clone)]
pub struct RemoteAssetLister {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl RemoteAssetLister {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Lazily list every object under `prefix`.
    ///
    /// Pages are fetched only as the stream is polled; callers never see
    /// page boundaries.
    pub fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Stream<Item = Result<RemoteObjectRecord>> + Send + 'a {
        // state: Some(token) while pages remain
        stream::try_unfold(Some(None::<String>), move |state| async move {
            let Some(token) = state else {
                return Ok(None);
            };
            let page = self.fetch_page(prefix, token.as_deref()).await?;
            debug!(
                "{}: listed {} objects under '{}'",
                self.store.name(),
                page.objects.len(),
                prefix
            );
            Ok::<_, SyncError>(Some((page.objects, page.next.map(Some))))
        })
        .map_ok(|objects| stream::iter(objects.into_iter().map(Ok::<_, SyncError>)))
        .try_flatten()
    }

    /// Collect a full listing.
    pub async fn collect(&self, prefix: &str) -> Result<Vec<RemoteObjectRecord>> {
        self.list(prefix).try_collect().await
    }

    pub async fn head(&self, key: &str) -> Result<Option<RemoteObjectRecord>> {
        self.retry
            .run(&format!("head {}", key), || self.store.head(key))
            .await
    }

    pub async fn put_file(&self, key: &str, source: &Path) -> Result<RemoteObjectRecord> {
        self.retry
            .run(&format!("put {}", key), || self.store.put_file(key, source))
            .await
    }

    async fn fetch_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        self.retry
            .run(&format!("list {}", prefix), || self.store.list_page(prefix, token))
            .await
    }
}

/// Construct the backend described by `config`.
pub fn open_store(config: &BackendConfig) -> Result<Arc<dyn ObjectStore>> {
    match config {
        BackendConfig::Fs {
            root,
            multipart_threshold_bytes,
            part_size_bytes,
            page_size,
        } => {
            let store = FsObjectStore::new(root)
                .with_multipart(
                    multipart_threshold_bytes.unwrap_or(EngineConfig::DEFAULT_MULTIPART_THRESHOLD),
                    part_size_bytes.unwrap_or(EngineConfig::DEFAULT_PART_SIZE),
                )
                .with_page_size(page_size.unwrap_or(EngineConfig::DEFAULT_PAGE_SIZE));
            Ok(Arc::new(store))
        }
        BackendConfig::Http { base_url, .. } => {
            let token = config.resolve_token()?;
            Ok(Arc::new(HttpObjectStore::new(base_url, token)?))
        }
    }
}

/// Join a key prefix and a relative path with exactly one `/`.
pub fn join_key(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", prefix, relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::status_error;
    use crate::fingerprint::fingerprint_bytes;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves fixed pages and can fail the first calls.
    struct PagedStore {
        pages: Vec<Vec<RemoteObjectRecord>>,
        failures: AtomicU32,
        failure: fn() -> SyncError,
        calls: Mutex<Vec<Option<String>>>,
    }

    impl PagedStore {
        fn new(pages: Vec<Vec<RemoteObjectRecord>>) -> Self {
            Self {
                pages,
                failures: AtomicU32::new(0),
                failure: || status_error(503, "paged"),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for PagedStore {
        fn name(&self) -> &str {
            "paged"
        }

        async fn list_page(&self, _prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
            self.calls
                .lock()
                .unwrap()
                .push(continuation.map(str::to_string));
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err((self.failure)());
            }
            let index: usize = continuation.map(|t| t.parse().unwrap()).unwrap_or(0);
            let next = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
            Ok(ListPage {
                objects: self.pages[index].clone(),
                next,
            })
        }

        async fn head(&self, _key: &str) -> Result<Option<RemoteObjectRecord>> {
            Ok(None)
        }

        async fn put_file(&self, key: &str, _source: &Path) -> Result<RemoteObjectRecord> {
            Err(SyncError::NotFound { key: key.into() })
        }
    }

    fn record(key: &str) -> RemoteObjectRecord {
        RemoteObjectRecord::new(key, fingerprint_bytes(key.as_bytes()), 1, Utc::now())
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new()
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    #[tokio::test]
    async fn test_list_flattens_pages() {
        let store = Arc::new(PagedStore::new(vec![
            vec![record("a"), record("b")],
            vec![],
            vec![record("c")],
        ]));
        let lister = RemoteAssetLister::new(store.clone(), fast_retry());

        let keys: Vec<String> = lister
            .collect("")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(store.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_is_lazy() {
        let store = Arc::new(PagedStore::new(vec![vec![record("a")], vec![record("b")]]));
        let lister = RemoteAssetLister::new(store.clone(), fast_retry());

        let mut listing = Box::pin(lister.list(""));
        let first = listing.next().await.unwrap().unwrap();
        assert_eq!(first.key, "a");
        assert_eq!(store.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_retries_transient_page_failures() {
        let store = Arc::new(PagedStore::new(vec![vec![record("a")]]));
        store.failures.store(2, Ordering::SeqCst);
        let lister = RemoteAssetLister::new(store.clone(), fast_retry());

        assert_eq!(lister.collect("").await.unwrap().len(), 1);
        assert_eq!(store.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_does_not_retry_auth_failures() {
        let mut paged = PagedStore::new(vec![vec![record("a")]]);
        paged.failure = || status_error(401, "paged");
        let store = Arc::new(paged);
        store.failures.store(1, Ordering::SeqCst);
        let lister = RemoteAssetLister::new(store.clone(), fast_retry());

        let err = lister.collect("").await.unwrap_err();
        assert!(matches!(err, SyncError::Auth { .. }));
        assert_eq!(store.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_composite_records_are_flagged() {
        let composite = RemoteObjectRecord::new(
            "big.png",
            Fingerprint::from_hex("0123abcd-4"),
            10,
            Utc::now(),
        );
        assert!(composite.is_composite());
        assert!(!record("small.png").is_composite());
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("chars", "e1/a.png"), "chars/e1/a.png");
        assert_eq!(join_key("chars/", "/e1/a.png"), "chars/e1/a.png");
        assert_eq!(join_key("", "e1/a.png"), "e1/a.png");
    }
}
