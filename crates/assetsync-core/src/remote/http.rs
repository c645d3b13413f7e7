//! HTTP object gateway client.
//!
//! Wire protocol:
//! - `GET  {base}/objects?prefix=&continuation=&max-keys=` lists a page
//! - `GET  {base}/objects/{key}?meta` returns one record, 404 if absent
//! - `PUT  {base}/objects/{key}` uploads, body streamed from disk
//!
//! Records are JSON objects `{ key, fingerprint, sizeBytes, lastModified }`.
//! Authentication is a bearer token. 401/403 responses surface as
//! [`SyncError::Auth`]; 408/429/5xx and connection failures as transient.

use super::{ListPage, ObjectStore, RemoteObjectRecord};
use crate::config::EngineConfig;
use crate::error::{status_error, Result, SyncError};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::path::Path;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireObject {
    key: String,
    fingerprint: String,
    size_bytes: u64,
    last_modified: DateTime<Utc>,
}

impl From<WireObject> for RemoteObjectRecord {
    fn from(wire: WireObject) -> Self {
        RemoteObjectRecord::new(
            wire.key,
            Fingerprint::from_hex(wire.fingerprint),
            wire.size_bytes,
            wire.last_modified,
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireListing {
    #[serde(default)]
    objects: Vec<WireObject>,
    #[serde(default)]
    next_continuation: Option<String>,
}

/// Client for an HTTP object gateway.
pub struct HttpObjectStore {
    client: Client,
    base: Url,
    token: Option<String>,
    page_size: usize,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| SyncError::Config {
            message: format!("invalid object store URL {}: {}", base_url, e),
        })?;
        let client = Client::builder()
            .timeout(EngineConfig::HTTP_REQUEST_TIMEOUT)
            .user_agent(concat!("assetsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base,
            token,
            page_size: EngineConfig::DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn objects_url(&self, key: Option<&str>) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| SyncError::Config {
                message: format!("object store URL cannot be a base: {}", self.base),
            })?;
            segments.pop_if_empty().push("objects");
            if let Some(key) = key {
                segments.extend(key.split('/'));
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn check(response: Response, context: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(status_error(status.as_u16(), context))
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn list_page(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        let mut url = self.objects_url(None)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("prefix", prefix);
            query.append_pair("max-keys", &self.page_size.to_string());
            if let Some(token) = continuation {
                query.append_pair("continuation", token);
            }
        }

        let response = self.authorize(self.client.get(url)).send().await?;
        let listing: WireListing = Self::check(response, "list")?.json().await?;
        debug!(
            "Listed {} objects under '{}' (more: {})",
            listing.objects.len(),
            prefix,
            listing.next_continuation.is_some()
        );

        Ok(ListPage {
            objects: listing.objects.into_iter().map(Into::into).collect(),
            next: listing.next_continuation,
        })
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteObjectRecord>> {
        let mut url = self.objects_url(Some(key))?;
        url.set_query(Some("meta"));

        let response = self.authorize(self.client.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let wire: WireObject = Self::check(response, key)?.json().await?;
        Ok(Some(wire.into()))
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<RemoteObjectRecord> {
        let url = self.objects_url(Some(key))?;
        let file = tokio::fs::File::open(source)
            .await
            .map_err(|e| SyncError::per_file(source, e.to_string()))?;
        let length = file
            .metadata()
            .await
            .map_err(|e| SyncError::per_file(source, e.to_string()))?
            .len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let request = self
            .client
            .put(url)
            .header(header::CONTENT_LENGTH, length)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        let response = self.authorize(request).send().await?;
        let wire: WireObject = Self::check(response, key)?.json().await?;
        Ok(wire.into())
    }
}
