//! Flat single-request backends.
//!
//! A flat backend stores a whole file in one write with no trees, commits
//! or chunking. The router uses it when a batch targets
//! [`StorageTarget::Flat`](chunkstash_transfer::StorageTarget::Flat).

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chunkstash_store::{StoreError, StoreFuture};
use chunkstash_transfer::checksum_bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tracing::debug;

const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Where a flat upload landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatObject {
    pub path: String,
    /// SHA-256 hex of the stored bytes.
    pub content_address: String,
    pub public_url: String,
}

/// Whole-file object storage.
pub trait FlatBackend: Send + Sync {
    /// Stores `data` at `path` in a single request.
    fn upload_whole<'a>(
        &'a self,
        data: &'a [u8],
        path: &'a str,
        mime_type: &'a str,
    ) -> StoreFuture<'a, FlatObject>;

    /// Removes the object at `path`. Deleting a missing object succeeds.
    fn delete<'a>(&'a self, path: &'a str) -> StoreFuture<'a, ()>;

    fn backend_name(&self) -> &'static str;
}

/// Settings for [`HttpFlatBackend`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatConfig {
    /// Objects are written with `PUT <endpoint>/<path>`.
    pub endpoint: String,
    /// Base for public URLs; the endpoint is used when empty.
    pub public_base_url: String,
    pub token: String,
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Flat backend speaking plain authenticated HTTP PUT, as exposed by
/// S3-compatible buckets behind a signing proxy.
pub struct HttpFlatBackend {
    http: reqwest::Client,
    endpoint: String,
    public_base_url: String,
}

impl HttpFlatBackend {
    pub fn new(config: &FlatConfig) -> Result<Self, StoreError> {
        if config.endpoint.is_empty() {
            return Err(StoreError::InvalidConfig("flat endpoint must be set".into()));
        }

        let mut headers = HeaderMap::new();
        if !config.token.is_empty() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", config.token))
                    .map_err(|_| StoreError::InvalidConfig("token is not a valid header".into()))?,
            );
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let public_base_url = if config.public_base_url.is_empty() {
            endpoint.clone()
        } else {
            config.public_base_url.trim_end_matches('/').to_string()
        };

        Ok(Self {
            http,
            endpoint,
            public_base_url,
        })
    }

    async fn put(&self, data: &[u8], path: &str, mime_type: &str) -> Result<FlatObject, StoreError> {
        let encoded = encode_path(path);
        let content_type = if mime_type.is_empty() {
            "application/octet-stream"
        } else {
            mime_type
        };

        let resp = self
            .http
            .put(format!("{}/{encoded}", self.endpoint))
            .header(CONTENT_TYPE, content_type)
            .body(data.to_vec())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        debug!(path, size = data.len(), "flat object stored");
        Ok(FlatObject {
            path: path.to_string(),
            content_address: checksum_bytes(data),
            public_url: format!("{}/{encoded}", self.public_base_url),
        })
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let resp = self
            .http
            .delete(format!("{}/{}", self.endpoint, encode_path(path)))
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(path, "flat object already gone");
            return Ok(());
        }
        if !status.is_success() {
            return Err(status_error(resp).await);
        }
        debug!(path, "flat object deleted");
        Ok(())
    }
}

async fn status_error(resp: reqwest::Response) -> StoreError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    StoreError::from_status(status, body, false, retry_after)
}

impl FlatBackend for HttpFlatBackend {
    fn upload_whole<'a>(
        &'a self,
        data: &'a [u8],
        path: &'a str,
        mime_type: &'a str,
    ) -> StoreFuture<'a, FlatObject> {
        Box::pin(self.put(data, path, mime_type))
    }

    fn delete<'a>(&'a self, path: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(self.remove(path))
    }

    fn backend_name(&self) -> &'static str {
        "http-flat"
    }
}

/// In-memory flat backend.
pub struct MemoryFlatBackend {
    objects: Mutex<BTreeMap<String, (Vec<u8>, String)>>,
    public_base_url: String,
}

impl MemoryFlatBackend {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            public_base_url: public_base_url.into(),
        }
    }

    /// Stored bytes and MIME type at `path`.
    pub fn get(&self, path: &str) -> Option<(Vec<u8>, String)> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for MemoryFlatBackend {
    fn default() -> Self {
        Self::new("memory://flat")
    }
}

impl FlatBackend for MemoryFlatBackend {
    fn upload_whole<'a>(
        &'a self,
        data: &'a [u8],
        path: &'a str,
        mime_type: &'a str,
    ) -> StoreFuture<'a, FlatObject> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), (data.to_vec(), mime_type.to_string()));
        let object = FlatObject {
            path: path.to_string(),
            content_address: checksum_bytes(data),
            public_url: format!("{}/{}", self.public_base_url, encode_path(path)),
        };
        Box::pin(std::future::ready(Ok::<_, StoreError>(object)))
    }

    fn delete<'a>(&'a self, path: &'a str) -> StoreFuture<'a, ()> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        Box::pin(std::future::ready(Ok::<_, StoreError>(())))
    }

    fn backend_name(&self) -> &'static str {
        "memory-flat"
    }
}
