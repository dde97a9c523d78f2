//! GitHub git-data API backend.
//!
//! Blobs, trees and commits go through `/repos/{owner}/{repo}/git/*`;
//! path lookups use the contents API. Chunks are sent base64-encoded, so a
//! chunk's encoded size must stay under the API payload ceiling.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::client::{CommitInfo, ObjectStore, PathObject, StoreFuture, TreeEntry};
use crate::error::StoreError;

const DEFAULT_API_URL: &str = "https://api.github.com";

/// Characters left unescaped in a path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Identity recorded as author and committer of published commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committer {
    pub name: String,
    pub email: String,
}

impl Default for Committer {
    fn default() -> Self {
        Self {
            name: "Chunkstash Bot".into(),
            email: "chunkstash-bot@users.noreply.github.com".into(),
        }
    }
}

/// Connection settings for [`GithubStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub api_url: String,
    pub owner: String,
    pub repo: String,
    pub token: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.into(),
            owner: String::new(),
            repo: String::new(),
            token: String::new(),
        }
    }
}

/// [`ObjectStore`] backed by a GitHub repository.
pub struct GithubStore {
    http: reqwest::Client,
    repo_url: String,
    committer: Committer,
}

#[derive(Serialize)]
struct CreateBlob<'a> {
    content: String,
    encoding: &'a str,
}

#[derive(Deserialize)]
struct Sha {
    sha: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: Sha,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
    tree: Sha,
    #[serde(default)]
    parents: Vec<Sha>,
}

#[derive(Serialize)]
struct TreeItem<'a> {
    path: &'a str,
    mode: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    /// `null` deletes the path from the base tree.
    sha: Option<&'a str>,
}

#[derive(Serialize)]
struct CreateTree<'a> {
    base_tree: &'a str,
    tree: Vec<TreeItem<'a>>,
}

#[derive(Serialize)]
struct CreateCommit<'a> {
    message: &'a str,
    tree: &'a str,
    parents: [&'a str; 1],
    author: &'a Committer,
    committer: &'a Committer,
}

#[derive(Serialize)]
struct UpdateRef<'a> {
    sha: &'a str,
    force: bool,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

/// The contents API answers with an array when the path is a directory.
#[derive(Deserialize)]
#[serde(untagged)]
enum ContentsListing {
    Directory(Vec<serde_json::Value>),
    Entry(ContentResponse),
}

#[derive(Deserialize)]
struct ContentResponse {
    sha: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

impl GithubStore {
    /// Creates a client for `config`'s repository, committing as `committer`.
    pub fn new(config: &GithubConfig, committer: Committer) -> Result<Self, StoreError> {
        if config.owner.is_empty() || config.repo.is_empty() {
            return Err(StoreError::InvalidConfig(
                "github owner and repo must be set".into(),
            ));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("chunkstash/", env!("CARGO_PKG_VERSION"))),
        );
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

        let repo_url = format!(
            "{}/repos/{}/{}",
            config.api_url.trim_end_matches('/'),
            utf8_percent_encode(&config.owner, SEGMENT),
            utf8_percent_encode(&config.repo, SEGMENT),
        );

        Ok(Self {
            http,
            repo_url,
            committer,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.repo_url)
    }

    /// Sends `req` and decodes a JSON success body, mapping error statuses.
    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, StoreError> {
        let resp = req.send().await?;
        let status = resp.status();

        if !status.is_success() {
            let budget_spent = resp
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.trim() == "0");
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            let rate_limited =
                budget_spent || (status.as_u16() == 403 && body.to_ascii_lowercase().contains("rate limit"));
            debug!(status = status.as_u16(), rate_limited, "github request failed");
            return Err(StoreError::from_status(
                status.as_u16(),
                body,
                rate_limited,
                retry_after,
            ));
        }

        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn create_blob(&self, data: &[u8]) -> Result<String, StoreError> {
        let body = CreateBlob {
            content: STANDARD.encode(data),
            encoding: "base64",
        };
        let created: Sha = self
            .send(self.http.post(self.url("/git/blobs")).json(&body))
            .await?;
        trace!(sha = %created.sha, size = data.len(), "blob created");
        Ok(created.sha)
    }

    async fn read_ref(&self, ref_name: &str) -> Result<String, StoreError> {
        let resp: RefResponse = self
            .send(self.http.get(self.url(&format!("/git/ref/{}", encode_path(ref_name)))))
            .await?;
        Ok(resp.object.sha)
    }

    async fn read_commit(&self, commit_id: &str) -> Result<CommitInfo, StoreError> {
        let resp: CommitResponse = self
            .send(self.http.get(self.url(&format!("/git/commits/{}", encode_path(commit_id)))))
            .await?;
        Ok(CommitInfo {
            id: resp.sha,
            tree_id: resp.tree.sha,
            parents: resp.parents.into_iter().map(|p| p.sha).collect(),
        })
    }

    async fn write_tree(&self, base_tree: &str, entries: &[TreeEntry]) -> Result<String, StoreError> {
        let body = CreateTree {
            base_tree,
            tree: entries
                .iter()
                .map(|e| TreeItem {
                    path: &e.path,
                    mode: "100644",
                    kind: "blob",
                    sha: e.content_hash.as_deref(),
                })
                .collect(),
        };
        let created: Sha = self
            .send(self.http.post(self.url("/git/trees")).json(&body))
            .await?;
        Ok(created.sha)
    }

    async fn write_commit(&self, tree: &str, parent: &str, message: &str) -> Result<String, StoreError> {
        let body = CreateCommit {
            message,
            tree,
            parents: [parent],
            author: &self.committer,
            committer: &self.committer,
        };
        let created: Sha = self
            .send(self.http.post(self.url("/git/commits")).json(&body))
            .await?;
        Ok(created.sha)
    }

    async fn move_ref(&self, ref_name: &str, commit_id: &str, expected: &str) -> Result<(), StoreError> {
        // A non-forced update only fast-forwards. The new commit's parent is
        // `expected`, so the update is rejected once the ref has moved.
        let body = UpdateRef {
            sha: commit_id,
            force: false,
        };
        let _: serde_json::Value = self
            .send(
                self.http
                    .patch(self.url(&format!("/git/refs/{}", encode_path(ref_name))))
                    .json(&body),
            )
            .await?;
        debug!(ref_name, commit = commit_id, expected, "ref updated");
        Ok(())
    }

    async fn read_blob(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let resp: BlobResponse = self
            .send(self.http.get(self.url(&format!("/git/blobs/{}", encode_path(hash)))))
            .await?;
        decode_content(&resp.content, &resp.encoding)
    }

    async fn read_path(&self, ref_name: &str, path: &str) -> Result<PathObject, StoreError> {
        let branch = ref_name.strip_prefix("heads/").unwrap_or(ref_name);
        let listing: ContentsListing = self
            .send(
                self.http
                    .get(self.url(&format!("/contents/{}", encode_path(path))))
                    .query(&[("ref", branch)]),
            )
            .await?;
        let resp = match listing {
            ContentsListing::Entry(resp) => resp,
            ContentsListing::Directory(items) => {
                return Err(StoreError::InvalidResponse(format!(
                    "{path} is a directory with {} entries, not a file",
                    items.len()
                )));
            }
        };
        if resp.kind != "file" {
            return Err(StoreError::InvalidResponse(format!(
                "{path} is a {}, not a file",
                resp.kind
            )));
        }

        // The contents API omits bodies over 1 MB; fall back to the blob.
        let data = match (resp.content.as_deref(), resp.encoding.as_deref()) {
            (Some(content), Some(encoding)) if !content.is_empty() && encoding != "none" => {
                decode_content(content, encoding)?
            }
            _ => self.read_blob(&resp.sha).await?,
        };
        Ok(PathObject {
            hash: resp.sha,
            data,
        })
    }
}

/// Percent-encodes each `/`-separated segment of `path`.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn decode_content(content: &str, encoding: &str) -> Result<Vec<u8>, StoreError> {
    match encoding {
        "base64" => {
            let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            STANDARD
                .decode(compact)
                .map_err(|e| StoreError::InvalidResponse(format!("bad base64 content: {e}")))
        }
        "utf-8" | "utf8" => Ok(content.as_bytes().to_vec()),
        other => Err(StoreError::InvalidResponse(format!(
            "unsupported content encoding {other:?}"
        ))),
    }
}

impl ObjectStore for GithubStore {
    fn create_content_object<'a>(&'a self, data: &'a [u8]) -> StoreFuture<'a, String> {
        Box::pin(self.create_blob(data))
    }

    fn get_ref<'a>(&'a self, ref_name: &'a str) -> StoreFuture<'a, String> {
        Box::pin(self.read_ref(ref_name))
    }

    fn get_commit<'a>(&'a self, commit_id: &'a str) -> StoreFuture<'a, CommitInfo> {
        Box::pin(self.read_commit(commit_id))
    }

    fn create_tree<'a>(
        &'a self,
        base_tree: &'a str,
        entries: &'a [TreeEntry],
    ) -> StoreFuture<'a, String> {
        Box::pin(self.write_tree(base_tree, entries))
    }

    fn create_commit<'a>(
        &'a self,
        tree_id: &'a str,
        parent: &'a str,
        message: &'a str,
    ) -> StoreFuture<'a, String> {
        Box::pin(self.write_commit(tree_id, parent, message))
    }

    fn update_ref<'a>(
        &'a self,
        ref_name: &'a str,
        commit_id: &'a str,
        expected: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.move_ref(ref_name, commit_id, expected))
    }

    fn fetch_object_by_hash<'a>(&'a self, hash: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(self.read_blob(hash))
    }

    fn fetch_object_by_path<'a>(
        &'a self,
        ref_name: &'a str,
        path: &'a str,
    ) -> StoreFuture<'a, PathObject> {
        Box::pin(self.read_path(ref_name, path))
    }

    fn content_hash(&self, data: &[u8]) -> Option<String> {
        Some(chunkstash_transfer::git_blob_id(data))
    }

    fn backend_name(&self) -> &'static str {
        "github"
    }
}
