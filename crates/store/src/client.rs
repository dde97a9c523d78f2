//! The object store trait the engine is written against.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Boxed future returned by every [`ObjectStore`] call.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// One entry overlaid onto a base tree. A `None` hash removes the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub content_hash: Option<String>,
}

impl TreeEntry {
    /// Sets `path` to an existing content object.
    pub fn blob(path: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_hash: Some(content_hash.into()),
        }
    }

    /// Removes `path` from the base tree.
    pub fn removal(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_hash: None,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.content_hash.is_none()
    }
}

/// A commit as seen by readers of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: String,
    pub tree_id: String,
    pub parents: Vec<String>,
}

/// Content resolved through a path lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathObject {
    pub hash: String,
    pub data: Vec<u8>,
}

/// Remote content-addressable store with tree/commit/ref publishing.
///
/// Implementations must make `create_tree` all-or-nothing and treat
/// `update_ref` as the only call that changes what readers see.
/// Errors are classified with [`StoreError::kind`].
pub trait ObjectStore: Send + Sync {
    /// Persists `data` as a content object and returns its hash. The
    /// store may or may not deduplicate.
    fn create_content_object<'a>(&'a self, data: &'a [u8]) -> StoreFuture<'a, String>;

    /// Returns the commit `ref_name` currently points to.
    fn get_ref<'a>(&'a self, ref_name: &'a str) -> StoreFuture<'a, String>;

    /// Looks up a commit by id.
    fn get_commit<'a>(&'a self, commit_id: &'a str) -> StoreFuture<'a, CommitInfo>;

    /// Creates a tree that overlays `entries` onto `base_tree`. Removing a
    /// path the base tree does not have fails the whole call.
    fn create_tree<'a>(
        &'a self,
        base_tree: &'a str,
        entries: &'a [TreeEntry],
    ) -> StoreFuture<'a, String>;

    /// Creates a commit of `tree_id` with `parent` as its only parent.
    fn create_commit<'a>(
        &'a self,
        tree_id: &'a str,
        parent: &'a str,
        message: &'a str,
    ) -> StoreFuture<'a, String>;

    /// Moves `ref_name` to `commit_id`, provided it still points at
    /// `expected`. A moved ref fails with [`StoreError::Conflict`]; a ref
    /// already at `commit_id` succeeds, so the call is safe to retry.
    fn update_ref<'a>(
        &'a self,
        ref_name: &'a str,
        commit_id: &'a str,
        expected: &'a str,
    ) -> StoreFuture<'a, ()>;

    /// Fetches a content object by hash.
    fn fetch_object_by_hash<'a>(&'a self, hash: &'a str) -> StoreFuture<'a, Vec<u8>>;

    /// Resolves `path` in the tree `ref_name` currently points to.
    fn fetch_object_by_path<'a>(
        &'a self,
        ref_name: &'a str,
        path: &'a str,
    ) -> StoreFuture<'a, PathObject>;

    /// Hash this store would assign to `data`, if it can compute it
    /// locally. Readers use it to verify fetched content.
    fn content_hash(&self, _data: &[u8]) -> Option<String> {
        None
    }

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}
