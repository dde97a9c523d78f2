//! In-process object store following the git data model.
//!
//! Blobs are addressed by their git blob id, so hashes match what a real
//! git host would return for the same bytes. Used by tests and by the
//! CLI's dry-run mode; faults can be injected per operation to exercise
//! retry and atomicity paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chunkstash_transfer::git_blob_id;
use sha1::{Digest, Sha1};
use tracing::trace;

use crate::DEFAULT_REF;
use crate::client::{CommitInfo, ObjectStore, PathObject, StoreFuture, TreeEntry};
use crate::error::StoreError;

/// Store operation a [`Fault`] applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    CreateContentObject,
    GetRef,
    GetCommit,
    CreateTree,
    CreateCommit,
    UpdateRef,
    FetchByHash,
    FetchByPath,
}

/// An injected failure: after `skip` successful calls of `op`, the next
/// `remaining` calls fail.
#[derive(Debug, Clone)]
pub struct Fault {
    op: StoreOp,
    skip: usize,
    remaining: usize,
    transient: bool,
}

impl Fault {
    /// Fails every call of `op` with a retryable network error.
    pub fn transient(op: StoreOp) -> Self {
        Self {
            op,
            skip: 0,
            remaining: usize::MAX,
            transient: true,
        }
    }

    /// Fails every call of `op` with an authorization error.
    pub fn permanent(op: StoreOp) -> Self {
        Self {
            transient: false,
            ..Self::transient(op)
        }
    }

    /// Lets the first `calls` calls through before failing.
    pub fn after(mut self, calls: usize) -> Self {
        self.skip = calls;
        self
    }

    /// Fails only `n` calls, then heals.
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = n;
        self
    }

    fn error(&self) -> StoreError {
        if self.transient {
            StoreError::Network(format!("injected fault on {:?}", self.op))
        } else {
            StoreError::Unauthorized(format!("injected fault on {:?}", self.op))
        }
    }
}

#[derive(Default)]
struct State {
    blobs: HashMap<String, Vec<u8>>,
    trees: HashMap<String, BTreeMap<String, String>>,
    commits: HashMap<String, CommitInfo>,
    refs: HashMap<String, String>,
    commit_seq: u64,
    calls: HashMap<StoreOp, usize>,
    faults: Vec<Fault>,
    foreign_commit: Option<(String, Vec<(String, Vec<u8>)>)>,
}

impl State {
    fn begin(&mut self, op: StoreOp) -> Result<(), StoreError> {
        *self.calls.entry(op).or_default() += 1;
        for fault in self.faults.iter_mut().filter(|f| f.op == op) {
            if fault.skip > 0 {
                fault.skip -= 1;
                continue;
            }
            if fault.remaining > 0 {
                fault.remaining -= 1;
                trace!(?op, "injecting fault");
                return Err(fault.error());
            }
        }
        Ok(())
    }

    fn put_blob(&mut self, data: &[u8]) -> String {
        let hash = git_blob_id(data);
        self.blobs.entry(hash.clone()).or_insert_with(|| data.to_vec());
        hash
    }

    fn put_tree(&mut self, entries: BTreeMap<String, String>) -> String {
        let mut hasher = Sha1::new();
        for (path, hash) in &entries {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(hash.as_bytes());
            hasher.update(b"\n");
        }
        let id = hex::encode(hasher.finalize());
        self.trees.entry(id.clone()).or_insert(entries);
        id
    }

    fn put_commit(&mut self, tree_id: &str, parents: Vec<String>, message: &str) -> String {
        self.commit_seq += 1;
        let mut hasher = Sha1::new();
        hasher.update(format!("tree {tree_id}\n"));
        for parent in &parents {
            hasher.update(format!("parent {parent}\n"));
        }
        hasher.update(format!("seq {}\n\n{message}", self.commit_seq));
        let id = hex::encode(hasher.finalize());
        self.commits.insert(
            id.clone(),
            CommitInfo {
                id: id.clone(),
                tree_id: tree_id.to_string(),
                parents,
            },
        );
        id
    }

    fn head(&self, ref_name: &str) -> Result<&CommitInfo, StoreError> {
        let commit_id = self
            .refs
            .get(ref_name)
            .ok_or_else(|| StoreError::NotFound(format!("ref {ref_name}")))?;
        self.commits
            .get(commit_id)
            .ok_or_else(|| StoreError::NotFound(format!("commit {commit_id}")))
    }

    fn head_tree(&self, ref_name: &str) -> Result<&BTreeMap<String, String>, StoreError> {
        let tree_id = &self.head(ref_name)?.tree_id;
        self.trees
            .get(tree_id)
            .ok_or_else(|| StoreError::NotFound(format!("tree {tree_id}")))
    }

    /// Publishes `files` on `ref_name` as if another writer did it.
    fn land_foreign(&mut self, ref_name: &str, files: Vec<(String, Vec<u8>)>) -> Result<(), StoreError> {
        let head = self.head(ref_name)?.clone();
        let mut tree = self.head_tree(ref_name)?.clone();
        for (path, data) in files {
            let hash = self.put_blob(&data);
            tree.insert(path, hash);
        }
        let tree_id = self.put_tree(tree);
        let commit = self.put_commit(&tree_id, vec![head.id], "concurrent writer");
        self.refs.insert(ref_name.to_string(), commit);
        Ok(())
    }

    fn create_tree(&mut self, base_tree: &str, entries: &[TreeEntry]) -> Result<String, StoreError> {
        let mut tree = self
            .trees
            .get(base_tree)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("tree {base_tree}")))?;
        for entry in entries {
            match &entry.content_hash {
                Some(hash) => {
                    if !self.blobs.contains_key(hash) {
                        return Err(StoreError::NotFound(format!(
                            "object {hash} for {}",
                            entry.path
                        )));
                    }
                    tree.insert(entry.path.clone(), hash.clone());
                }
                None => {
                    if tree.remove(&entry.path).is_none() {
                        return Err(StoreError::NotFound(format!("path {}", entry.path)));
                    }
                }
            }
        }
        Ok(self.put_tree(tree))
    }

    fn create_commit(&mut self, tree_id: &str, parent: &str, message: &str) -> Result<String, StoreError> {
        if !self.trees.contains_key(tree_id) {
            return Err(StoreError::NotFound(format!("tree {tree_id}")));
        }
        if !self.commits.contains_key(parent) {
            return Err(StoreError::NotFound(format!("commit {parent}")));
        }
        Ok(self.put_commit(tree_id, vec![parent.to_string()], message))
    }

    fn update_ref(&mut self, ref_name: &str, commit_id: &str, expected: &str) -> Result<(), StoreError> {
        if let Some((target, files)) = self.foreign_commit.take() {
            self.land_foreign(&target, files)?;
        }
        if !self.commits.contains_key(commit_id) {
            return Err(StoreError::NotFound(format!("commit {commit_id}")));
        }
        let current = self
            .refs
            .get(ref_name)
            .ok_or_else(|| StoreError::NotFound(format!("ref {ref_name}")))?;
        if current == commit_id {
            return Ok(());
        }
        if current != expected {
            return Err(StoreError::Conflict(format!(
                "ref {ref_name} is at {current}, expected {expected}"
            )));
        }
        self.refs.insert(ref_name.to_string(), commit_id.to_string());
        Ok(())
    }

    fn fetch_by_path(&self, ref_name: &str, path: &str) -> Result<PathObject, StoreError> {
        let hash = self
            .head_tree(ref_name)?
            .get(path)
            .ok_or_else(|| StoreError::NotFound(format!("path {path}")))?;
        let data = self
            .blobs
            .get(hash)
            .ok_or_else(|| StoreError::NotFound(format!("object {hash}")))?;
        Ok(PathObject {
            hash: hash.clone(),
            data: data.clone(),
        })
    }
}

/// Thread-safe in-memory [`ObjectStore`].
pub struct MemoryObjectStore {
    state: Mutex<State>,
}

impl MemoryObjectStore {
    /// Creates a store whose default ref points at an empty root commit.
    pub fn new() -> Self {
        Self::with_ref(DEFAULT_REF)
    }

    /// Creates a store whose `ref_name` points at an empty root commit.
    pub fn with_ref(ref_name: &str) -> Self {
        let mut state = State::default();
        let tree = state.put_tree(BTreeMap::new());
        let root = state.put_commit(&tree, Vec::new(), "initial commit");
        state.refs.insert(ref_name.to_string(), root);
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a fault for subsequent calls.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Removes every registered fault.
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Number of times `op` has been called, including failed calls.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Commit `ref_name` points to, if the ref exists.
    pub fn head(&self, ref_name: &str) -> Option<String> {
        self.lock().refs.get(ref_name).cloned()
    }

    /// Paths visible through `ref_name`, sorted.
    pub fn list_paths(&self, ref_name: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().head_tree(ref_name)?.keys().cloned().collect())
    }

    /// Number of stored content objects, published or not.
    pub fn object_count(&self) -> usize {
        self.lock().blobs.len()
    }

    /// Overwrites the bytes behind `hash`, keeping the hash. Simulates
    /// corruption at rest.
    pub fn corrupt(&self, hash: &str, data: Vec<u8>) {
        self.lock().blobs.insert(hash.to_string(), data);
    }

    /// Makes another writer publish `files` on `ref_name` just before the
    /// next `update_ref` call is applied.
    pub fn race_next_update(&self, ref_name: &str, files: Vec<(String, Vec<u8>)>) {
        self.lock().foreign_commit = Some((ref_name.to_string(), files));
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn create_content_object<'a>(&'a self, data: &'a [u8]) -> StoreFuture<'a, String> {
        let result = {
            let mut state = self.lock();
            state
                .begin(StoreOp::CreateContentObject)
                .map(|()| state.put_blob(data))
        };
        Box::pin(std::future::ready(result))
    }

    fn get_ref<'a>(&'a self, ref_name: &'a str) -> StoreFuture<'a, String> {
        let result = {
            let mut state = self.lock();
            state.begin(StoreOp::GetRef).and_then(|()| {
                state
                    .refs
                    .get(ref_name)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(format!("ref {ref_name}")))
            })
        };
        Box::pin(std::future::ready(result))
    }

    fn get_commit<'a>(&'a self, commit_id: &'a str) -> StoreFuture<'a, CommitInfo> {
        let result = {
            let mut state = self.lock();
            state.begin(StoreOp::GetCommit).and_then(|()| {
                state
                    .commits
                    .get(commit_id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(format!("commit {commit_id}")))
            })
        };
        Box::pin(std::future::ready(result))
    }

    fn create_tree<'a>(
        &'a self,
        base_tree: &'a str,
        entries: &'a [TreeEntry],
    ) -> StoreFuture<'a, String> {
        let result = {
            let mut state = self.lock();
            state
                .begin(StoreOp::CreateTree)
                .and_then(|()| state.create_tree(base_tree, entries))
        };
        Box::pin(std::future::ready(result))
    }

    fn create_commit<'a>(
        &'a self,
        tree_id: &'a str,
        parent: &'a str,
        message: &'a str,
    ) -> StoreFuture<'a, String> {
        let result = {
            let mut state = self.lock();
            state
                .begin(StoreOp::CreateCommit)
                .and_then(|()| state.create_commit(tree_id, parent, message))
        };
        Box::pin(std::future::ready(result))
    }

    fn update_ref<'a>(
        &'a self,
        ref_name: &'a str,
        commit_id: &'a str,
        expected: &'a str,
    ) -> StoreFuture<'a, ()> {
        let result = {
            let mut state = self.lock();
            state
                .begin(StoreOp::UpdateRef)
                .and_then(|()| state.update_ref(ref_name, commit_id, expected))
        };
        Box::pin(std::future::ready(result))
    }

    fn fetch_object_by_hash<'a>(&'a self, hash: &'a str) -> StoreFuture<'a, Vec<u8>> {
        let result = {
            let mut state = self.lock();
            state.begin(StoreOp::FetchByHash).and_then(|()| {
                state
                    .blobs
                    .get(hash)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(format!("object {hash}")))
            })
        };
        Box::pin(std::future::ready(result))
    }

    fn fetch_object_by_path<'a>(
        &'a self,
        ref_name: &'a str,
        path: &'a str,
    ) -> StoreFuture<'a, PathObject> {
        let result = {
            let mut state = self.lock();
            state
                .begin(StoreOp::FetchByPath)
                .and_then(|()| state.fetch_by_path(ref_name, path))
        };
        Box::pin(std::future::ready(result))
    }

    fn content_hash(&self, data: &[u8]) -> Option<String> {
        Some(git_blob_id(data))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
