//! The publish transaction.
//!
//! Content objects are written first and are invisible on their own. A
//! [`TreeDraft`] is the pure description of what should become visible;
//! [`Publisher::publish`] turns it into a tree and commit on the current
//! base and moves the ref with a compare-and-swap. When another writer
//! moves the ref first, the draft is replayed on the new base.

use std::collections::HashSet;

use chunkstash_store::{ObjectStore, RetryError, StoreError, TreeEntry};
use chunkstash_transfer::{ChunkDescriptor, ProgressSink, TransferPhase, validate_object_path};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Stage};
use crate::state::{UploadEvent, UploadState};

/// Paths to set or remove on top of the base tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDraft {
    entries: Vec<TreeEntry>,
    paths: HashSet<String>,
}

impl TreeDraft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one entry. Paths must be valid and unique within the draft.
    pub fn add(&mut self, path: &str, content_hash: &str) -> Result<(), EngineError> {
        self.claim(path)?;
        self.entries.push(TreeEntry::blob(path, content_hash));
        Ok(())
    }

    /// Removes `path`. Publishing fails if the base tree lacks it.
    pub fn remove(&mut self, path: &str) -> Result<(), EngineError> {
        self.claim(path)?;
        self.entries.push(TreeEntry::removal(path));
        Ok(())
    }

    fn claim(&mut self, path: &str) -> Result<(), EngineError> {
        validate_object_path(path)?;
        if !self.paths.insert(path.to_string()) {
            return Err(EngineError::InvalidInput(format!(
                "duplicate path in one publish: {path}"
            )));
        }
        Ok(())
    }

    /// Builds a draft covering every chunk. All chunks must be stored.
    pub fn from_chunks(chunks: &[ChunkDescriptor]) -> Result<Self, EngineError> {
        let mut draft = Self::new();
        draft.extend_chunks(chunks)?;
        Ok(draft)
    }

    pub fn extend_chunks(&mut self, chunks: &[ChunkDescriptor]) -> Result<(), EngineError> {
        for chunk in chunks {
            let hash = chunk.content_hash.as_deref().ok_or_else(|| EngineError::Integrity {
                stage: Stage::chunk(TransferPhase::Committing, chunk.index, &chunk.path),
                reason: "chunk has no content hash".into(),
            })?;
            self.add(&chunk.path, hash)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Commit and tree the ref pointed at when it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base {
    pub commit_id: String,
    pub tree_id: String,
}

/// Runs store calls for one transfer under the configured retry policy.
pub struct Publisher<'a> {
    store: &'a dyn ObjectStore,
    config: &'a EngineConfig,
    cancel: &'a CancellationToken,
}

impl<'a> Publisher<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        config: &'a EngineConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            cancel,
        }
    }

    /// Reads the ref, then its commit, to find the tree to build on.
    pub async fn resolve_base(&self, phase: TransferPhase) -> Result<Base, EngineError> {
        let stage = || Stage::new(phase).with_path(self.config.ref_name.clone());
        let retry = &self.config.retry;
        let ref_name = self.config.ref_name.as_str();

        let commit_id = retry
            .run(self.cancel, "get_ref", || self.store.get_ref(ref_name))
            .await
            .map_err(|e| EngineError::from_retry(e, stage()))?;
        let commit = retry
            .run(self.cancel, "get_commit", || self.store.get_commit(&commit_id))
            .await
            .map_err(|e| EngineError::from_retry(e, stage()))?;

        debug!(ref_name, commit = %commit.id, tree = %commit.tree_id, "resolved base");
        Ok(Base {
            commit_id: commit.id,
            tree_id: commit.tree_id,
        })
    }

    /// Stores one content object and checks the returned hash when the
    /// store can compute it locally.
    pub async fn store_object(&self, data: &[u8], stage: Stage) -> Result<String, EngineError> {
        let hash = self
            .config
            .retry
            .run(self.cancel, "create_content_object", || {
                self.store.create_content_object(data)
            })
            .await
            .map_err(|e| EngineError::from_retry(e, stage.clone()))?;

        if let Some(expected) = self.store.content_hash(data)
            && expected != hash
        {
            return Err(EngineError::Integrity {
                stage,
                reason: format!("store returned hash {hash}, content hashes to {expected}"),
            });
        }
        Ok(hash)
    }

    /// Publishes `draft` on top of `base` and returns the new commit id.
    ///
    /// `state` must be at the tree step. Progress is reported at 80, 85 and
    /// 90 percent for the tree, commit and ref steps.
    pub async fn publish(
        &self,
        mut base: Base,
        draft: &TreeDraft,
        message: &str,
        state: &mut UploadState,
        progress: &ProgressSink,
    ) -> Result<String, EngineError> {
        if draft.is_empty() {
            return Err(EngineError::InvalidInput("nothing to publish".into()));
        }

        let retry = &self.config.retry;
        let ref_name = self.config.ref_name.as_str();
        let stage = || Stage::new(TransferPhase::Committing).with_path(ref_name);
        let attempts = self.config.publish_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.check_cancelled(stage())?;
            progress.emit(TransferPhase::Committing, 80.0);
            let tree_id = retry
                .run(self.cancel, "create_tree", || {
                    self.store.create_tree(&base.tree_id, draft.entries())
                })
                .await
                .map_err(|e| EngineError::from_retry(e, stage()))?;
            state.advance(UploadEvent::TreeCreated)?;

            progress.emit(TransferPhase::Committing, 85.0);
            let commit_id = retry
                .run(self.cancel, "create_commit", || {
                    self.store.create_commit(&tree_id, &base.commit_id, message)
                })
                .await
                .map_err(|e| EngineError::from_retry(e, stage()))?;
            state.advance(UploadEvent::CommitCreated)?;

            // Last point at which cancelling leaves the ref untouched.
            self.check_cancelled(stage())?;
            progress.emit(TransferPhase::Committing, 90.0);
            let updated = retry
                .run_to_completion(self.cancel, "update_ref", || {
                    self.store.update_ref(ref_name, &commit_id, &base.commit_id)
                })
                .await;

            match updated {
                Ok(()) => {
                    state.advance(UploadEvent::RefUpdated {
                        commit_id: commit_id.clone(),
                    })?;
                    info!(
                        backend = self.store.backend_name(),
                        ref_name,
                        commit = %commit_id,
                        entries = draft.len(),
                        "published"
                    );
                    return Ok(commit_id);
                }
                Err(RetryError::Permanent {
                    source: StoreError::Conflict(reason),
                    ..
                }) if attempt < attempts => {
                    warn!(ref_name, attempt, %reason, "ref moved during publish, rebuilding on new base");
                    state.advance(UploadEvent::Rebased)?;
                    base = self.resolve_base(TransferPhase::Committing).await?;
                }
                Err(e) => return Err(EngineError::from_retry(e, stage())),
            }
        }
    }

    pub fn check_cancelled(&self, stage: Stage) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled { stage });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkstash_store::{Fault, MemoryObjectStore, StoreOp};
    use chunkstash_transfer::ChunkRegion;

    fn committing() -> UploadState {
        UploadState::Committing(crate::state::PublishStep::Tree)
    }

    #[test]
    fn draft_rejects_duplicates_and_bad_paths() {
        let mut draft = TreeDraft::new();
        draft.add("a/b.txt", "h1").unwrap();
        assert!(matches!(
            draft.add("a/b.txt", "h2"),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(draft.add("../escape", "h3").is_err());
        assert!(draft.remove("a/b.txt").is_err());
        draft.remove("a/c.txt").unwrap();
        assert_eq!(draft.len(), 2);
        assert!(draft.entries()[1].is_removal());
    }

    #[test]
    fn draft_requires_stored_chunks() {
        let region = ChunkRegion {
            index: 0,
            offset: 0,
            length: 4,
        };
        let chunk = ChunkDescriptor::pending(&region, "x.part000.bin".into());
        assert!(matches!(
            TreeDraft::from_chunks(&[chunk]),
            Err(EngineError::Integrity { .. })
        ));
    }

    #[tokio::test]
    async fn publishes_on_base() {
        let store = MemoryObjectStore::new();
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let publisher = Publisher::new(&store, &config, &cancel);

        let base = publisher.resolve_base(TransferPhase::Planning).await.unwrap();
        let stage = Stage::new(TransferPhase::Uploading);
        let hash = publisher.store_object(b"data", stage).await.unwrap();
        let mut draft = TreeDraft::new();
        draft.add("files/data.bin", &hash).unwrap();

        let mut state = committing();
        let commit = publisher
            .publish(base, &draft, "Upload data.bin", &mut state, &ProgressSink::disabled())
            .await
            .unwrap();
        assert_eq!(store.head(&config.ref_name), Some(commit));
        assert!(state.is_published());
        assert_eq!(store.list_paths(&config.ref_name).unwrap(), vec!["files/data.bin"]);
    }

    #[tokio::test]
    async fn lost_race_is_rebuilt_on_new_base() {
        let store = MemoryObjectStore::new();
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let publisher = Publisher::new(&store, &config, &cancel);

        let base = publisher.resolve_base(TransferPhase::Planning).await.unwrap();
        let hash = publisher
            .store_object(b"ours", Stage::new(TransferPhase::Uploading))
            .await
            .unwrap();
        let mut draft = TreeDraft::new();
        draft.add("ours.txt", &hash).unwrap();

        store.race_next_update(&config.ref_name, vec![("theirs.txt".into(), b"t".to_vec())]);

        let mut state = committing();
        publisher
            .publish(base, &draft, "Upload ours.txt", &mut state, &ProgressSink::disabled())
            .await
            .unwrap();
        assert_eq!(
            store.list_paths(&config.ref_name).unwrap(),
            vec!["ours.txt", "theirs.txt"]
        );
        assert_eq!(store.calls(StoreOp::UpdateRef), 2);
    }

    #[tokio::test]
    async fn conflict_after_last_attempt_is_permanent() {
        let store = MemoryObjectStore::new();
        let config = EngineConfig {
            publish_attempts: 1,
            ..EngineConfig::default()
        };
        let cancel = CancellationToken::new();
        let publisher = Publisher::new(&store, &config, &cancel);

        let base = publisher.resolve_base(TransferPhase::Planning).await.unwrap();
        let hash = publisher
            .store_object(b"x", Stage::new(TransferPhase::Uploading))
            .await
            .unwrap();
        let mut draft = TreeDraft::new();
        draft.add("x", &hash).unwrap();
        store.race_next_update(&config.ref_name, vec![("y".into(), b"y".to_vec())]);

        let err = publisher
            .publish(base, &draft, "m", &mut committing(), &ProgressSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::PermanentRemote {
                source: StoreError::Conflict(_),
                ..
            }
        ));
        assert_eq!(store.list_paths(&config.ref_name).unwrap(), vec!["y"]);
    }

    #[tokio::test]
    async fn wrong_hash_from_store_is_integrity_error() {
        struct LyingStore(MemoryObjectStore);

        impl ObjectStore for LyingStore {
            fn create_content_object<'a>(
                &'a self,
                _data: &'a [u8],
            ) -> chunkstash_store::StoreFuture<'a, String> {
                Box::pin(async { Ok::<_, StoreError>("0000".to_string()) })
            }
            fn get_ref<'a>(&'a self, r: &'a str) -> chunkstash_store::StoreFuture<'a, String> {
                self.0.get_ref(r)
            }
            fn get_commit<'a>(
                &'a self,
                id: &'a str,
            ) -> chunkstash_store::StoreFuture<'a, chunkstash_store::CommitInfo> {
                self.0.get_commit(id)
            }
            fn create_tree<'a>(
                &'a self,
                base: &'a str,
                entries: &'a [TreeEntry],
            ) -> chunkstash_store::StoreFuture<'a, String> {
                self.0.create_tree(base, entries)
            }
            fn create_commit<'a>(
                &'a self,
                tree: &'a str,
                parent: &'a str,
                message: &'a str,
            ) -> chunkstash_store::StoreFuture<'a, String> {
                self.0.create_commit(tree, parent, message)
            }
            fn update_ref<'a>(
                &'a self,
                r: &'a str,
                commit: &'a str,
                expected: &'a str,
            ) -> chunkstash_store::StoreFuture<'a, ()> {
                self.0.update_ref(r, commit, expected)
            }
            fn fetch_object_by_hash<'a>(
                &'a self,
                hash: &'a str,
            ) -> chunkstash_store::StoreFuture<'a, Vec<u8>> {
                self.0.fetch_object_by_hash(hash)
            }
            fn fetch_object_by_path<'a>(
                &'a self,
                r: &'a str,
                path: &'a str,
            ) -> chunkstash_store::StoreFuture<'a, chunkstash_store::PathObject> {
                self.0.fetch_object_by_path(r, path)
            }
            fn content_hash(&self, data: &[u8]) -> Option<String> {
                self.0.content_hash(data)
            }
            fn backend_name(&self) -> &'static str {
                "lying"
            }
        }

        let store = LyingStore(MemoryObjectStore::new());
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let publisher = Publisher::new(&store, &config, &cancel);
        let err = publisher
            .store_object(b"abc", Stage::chunk(TransferPhase::Uploading, 0, "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Integrity { .. }));
    }

    #[tokio::test]
    async fn cancelled_publish_leaves_ref() {
        let store = MemoryObjectStore::new();
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let publisher = Publisher::new(&store, &config, &cancel);
        let base = publisher.resolve_base(TransferPhase::Planning).await.unwrap();
        let before = store.head(&config.ref_name);
        let hash = publisher
            .store_object(b"x", Stage::new(TransferPhase::Uploading))
            .await
            .unwrap();
        let mut draft = TreeDraft::new();
        draft.add("x", &hash).unwrap();

        cancel.cancel();
        let err = publisher
            .publish(base, &draft, "m", &mut committing(), &ProgressSink::disabled())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(store.head(&config.ref_name), before);
        assert_eq!(store.calls(StoreOp::UpdateRef), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_ref_failure_is_retried() {
        let store = MemoryObjectStore::new();
        store.inject(Fault::transient(StoreOp::UpdateRef).times(1));
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let publisher = Publisher::new(&store, &config, &cancel);
        let base = publisher.resolve_base(TransferPhase::Planning).await.unwrap();
        let hash = publisher
            .store_object(b"x", Stage::new(TransferPhase::Uploading))
            .await
            .unwrap();
        let mut draft = TreeDraft::new();
        draft.add("x", &hash).unwrap();

        publisher
            .publish(base, &draft, "m", &mut committing(), &ProgressSink::disabled())
            .await
            .unwrap();
        assert_eq!(store.calls(StoreOp::UpdateRef), 2);
        assert_eq!(store.list_paths(&config.ref_name).unwrap(), vec!["x"]);
    }
}
