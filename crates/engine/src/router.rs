//! Dispatches a batch to the chunk-capable store or a flat backend.
//!
//! The target is chosen once per batch. Both paths return the same
//! [`FileRecord`] shape so the metadata store does not care which one ran,
//! and [`StorageRouter::delete`] takes that record back to the backend it
//! names.

use chunkstash_store::ObjectStore;
use chunkstash_transfer::{
    ChunkRegion, FileRecord, ProgressSink, StorageTarget, TransferPhase, validate_object_path,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::batch::{BatchUploadCoordinator, SizedRequest, prepare, shares};
use crate::config::EngineConfig;
use crate::error::{EngineError, Stage};
use crate::flat::FlatBackend;
use crate::publish::{Publisher, TreeDraft};
use crate::state::{PublishStep, UploadState};
use crate::upload::{UploadRequest, open_reader, read_region};

/// Outcome of one routed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub target: StorageTarget,
    /// One record per input file, in input order.
    pub records: Vec<FileRecord>,
    /// Commits published, oldest first. Empty for flat batches.
    pub commits: Vec<String>,
}

/// Outcome of one deleted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    pub target: StorageTarget,
    /// Every stored path that was removed.
    pub paths: Vec<String>,
    /// Commit that dropped the paths. `None` for flat records.
    pub commit: Option<String>,
}

pub struct StorageRouter<'a> {
    store: &'a dyn ObjectStore,
    flat: Option<&'a dyn FlatBackend>,
    config: &'a EngineConfig,
    cancel: CancellationToken,
}

impl<'a> StorageRouter<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        config: &'a EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            flat: None,
            config,
            cancel,
        }
    }

    /// Enables [`StorageTarget::Flat`] batches.
    pub fn with_flat(mut self, flat: &'a dyn FlatBackend) -> Self {
        self.flat = Some(flat);
        self
    }

    /// Uploads `files` to `target`.
    ///
    /// Every file is sized before anything is sent; if any exceeds
    /// `max_file_size` the whole batch is rejected with one error naming
    /// each offender.
    pub async fn route(
        &self,
        files: Vec<UploadRequest>,
        target: StorageTarget,
        progress: &ProgressSink,
    ) -> Result<BatchResult, EngineError> {
        self.config.validate()?;
        info!(files = files.len(), %target, "routing batch");

        let result = match target {
            StorageTarget::ChunkCapable => self.route_chunked(&files, progress).await,
            StorageTarget::Flat => self.route_flat(&files, progress).await,
        };
        if let Err(e) = &result {
            error!(%target, stage = ?e.stage(), error = %e, "batch aborted");
        }
        result
    }

    /// Deletes the objects behind `record` from the backend it was stored on.
    ///
    /// Chunk-capable records lose every chunk path in one tree, commit and
    /// guarded ref update, so readers see either the whole file or none of
    /// it. If any path is already missing, nothing is removed.
    pub async fn delete(&self, record: &FileRecord) -> Result<DeleteResult, EngineError> {
        self.config.validate()?;
        info!(path = %record.file_path, target = %record.storage_type, "deleting");

        let result = match record.storage_type {
            StorageTarget::ChunkCapable => self.delete_chunked(record).await,
            StorageTarget::Flat => self.delete_flat(record).await,
        };
        match &result {
            Ok(deleted) => info!(
                path = %record.file_path,
                objects = deleted.paths.len(),
                commit = deleted.commit.as_deref().unwrap_or("-"),
                "deleted"
            ),
            Err(e) => error!(
                path = %record.file_path,
                stage = ?e.stage(),
                error = %e,
                "delete aborted"
            ),
        }
        result
    }

    async fn delete_chunked(&self, record: &FileRecord) -> Result<DeleteResult, EngineError> {
        let paths = if record.chunk_paths.is_empty() {
            vec![record.file_path.clone()]
        } else {
            record.chunk_paths.clone()
        };
        let mut draft = TreeDraft::new();
        for path in &paths {
            draft.remove(path)?;
        }

        let publisher = Publisher::new(self.store, self.config, &self.cancel);
        let base = publisher.resolve_base(TransferPhase::Committing).await?;
        let mut state = UploadState::Committing(PublishStep::Tree);
        let message = delete_message(&record.file_path, record.is_chunked, paths.len());
        let commit = publisher
            .publish(base, &draft, &message, &mut state, &ProgressSink::disabled())
            .await?;

        Ok(DeleteResult {
            target: StorageTarget::ChunkCapable,
            paths,
            commit: Some(commit),
        })
    }

    async fn delete_flat(&self, record: &FileRecord) -> Result<DeleteResult, EngineError> {
        let flat = self.flat_backend()?;
        let path = record.file_path.as_str();
        validate_object_path(path)?;

        let stage = Stage::new(TransferPhase::Committing).with_path(path);
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled { stage });
        }
        self.config
            .retry
            .run(&self.cancel, "delete", || flat.delete(path))
            .await
            .map_err(|e| EngineError::from_retry(e, stage))?;

        Ok(DeleteResult {
            target: StorageTarget::Flat,
            paths: vec![path.to_string()],
            commit: None,
        })
    }

    fn flat_backend(&self) -> Result<&'a dyn FlatBackend, EngineError> {
        self.flat
            .ok_or_else(|| EngineError::InvalidInput("no flat backend is configured".into()))
    }

    async fn route_chunked(
        &self,
        files: &[UploadRequest],
        progress: &ProgressSink,
    ) -> Result<BatchResult, EngineError> {
        let batch = BatchUploadCoordinator::new(self.store, self.config, self.cancel.clone());
        let manifests = batch.upload_batch(files, progress).await?;

        let mut commits: Vec<String> = Vec::new();
        for manifest in &manifests {
            if !commits.contains(&manifest.commit_id) {
                commits.push(manifest.commit_id.clone());
            }
        }
        let records = manifests
            .iter()
            .map(|m| {
                let chunked = m.chunk_count > 1;
                let mut record = m.to_record(chunked);
                if !chunked {
                    record.public_url = self.config.public_url(&m.path);
                }
                record
            })
            .collect();

        Ok(BatchResult {
            target: StorageTarget::ChunkCapable,
            records,
            commits,
        })
    }

    async fn route_flat(
        &self,
        files: &[UploadRequest],
        progress: &ProgressSink,
    ) -> Result<BatchResult, EngineError> {
        let flat = self.flat_backend()?;

        progress.emit(TransferPhase::Planning, 0.0);
        let sized = prepare(files, self.config.max_file_size).await?;
        let weights = shares(&sized.iter().map(|s| s.size).collect::<Vec<_>>());

        let mut records = Vec::with_capacity(sized.len());
        let mut done = 0.0;
        for (entry, weight) in sized.iter().zip(weights) {
            records.push(self.upload_flat(flat, entry).await?);
            done += weight;
            progress.emit(TransferPhase::Uploading, done);
        }

        progress.emit(TransferPhase::Done, 100.0);
        Ok(BatchResult {
            target: StorageTarget::Flat,
            records,
            commits: Vec::new(),
        })
    }

    async fn upload_flat(
        &self,
        flat: &dyn FlatBackend,
        entry: &SizedRequest,
    ) -> Result<FileRecord, EngineError> {
        let stage = Stage::chunk(TransferPhase::Uploading, entry.position, &entry.destination);
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled { stage });
        }

        let region = ChunkRegion {
            index: 0,
            offset: 0,
            length: entry.size,
        };
        let reader = open_reader(&entry.request.source).await?;
        let (_, data) = read_region(reader, region, stage.clone()).await?;

        let mime_type = entry.request.mime_type.as_str();
        let object = self
            .config
            .retry
            .run(&self.cancel, "upload_whole", || {
                flat.upload_whole(&data, &entry.destination, mime_type)
            })
            .await
            .map_err(|e| EngineError::from_retry(e, stage))?;

        info!(
            file = %entry.request.original_name,
            path = %object.path,
            backend = flat.backend_name(),
            "flat upload complete"
        );
        Ok(FileRecord {
            original_name: entry.request.original_name.clone(),
            file_path: object.path,
            file_size: entry.size,
            mime_type: entry.request.mime_type.clone(),
            storage_type: StorageTarget::Flat,
            is_chunked: false,
            chunk_count: 0,
            chunk_size: None,
            chunk_paths: Vec::new(),
            chunk_shas: None,
            commit_sha: None,
            public_url: Some(object.public_url),
        })
    }
}

fn delete_message(path: &str, chunked: bool, parts: usize) -> String {
    if chunked {
        format!("Delete chunked file: {path} ({parts} parts)")
    } else {
        format!("Delete {path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flat::MemoryFlatBackend;
    use chunkstash_store::{Fault, MemoryObjectStore, StoreOp};

    fn config() -> EngineConfig {
        EngineConfig {
            chunk_size: 4,
            direct_write_limit: 8,
            max_file_size: 32,
            ..EngineConfig::default()
        }
    }

    fn file(name: &str, len: usize) -> UploadRequest {
        UploadRequest::new(vec![7u8; len], name, "application/octet-stream")
            .with_destination(format!("files/{name}"))
    }

    #[tokio::test]
    async fn chunk_capable_records_are_normalized() {
        let store = MemoryObjectStore::new();
        let config = config();
        let router = StorageRouter::new(&store, &config, CancellationToken::new());

        let result = router
            .route(
                vec![file("a.bin", 3), file("big.bin", 10), file("b.bin", 2)],
                StorageTarget::ChunkCapable,
                &ProgressSink::disabled(),
            )
            .await
            .unwrap();

        assert_eq!(result.target, StorageTarget::ChunkCapable);
        assert_eq!(result.commits.len(), 2);
        let [a, big, b] = result.records.as_slice() else {
            panic!("expected three records");
        };
        assert!(!a.is_chunked);
        assert_eq!(a.chunk_count, 1);
        assert_eq!(a.chunk_paths, vec!["files/a.bin"]);
        assert_eq!(a.commit_sha, b.commit_sha);
        assert!(big.is_chunked);
        assert_eq!(big.chunk_count, 3);
        assert_eq!(big.chunk_shas.as_ref().map(Vec::len), Some(3));
        assert_eq!(big.commit_sha.as_deref(), Some(result.commits[1].as_str()));
        assert_eq!(a.public_url, None);
    }

    #[tokio::test]
    async fn unchunked_records_get_public_urls() {
        let store = MemoryObjectStore::new();
        let config = EngineConfig {
            public_base_url: Some("https://cdn.example.com/vault".into()),
            ..config()
        };
        let router = StorageRouter::new(&store, &config, CancellationToken::new());

        let result = router
            .route(
                vec![file("a.bin", 3), file("big.bin", 10)],
                StorageTarget::ChunkCapable,
                &ProgressSink::disabled(),
            )
            .await
            .unwrap();
        assert_eq!(
            result.records[0].public_url.as_deref(),
            Some("https://cdn.example.com/vault/files/a.bin")
        );
        assert_eq!(result.records[1].public_url, None);
    }

    async fn stored(store: &MemoryObjectStore, config: &EngineConfig) -> (FileRecord, FileRecord) {
        let router = StorageRouter::new(store, config, CancellationToken::new());
        let result = router
            .route(
                vec![file("keep.bin", 3), file("big.bin", 10)],
                StorageTarget::ChunkCapable,
                &ProgressSink::disabled(),
            )
            .await
            .unwrap();
        let [keep, big] = result.records.as_slice() else {
            panic!("expected two records");
        };
        (keep.clone(), big.clone())
    }

    #[tokio::test]
    async fn delete_drops_every_chunk_in_one_commit() {
        let store = MemoryObjectStore::new();
        let config = config();
        let (keep, big) = stored(&store, &config).await;
        let commits_before = store.calls(StoreOp::CreateCommit);

        let router = StorageRouter::new(&store, &config, CancellationToken::new());
        let deleted = router.delete(&big).await.unwrap();

        assert_eq!(deleted.target, StorageTarget::ChunkCapable);
        assert_eq!(deleted.paths, big.chunk_paths);
        assert_eq!(store.head(&config.ref_name), deleted.commit);
        assert_eq!(store.calls(StoreOp::CreateCommit), commits_before + 1);
        assert_eq!(store.list_paths(&config.ref_name).unwrap(), keep.chunk_paths);
    }

    #[tokio::test]
    async fn failed_delete_leaves_every_chunk_visible() {
        let store = MemoryObjectStore::new();
        let config = config();
        let (_, big) = stored(&store, &config).await;
        let before = store.head(&config.ref_name);
        store.inject(Fault::permanent(StoreOp::UpdateRef));

        let router = StorageRouter::new(&store, &config, CancellationToken::new());
        let err = router.delete(&big).await.unwrap_err();
        assert!(matches!(err, EngineError::PermanentRemote { .. }));
        assert_eq!(store.head(&config.ref_name), before);
        let visible = store.list_paths(&config.ref_name).unwrap();
        assert!(big.chunk_paths.iter().all(|p| visible.contains(p)));
    }

    #[tokio::test]
    async fn delete_with_a_missing_chunk_removes_nothing() {
        let store = MemoryObjectStore::new();
        let config = config();
        let (keep, mut big) = stored(&store, &config).await;
        big.chunk_paths[1] = keep.file_path.replace("keep", "never");

        let router = StorageRouter::new(&store, &config, CancellationToken::new());
        assert!(router.delete(&big).await.is_err());
        let visible = store.list_paths(&config.ref_name).unwrap();
        assert_eq!(visible.len(), 4);
        assert!(visible.contains(&big.chunk_paths[0]));
    }

    #[tokio::test]
    async fn delete_of_small_file_uses_its_path() {
        let store = MemoryObjectStore::new();
        let config = config();
        let (mut keep, big) = stored(&store, &config).await;
        keep.chunk_paths.clear();

        let router = StorageRouter::new(&store, &config, CancellationToken::new());
        let deleted = router.delete(&keep).await.unwrap();
        assert_eq!(deleted.paths, vec![keep.file_path.clone()]);
        assert_eq!(store.list_paths(&config.ref_name).unwrap(), big.chunk_paths);
    }

    #[tokio::test]
    async fn flat_delete_goes_to_the_flat_backend() {
        let store = MemoryObjectStore::new();
        let flat = MemoryFlatBackend::default();
        let config = config();
        let router =
            StorageRouter::new(&store, &config, CancellationToken::new()).with_flat(&flat);
        let result = router
            .route(vec![file("a.bin", 5)], StorageTarget::Flat, &ProgressSink::disabled())
            .await
            .unwrap();

        let deleted = router.delete(&result.records[0]).await.unwrap();
        assert_eq!(deleted.target, StorageTarget::Flat);
        assert_eq!(deleted.commit, None);
        assert!(flat.paths().is_empty());
        assert_eq!(store.calls(StoreOp::GetRef), 0);

        let without_flat = StorageRouter::new(&store, &config, CancellationToken::new());
        assert!(matches!(
            without_flat.delete(&result.records[0]).await,
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn delete_messages() {
        assert_eq!(delete_message("files/a.bin", false, 1), "Delete files/a.bin");
        assert_eq!(
            delete_message("files/b.bin", true, 3),
            "Delete chunked file: files/b.bin (3 parts)"
        );
    }

    #[tokio::test]
    async fn flat_target_never_chunks() {
        let store = MemoryObjectStore::new();
        let flat = MemoryFlatBackend::default();
        let config = config();
        let router =
            StorageRouter::new(&store, &config, CancellationToken::new()).with_flat(&flat);

        let result = router
            .route(
                vec![file("big.bin", 30), file("a.bin", 1)],
                StorageTarget::Flat,
                &ProgressSink::disabled(),
            )
            .await
            .unwrap();

        assert!(result.commits.is_empty());
        assert_eq!(result.records.len(), 2);
        let big = &result.records[0];
        assert_eq!(big.storage_type, StorageTarget::Flat);
        assert!(!big.is_chunked);
        assert_eq!(big.public_url.as_deref(), Some("memory://flat/files/big.bin"));
        assert_eq!(flat.get("files/big.bin").unwrap().0.len(), 30);
        assert_eq!(store.calls(StoreOp::GetRef), 0);
    }

    #[tokio::test]
    async fn flat_target_requires_backend() {
        let store = MemoryObjectStore::new();
        let config = config();
        let router = StorageRouter::new(&store, &config, CancellationToken::new());
        let err = router
            .route(vec![file("a.bin", 1)], StorageTarget::Flat, &ProgressSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn oversized_files_abort_before_any_upload() {
        let store = MemoryObjectStore::new();
        let flat = MemoryFlatBackend::default();
        let config = config();
        let router =
            StorageRouter::new(&store, &config, CancellationToken::new()).with_flat(&flat);

        for target in [StorageTarget::ChunkCapable, StorageTarget::Flat] {
            let err = router
                .route(
                    vec![file("a.bin", 1), file("huge.bin", 33)],
                    target,
                    &ProgressSink::disabled(),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::FilesTooLarge { limit: 32, .. }));
        }
        assert!(flat.paths().is_empty());
        assert_eq!(store.calls(StoreOp::CreateContentObject), 0);
    }

    #[tokio::test]
    async fn empty_batch_is_invalid() {
        let store = MemoryObjectStore::new();
        let config = config();
        let router = StorageRouter::new(&store, &config, CancellationToken::new());
        let err = router
            .route(Vec::new(), StorageTarget::ChunkCapable, &ProgressSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let store = MemoryObjectStore::new();
        let config = EngineConfig {
            chunk_size: 0,
            ..EngineConfig::default()
        };
        let router = StorageRouter::new(&store, &config, CancellationToken::new());
        let err = router
            .route(vec![file("a.bin", 1)], StorageTarget::ChunkCapable, &ProgressSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn permanent_remote_failure_surfaces_once() {
        let store = MemoryObjectStore::new();
        store.inject(Fault::permanent(StoreOp::UpdateRef));
        let config = config();
        let router = StorageRouter::new(&store, &config, CancellationToken::new());
        let err = router
            .route(vec![file("a.bin", 2)], StorageTarget::ChunkCapable, &ProgressSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PermanentRemote { .. }));
        assert!(store.list_paths(&config.ref_name).unwrap().is_empty());
    }
}
