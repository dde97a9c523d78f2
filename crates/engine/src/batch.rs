//! Batch uploads to the chunk-capable store.
//!
//! Small files (at or below the direct-write limit) share one tree and one
//! commit. Large files each go through [`ChunkedUploadCoordinator`] and get
//! their own commit. Files are processed one after another so no two
//! publishes in a batch race for the same ref.

use std::collections::HashSet;

use chunkstash_store::ObjectStore;
use chunkstash_transfer::{
    ChunkDescriptor, ChunkRegion, ProgressSink, TransferPhase, UploadManifest,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EngineError, OversizedFile, Stage};
use crate::publish::{Publisher, TreeDraft};
use crate::state::{UploadEvent, UploadState};
use crate::upload::{
    ChunkedUploadCoordinator, UploadRequest, open_reader, read_region, source_len,
    upload_message,
};

/// A request with its size and destination resolved.
#[derive(Debug, Clone)]
pub(crate) struct SizedRequest {
    pub position: usize,
    pub request: UploadRequest,
    pub size: u64,
    pub destination: String,
}

/// Resolves sizes and destinations for every file, rejecting the whole
/// batch if any file is over `max_file_size` or two files share a path.
pub(crate) async fn prepare(
    requests: &[UploadRequest],
    max_file_size: u64,
) -> Result<Vec<SizedRequest>, EngineError> {
    if requests.is_empty() {
        return Err(EngineError::InvalidInput("no files to upload".into()));
    }

    let mut sized = Vec::with_capacity(requests.len());
    let mut oversized = Vec::new();
    for (position, request) in requests.iter().enumerate() {
        let size = source_len(&request.source).await?;
        if size > max_file_size {
            oversized.push(OversizedFile {
                name: request.original_name.clone(),
                size,
            });
            continue;
        }
        let destination = request.resolve_destination()?;
        sized.push(SizedRequest {
            position,
            request: request.clone().with_destination(destination.clone()),
            size,
            destination,
        });
    }

    if !oversized.is_empty() {
        return Err(EngineError::FilesTooLarge {
            limit: max_file_size,
            files: oversized,
        });
    }

    let mut seen = HashSet::new();
    if let Some(dup) = sized.iter().find(|s| !seen.insert(s.destination.as_str())) {
        return Err(EngineError::InvalidInput(format!(
            "more than one file targets {}",
            dup.destination
        )));
    }
    Ok(sized)
}

/// Percentage share of each file in a batch, weighted by size.
pub(crate) fn shares(sizes: &[u64]) -> Vec<f64> {
    let total: u64 = sizes.iter().sum();
    if total == 0 {
        let even = 100.0 / sizes.len().max(1) as f64;
        return vec![even; sizes.len()];
    }
    sizes
        .iter()
        .map(|&s| 100.0 * s as f64 / total as f64)
        .collect()
}

/// Uploads many files to the chunk-capable store.
pub struct BatchUploadCoordinator<'a> {
    store: &'a dyn ObjectStore,
    config: &'a EngineConfig,
    cancel: CancellationToken,
}

impl<'a> BatchUploadCoordinator<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        config: &'a EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            cancel,
        }
    }

    /// Uploads every request and returns one manifest per file, in input
    /// order. Small files share a commit id.
    pub async fn upload_batch(
        &self,
        requests: &[UploadRequest],
        progress: &ProgressSink,
    ) -> Result<Vec<UploadManifest>, EngineError> {
        progress.emit(TransferPhase::Planning, 0.0);
        let sized = prepare(requests, self.config.max_file_size).await?;
        let weights = shares(&sized.iter().map(|s| s.size).collect::<Vec<_>>());

        let (small, large): (Vec<_>, Vec<_>) = sized
            .iter()
            .zip(&weights)
            .partition(|(s, _)| s.size <= self.config.direct_write_limit);

        info!(
            files = sized.len(),
            small = small.len(),
            large = large.len(),
            backend = self.store.backend_name(),
            "batch planned"
        );

        let mut results: Vec<Option<UploadManifest>> = vec![None; sized.len()];
        let mut start = 0.0;

        if !small.is_empty() {
            let group: Vec<&SizedRequest> = small.iter().map(|(s, _)| *s).collect();
            let share: f64 = small.iter().map(|(_, w)| **w).sum();
            let manifests = self
                .upload_small(&group, &progress.scoped(start, share))
                .await?;
            for (entry, manifest) in group.iter().zip(manifests) {
                results[entry.position] = Some(manifest);
            }
            start += share;
        }

        let chunked = ChunkedUploadCoordinator::new(self.store, self.config, self.cancel.clone());
        for (entry, share) in large {
            let manifest = chunked
                .upload(&entry.request, &progress.scoped(start, *share))
                .await?;
            results[entry.position] = Some(manifest);
            start += share;
        }

        progress.emit(TransferPhase::Done, 100.0);
        Ok(results.into_iter().flatten().collect())
    }

    /// Stores each small file as one object and publishes them together.
    async fn upload_small(
        &self,
        group: &[&SizedRequest],
        progress: &ProgressSink,
    ) -> Result<Vec<UploadManifest>, EngineError> {
        let publisher = Publisher::new(self.store, self.config, &self.cancel);
        let mut state = UploadState::Planning;
        state.advance(UploadEvent::Planned {
            objects: group.len(),
        })?;

        progress.emit(TransferPhase::Planning, 0.0);
        publisher.check_cancelled(Stage::new(TransferPhase::Planning))?;
        let base = publisher.resolve_base(TransferPhase::Planning).await?;
        progress.emit(TransferPhase::Uploading, 10.0);

        let weights = shares(&group.iter().map(|s| s.size).collect::<Vec<_>>());
        let mut done = 0.0;
        let mut draft = TreeDraft::new();
        let mut stored = Vec::with_capacity(group.len());

        for (index, (entry, weight)) in group.iter().zip(weights).enumerate() {
            let stage = Stage::chunk(TransferPhase::Uploading, index, &entry.destination);
            publisher.check_cancelled(stage.clone())?;

            let region = ChunkRegion {
                index: 0,
                offset: 0,
                length: entry.size,
            };
            let reader = open_reader(&entry.request.source).await?;
            if reader.source_size() != entry.size {
                return Err(EngineError::Integrity {
                    stage,
                    reason: format!(
                        "source changed size: planned {} bytes, found {}",
                        entry.size,
                        reader.source_size()
                    ),
                });
            }
            let (_, data) = read_region(reader, region, stage.clone()).await?;

            let mut chunk = ChunkDescriptor::pending(&region, entry.destination.clone());
            let hash = publisher.store_object(&data, stage).await?;
            debug!(file = %entry.request.original_name, path = %chunk.path, hash = %hash, "file stored");
            draft.add(&chunk.path, &hash)?;
            chunk.record_hash(hash);
            stored.push(chunk);

            state.advance(UploadEvent::ObjectStored { index })?;
            done += weight;
            progress.emit(TransferPhase::Uploading, 10.0 + 0.7 * done);
        }

        let message = match group {
            [only] => upload_message(&only.request.original_name, 1),
            _ => format!("Upload {} files", group.len()),
        };
        let commit_id = publisher
            .publish(base, &draft, &message, &mut state, progress)
            .await?;

        let manifests = group
            .iter()
            .zip(stored)
            .map(|(entry, chunk)| UploadManifest {
                original_name: entry.request.original_name.clone(),
                path: entry.destination.clone(),
                mime_type: entry.request.mime_type.clone(),
                total_size: entry.size,
                chunk_count: 1,
                chunks: vec![chunk],
                commit_id: commit_id.clone(),
                estimated_sizes: false,
            })
            .collect();

        progress.emit(TransferPhase::Done, 100.0);
        info!(files = group.len(), commit = %commit_id, "small files published");
        Ok(manifests)
    }
}
