//! Reassembly of a chunked file from its manifest.

use std::path::{Path, PathBuf};

use chunkstash_store::{ObjectStore, RetryError, StoreError};
use chunkstash_transfer::{ChunkDescriptor, ProgressSink, TransferPhase, UploadManifest};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Stage};

/// Fetches every chunk of a manifest in index order and verifies the result.
///
/// Chunks are resolved by content hash when the manifest has one and by
/// path otherwise. A path-resolved chunk is only accepted if its bytes
/// hash to what the path lookup reported (when the store can hash
/// locally). Every chunk must match its recorded size unless the manifest
/// only has estimated sizes, in which case the reassembled total is the
/// check. No partial output is ever returned.
pub struct ChunkedDownloadCoordinator<'a> {
    store: &'a dyn ObjectStore,
    config: &'a EngineConfig,
    cancel: CancellationToken,
}

impl<'a> ChunkedDownloadCoordinator<'a> {
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

    /// Downloads the whole file into memory.
    ///
    /// Progress: chunk `i` of `n` at `100*(i+1)/n`, then merging and done.
    pub async fn download(
        &self,
        manifest: &UploadManifest,
        progress: &ProgressSink,
    ) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::new();
        let result = self.collect(manifest, &mut out, progress).await;
        self.finish(manifest, result, progress)?;
        Ok(out)
    }

    /// Downloads into `dest`, writing through a sibling temp file that is
    /// renamed into place only once the whole file has been verified.
    pub async fn download_to_path(
        &self,
        manifest: &UploadManifest,
        dest: &Path,
        progress: &ProgressSink,
    ) -> Result<u64, EngineError> {
        let tmp = temp_path(dest);
        let result = self.write_file(manifest, &tmp, progress).await;
        match self.finish(manifest, result, progress) {
            Ok(()) => {
                tokio::fs::rename(&tmp, dest).await?;
                Ok(manifest.total_size)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    fn begin(&self, manifest: &UploadManifest, progress: &ProgressSink) -> Result<(), EngineError> {
        manifest
            .validate()
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        progress.emit(TransferPhase::Downloading, 0.0);
        Ok(())
    }

    async fn collect(
        &self,
        manifest: &UploadManifest,
        out: &mut Vec<u8>,
        progress: &ProgressSink,
    ) -> Result<u64, EngineError> {
        self.begin(manifest, progress)?;
        for (index, chunk) in manifest.chunks.iter().enumerate() {
            let data = self.fetch_checked(manifest, chunk, index).await?;
            out.extend_from_slice(&data);
            self.report_chunk(index, manifest.chunk_count, progress);
        }
        Ok(out.len() as u64)
    }

    async fn write_file(
        &self,
        manifest: &UploadManifest,
        tmp: &Path,
        progress: &ProgressSink,
    ) -> Result<u64, EngineError> {
        self.begin(manifest, progress)?;
        let file = tokio::fs::File::create(tmp).await?;
        let mut writer = tokio::io::BufWriter::new(file);
        let mut written = 0u64;
        for (index, chunk) in manifest.chunks.iter().enumerate() {
            let data = self.fetch_checked(manifest, chunk, index).await?;
            writer.write_all(&data).await?;
            written += data.len() as u64;
            self.report_chunk(index, manifest.chunk_count, progress);
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(written)
    }

    fn report_chunk(&self, index: usize, count: usize, progress: &ProgressSink) {
        progress.emit(
            TransferPhase::Downloading,
            100.0 * (index + 1) as f64 / count as f64,
        );
    }

    /// Final size check, logging and progress for both download paths.
    fn finish(
        &self,
        manifest: &UploadManifest,
        result: Result<u64, EngineError>,
        progress: &ProgressSink,
    ) -> Result<(), EngineError> {
        let checked = result.and_then(|written| {
            progress.emit(TransferPhase::Merging, 100.0);
            if written != manifest.total_size {
                return Err(EngineError::Integrity {
                    stage: Stage::new(TransferPhase::Merging).with_path(&manifest.path),
                    reason: format!(
                        "reassembled {written} bytes, manifest says {}",
                        manifest.total_size
                    ),
                });
            }
            Ok(())
        });

        match &checked {
            Ok(()) => {
                progress.emit(TransferPhase::Done, 100.0);
                info!(
                    file = %manifest.original_name,
                    size = manifest.total_size,
                    chunks = manifest.chunk_count,
                    "download complete"
                );
            }
            Err(e) => {
                error!(
                    file = %manifest.original_name,
                    stage = ?e.stage(),
                    error = %e,
                    "download aborted"
                );
            }
        }
        checked
    }

    async fn fetch_checked(
        &self,
        manifest: &UploadManifest,
        chunk: &ChunkDescriptor,
        index: usize,
    ) -> Result<Vec<u8>, EngineError> {
        let stage = Stage::chunk(TransferPhase::Downloading, index, &chunk.path);
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled { stage });
        }

        let retry = &self.config.retry;
        let data = match chunk.content_hash.as_deref() {
            Some(hash) => {
                let data = retry
                    .run(&self.cancel, "fetch_object_by_hash", || {
                        self.store.fetch_object_by_hash(hash)
                    })
                    .await
                    .map_err(|e| fetch_error(e, stage.clone()))?;
                if let Some(actual) = self.store.content_hash(&data)
                    && actual != hash
                {
                    return Err(EngineError::Integrity {
                        stage,
                        reason: format!("content hashes to {actual}, expected {hash}"),
                    });
                }
                data
            }
            None => {
                warn!(index, path = %chunk.path, "no recorded hash, resolving chunk by path");
                let ref_name = self.config.ref_name.as_str();
                let object = retry
                    .run(&self.cancel, "fetch_object_by_path", || {
                        self.store.fetch_object_by_path(ref_name, &chunk.path)
                    })
                    .await
                    .map_err(|e| fetch_error(e, stage.clone()))?;
                if let Some(actual) = self.store.content_hash(&object.data)
                    && actual != object.hash
                {
                    return Err(EngineError::Integrity {
                        stage,
                        reason: format!(
                            "path content hashes to {actual}, store reported {}",
                            object.hash
                        ),
                    });
                }
                object.data
            }
        };

        if !manifest.estimated_sizes && data.len() as u64 != chunk.size {
            return Err(EngineError::Integrity {
                stage,
                reason: format!("got {} bytes, expected {}", data.len(), chunk.size),
            });
        }
        debug!(index, path = %chunk.path, size = chunk.size, "chunk fetched");
        Ok(data)
    }
}

/// A missing chunk is an integrity failure, not just a remote error.
fn fetch_error(err: RetryError, stage: Stage) -> EngineError {
    match err {
        RetryError::Permanent {
            source: StoreError::NotFound(what),
            ..
        } => EngineError::Integrity {
            stage,
            reason: format!("chunk missing: {what}"),
        },
        other => EngineError::from_retry(other, stage),
    }
}

fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".chunkstash-partial");
    dest.with_file_name(name)
}
