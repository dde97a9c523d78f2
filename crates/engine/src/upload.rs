//! Chunked upload of a single file.

use chunkstash_store::ObjectStore;
use chunkstash_transfer::{
    ChunkDescriptor, ChunkReader, FileSource, ProgressSink, ReadSeek, TransferPhase,
    UploadManifest, chunk_path, destination_path, plan, validate_object_path,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{EngineConfig, validate_chunk_size};
use crate::error::{EngineError, OversizedFile, Stage, join_error};
use crate::publish::{Publisher, TreeDraft};
use crate::state::{UploadEvent, UploadState};

/// One file to upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub source: FileSource,
    pub original_name: String,
    pub mime_type: String,
    /// Destination path; derived from the name and MIME type when unset.
    pub destination: Option<String>,
}

impl UploadRequest {
    pub fn new(
        source: impl Into<FileSource>,
        original_name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            original_name: original_name.into(),
            mime_type: mime_type.into(),
            destination: None,
        }
    }

    pub fn with_destination(mut self, path: impl Into<String>) -> Self {
        self.destination = Some(path.into());
        self
    }

    /// The explicit destination, or a freshly generated one.
    pub(crate) fn resolve_destination(&self) -> Result<String, EngineError> {
        let path = match &self.destination {
            Some(path) => path.clone(),
            None => destination_path(&self.original_name, &self.mime_type),
        };
        validate_object_path(&path)?;
        Ok(path)
    }
}

/// Size of `source`, read off the async runtime.
pub(crate) async fn source_len(source: &FileSource) -> Result<u64, EngineError> {
    let source = source.clone();
    Ok(tokio::task::spawn_blocking(move || source.len())
        .await
        .map_err(join_error)??)
}

/// Opens `source` for chunked reads off the async runtime.
pub(crate) async fn open_reader(
    source: &FileSource,
) -> Result<ChunkReader<Box<dyn ReadSeek>>, EngineError> {
    let source = source.clone();
    Ok(
        tokio::task::spawn_blocking(move || ChunkReader::new(source.open()?))
            .await
            .map_err(join_error)??,
    )
}

/// Reads one region on the blocking pool, handing the reader back.
pub(crate) async fn read_region(
    reader: ChunkReader<Box<dyn ReadSeek>>,
    region: chunkstash_transfer::ChunkRegion,
    stage: Stage,
) -> Result<(ChunkReader<Box<dyn ReadSeek>>, Vec<u8>), EngineError> {
    let (reader, data) = tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let data = reader.read_region(&region);
        (reader, data)
    })
    .await
    .map_err(join_error)?;
    let data = data.map_err(|source| EngineError::Read { stage, source })?;
    Ok((reader, data))
}

/// Commit message for a file stored as `parts` objects.
pub(crate) fn upload_message(original_name: &str, parts: usize) -> String {
    if parts > 1 {
        format!("Upload chunked file: {original_name} ({parts} parts)")
    } else {
        format!("Upload {original_name}")
    }
}

/// Uploads one file as ordered chunks and publishes them in one commit.
///
/// Chunks are sent strictly in index order. Nothing is visible through the
/// ref until the final ref update succeeds; a failure at any earlier point
/// leaves only unreferenced content objects behind.
pub struct ChunkedUploadCoordinator<'a> {
    store: &'a dyn ObjectStore,
    config: &'a EngineConfig,
    cancel: CancellationToken,
}

impl<'a> ChunkedUploadCoordinator<'a> {
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

    /// Uploads with the configured chunk size.
    pub async fn upload(
        &self,
        request: &UploadRequest,
        progress: &ProgressSink,
    ) -> Result<UploadManifest, EngineError> {
        self.upload_with_chunk_size(request, self.config.chunk_size, progress)
            .await
    }

    /// Uploads `request` in `chunk_size`-byte chunks.
    ///
    /// Progress: planning at 0, chunk `i` of `n` at `10 + 70*(i+1)/n`, the
    /// publish steps at 80/85/90 and done at 100.
    pub async fn upload_with_chunk_size(
        &self,
        request: &UploadRequest,
        chunk_size: u64,
        progress: &ProgressSink,
    ) -> Result<UploadManifest, EngineError> {
        let result = self.run(request, chunk_size, progress).await;
        if let Err(e) = &result {
            error!(
                file = %request.original_name,
                stage = ?e.stage(),
                error = %e,
                "upload aborted"
            );
        }
        result
    }

    async fn run(
        &self,
        request: &UploadRequest,
        chunk_size: u64,
        progress: &ProgressSink,
    ) -> Result<UploadManifest, EngineError> {
        let publisher = Publisher::new(self.store, self.config, &self.cancel);
        let mut state = UploadState::Planning;

        // 1. Plan
        progress.emit(TransferPhase::Planning, 0.0);
        validate_chunk_size(chunk_size)?;
        let total_size = source_len(&request.source).await?;
        if total_size > self.config.max_file_size {
            return Err(EngineError::FilesTooLarge {
                limit: self.config.max_file_size,
                files: vec![OversizedFile {
                    name: request.original_name.clone(),
                    size: total_size,
                }],
            });
        }
        let destination = request.resolve_destination()?;
        let regions = plan(total_size, chunk_size)?;
        let count = regions.len();
        let paths: Vec<String> = if count == 1 {
            vec![destination.clone()]
        } else {
            (0..count).map(|i| chunk_path(&destination, i)).collect()
        };
        state.advance(UploadEvent::Planned { objects: count })?;

        info!(
            file = %request.original_name,
            path = %destination,
            size = total_size,
            chunks = count,
            backend = self.store.backend_name(),
            "upload planned"
        );

        // 2. Read the base before writing anything.
        publisher.check_cancelled(Stage::new(TransferPhase::Planning))?;
        let base = publisher.resolve_base(TransferPhase::Planning).await?;
        progress.emit(TransferPhase::Uploading, 10.0);

        // 3. Store chunks in order.
        let mut reader = open_reader(&request.source).await?;
        if reader.source_size() != total_size {
            return Err(EngineError::Integrity {
                stage: Stage::new(TransferPhase::Planning).with_path(&destination),
                reason: format!(
                    "source changed size: planned {total_size} bytes, found {}",
                    reader.source_size()
                ),
            });
        }

        let mut chunks = Vec::with_capacity(count);
        for (region, path) in regions.iter().zip(paths) {
            let stage = Stage::chunk(TransferPhase::Uploading, region.index, &path);
            publisher.check_cancelled(stage.clone())?;

            let (r, data) = read_region(reader, *region, stage.clone()).await?;
            reader = r;

            let mut chunk = ChunkDescriptor::pending(region, path);
            let hash = publisher.store_object(&data, stage).await?;
            debug!(index = region.index, path = %chunk.path, hash = %hash, size = region.length, "chunk stored");
            chunk.record_hash(hash);
            chunks.push(chunk);

            state.advance(UploadEvent::ObjectStored {
                index: region.index,
            })?;
            progress.emit(
                TransferPhase::Uploading,
                10.0 + 70.0 * (region.index + 1) as f64 / count as f64,
            );
        }

        // 4-5. One tree, one commit, one ref update.
        let draft = TreeDraft::from_chunks(&chunks)?;
        let message = upload_message(&request.original_name, count);
        let commit_id = publisher
            .publish(base, &draft, &message, &mut state, progress)
            .await?;

        // 6. Hand back the manifest.
        let manifest = UploadManifest {
            original_name: request.original_name.clone(),
            path: destination,
            mime_type: request.mime_type.clone(),
            total_size,
            chunk_count: count,
            chunks,
            commit_id,
            estimated_sizes: false,
        };
        manifest.validate()?;

        progress.emit(TransferPhase::Done, 100.0);
        info!(
            file = %manifest.original_name,
            commit = %manifest.commit_id,
            chunks = count,
            "upload complete"
        );
        Ok(manifest)
    }
}
