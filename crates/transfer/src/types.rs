use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::chunked::ReadSeek;

/// Half-open byte range `[offset, offset + length)` of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRegion {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
}

impl ChunkRegion {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// One stored chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub index: usize,
    pub path: String,
    /// Store-assigned hash; `None` until the content object exists.
    pub content_hash: Option<String>,
    pub size: u64,
}

impl ChunkDescriptor {
    /// Creates a descriptor for a region that has not been uploaded yet.
    pub fn pending(region: &ChunkRegion, path: String) -> Self {
        Self {
            index: region.index,
            path,
            content_hash: None,
            size: region.length,
        }
    }

    /// Records the hash the store assigned to this chunk's content.
    pub fn record_hash(&mut self, hash: String) {
        self.content_hash = Some(hash);
    }
}

/// Everything needed to reconstruct one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadManifest {
    pub original_name: String,
    /// Destination path the chunk paths were derived from.
    pub path: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_count: usize,
    pub chunks: Vec<ChunkDescriptor>,
    pub commit_id: String,
    /// Chunk sizes were inferred from a record that never stored its
    /// chunk size; only the total is authoritative.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub estimated_sizes: bool,
}

impl UploadManifest {
    /// Checks the structural invariants: chunk count, index order and
    /// that the chunk sizes add up to the total.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunks.is_empty() {
            return Err(TransferError::InvalidManifest("manifest has no chunks".into()));
        }
        if self.chunk_count != self.chunks.len() {
            return Err(TransferError::InvalidManifest(format!(
                "chunk_count is {} but {} chunks are listed",
                self.chunk_count,
                self.chunks.len()
            )));
        }
        if let Some((pos, chunk)) = self.chunks.iter().enumerate().find(|(i, c)| c.index != *i) {
            return Err(TransferError::InvalidManifest(format!(
                "chunk at position {pos} has index {}",
                chunk.index
            )));
        }
        let sum: u64 = self.chunks.iter().map(|c| c.size).sum();
        if sum != self.total_size {
            return Err(TransferError::InvalidManifest(format!(
                "chunk sizes sum to {sum}, expected {}",
                self.total_size
            )));
        }
        Ok(())
    }

    /// Returns `true` when every chunk has a recorded content hash.
    pub fn has_all_hashes(&self) -> bool {
        self.chunks.iter().all(|c| c.content_hash.is_some())
    }

    /// Flattens the manifest into the record shape the metadata store keeps.
    pub fn to_record(&self, is_chunked: bool) -> FileRecord {
        let chunk_shas = if self.has_all_hashes() {
            Some(
                self.chunks
                    .iter()
                    .filter_map(|c| c.content_hash.clone())
                    .collect(),
            )
        } else {
            None
        };

        FileRecord {
            original_name: self.original_name.clone(),
            file_path: self.path.clone(),
            file_size: self.total_size,
            mime_type: self.mime_type.clone(),
            storage_type: StorageTarget::ChunkCapable,
            is_chunked,
            chunk_count: self.chunk_count,
            chunk_size: self
                .chunks
                .first()
                .filter(|_| is_chunked && !self.estimated_sizes)
                .map(|c| c.size),
            chunk_paths: self.chunks.iter().map(|c| c.path.clone()).collect(),
            chunk_shas,
            commit_sha: (!self.commit_id.is_empty()).then(|| self.commit_id.clone()),
            public_url: None,
        }
    }

    /// Rebuilds a manifest from a stored record.
    ///
    /// Chunk sizes are re-derived by planning `file_size` with the chunk
    /// size the record was written with; unchunked records hold a single
    /// object. Records without a chunk size get the smallest size that
    /// yields their chunk count and are marked [`estimated_sizes`]. Recorded
    /// hashes are used only when there is exactly one per path; older
    /// records without them resolve chunks by path.
    ///
    /// [`estimated_sizes`]: Self::estimated_sizes
    pub fn from_record(record: &FileRecord) -> Result<Self, TransferError> {
        if record.storage_type != StorageTarget::ChunkCapable {
            return Err(TransferError::InvalidManifest(format!(
                "{} is stored on the flat backend",
                record.file_path
            )));
        }
        if record.chunk_count != record.chunk_paths.len() {
            return Err(TransferError::InvalidManifest(format!(
                "record lists {} chunk paths but chunk_count is {}",
                record.chunk_paths.len(),
                record.chunk_count
            )));
        }

        let (chunk_size, estimated_sizes) = match record.chunk_size {
            _ if !record.is_chunked => (record.file_size.max(1), false),
            Some(size) => (size, false),
            None => {
                let count = record.chunk_count.max(1) as u64;
                (record.file_size.div_ceil(count).max(1), true)
            }
        };
        let sizes: Vec<u64> = crate::plan(record.file_size, chunk_size)?
            .iter()
            .map(|r| r.length)
            .collect();
        if sizes.len() != record.chunk_count {
            return Err(TransferError::InvalidManifest(format!(
                "{} bytes in {chunk_size}-byte chunks is {} chunks, record has {}",
                record.file_size,
                sizes.len(),
                record.chunk_count
            )));
        }

        let hashes = record
            .chunk_shas
            .as_ref()
            .filter(|shas| shas.len() == record.chunk_paths.len());

        let chunks = record
            .chunk_paths
            .iter()
            .zip(sizes)
            .enumerate()
            .map(|(index, (path, size))| ChunkDescriptor {
                index,
                path: path.clone(),
                content_hash: hashes.map(|h| h[index].clone()),
                size,
            })
            .collect();

        let manifest = Self {
            original_name: record.original_name.clone(),
            path: record.file_path.clone(),
            mime_type: record.mime_type.clone(),
            total_size: record.file_size,
            chunk_count: record.chunk_count,
            chunks,
            commit_id: record.commit_sha.clone().unwrap_or_default(),
            estimated_sizes,
        };
        manifest.validate()?;
        Ok(manifest)
    }
}

/// Which storage backend a batch goes to. Chosen once per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTarget {
    /// Tree/commit store: small files are co-committed, large ones chunked.
    ChunkCapable,
    /// Whole-file single-request store, never chunked.
    Flat,
}

impl std::fmt::Display for StorageTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChunkCapable => f.write_str("chunk_capable"),
            Self::Flat => f.write_str("flat"),
        }
    }
}

/// File attributes persisted by the metadata store after an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub original_name: String,
    pub file_path: String,
    pub file_size: u64,
    pub mime_type: String,
    pub storage_type: StorageTarget,
    pub is_chunked: bool,
    pub chunk_count: usize,
    /// Chunk size used at upload; absent for unchunked and older records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    pub chunk_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_shas: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

/// Where an upload's bytes come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Arc<[u8]>),
    Path(PathBuf),
}

impl FileSource {
    /// Size of the source in bytes.
    pub fn len(&self) -> Result<u64, TransferError> {
        match self {
            Self::Memory(data) => Ok(data.len() as u64),
            Self::Path(path) => Ok(std::fs::metadata(path)?.len()),
        }
    }

    pub fn is_empty(&self) -> Result<bool, TransferError> {
        Ok(self.len()? == 0)
    }

    /// Opens a fresh seekable reader positioned at the start.
    pub fn open(&self) -> Result<Box<dyn ReadSeek>, TransferError> {
        match self {
            Self::Memory(data) => Ok(Box::new(std::io::Cursor::new(Arc::clone(data)))),
            Self::Path(path) => Ok(Box::new(std::fs::File::open(path)?)),
        }
    }
}

impl From<Vec<u8>> for FileSource {
    fn from(data: Vec<u8>) -> Self {
        Self::Memory(data.into())
    }
}

impl From<PathBuf> for FileSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(sizes: &[u64], hashes: bool) -> UploadManifest {
        let chunks: Vec<ChunkDescriptor> = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| ChunkDescriptor {
                index: i,
                path: crate::chunk_path("videos/clip.mp4", i),
                content_hash: hashes.then(|| format!("hash{i}")),
                size,
            })
            .collect();
        UploadManifest {
            original_name: "clip.mp4".into(),
            path: "videos/clip.mp4".into(),
            mime_type: "video/mp4".into(),
            total_size: sizes.iter().sum(),
            chunk_count: chunks.len(),
            chunks,
            commit_id: "c0ffee".into(),
            estimated_sizes: false,
        }
    }

    #[test]
    fn valid_manifest_passes() {
        manifest(&[4, 4, 2], true).validate().unwrap();
    }

    #[test]
    fn count_mismatch_rejected() {
        let mut m = manifest(&[4, 4, 2], true);
        m.chunk_count = 2;
        assert!(matches!(m.validate(), Err(TransferError::InvalidManifest(_))));
    }

    #[test]
    fn size_mismatch_rejected() {
        let mut m = manifest(&[4, 4, 2], true);
        m.total_size = 11;
        assert!(m.validate().is_err());
    }

    #[test]
    fn out_of_order_rejected() {
        let mut m = manifest(&[4, 4, 2], true);
        m.chunks.swap(0, 1);
        assert!(m.validate().is_err());
    }

    #[test]
    fn pending_descriptor_fills_hash() {
        let region = ChunkRegion {
            index: 3,
            offset: 12,
            length: 4,
        };
        let mut d = ChunkDescriptor::pending(&region, "a.part003.bin".into());
        assert!(d.content_hash.is_none());
        d.record_hash("abc".into());
        assert_eq!(d.content_hash.as_deref(), Some("abc"));
        assert_eq!(d.size, 4);
    }

    #[test]
    fn record_roundtrip_keeps_hashes() {
        let m = manifest(&[4, 4, 2], true);
        let record = m.to_record(true);
        assert_eq!(record.chunk_count, 3);
        assert_eq!(record.chunk_shas.as_ref().unwrap().len(), 3);
        assert_eq!(record.commit_sha.as_deref(), Some("c0ffee"));
        assert_eq!(record.chunk_size, Some(4));

        let back = UploadManifest::from_record(&record).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn legacy_record_without_hashes_falls_back_to_paths() {
        let m = manifest(&[4, 4, 2], true);
        let mut record = m.to_record(true);
        record.chunk_shas = None;
        let back = UploadManifest::from_record(&record).unwrap();
        assert!(back.chunks.iter().all(|c| c.content_hash.is_none()));
    }

    #[test]
    fn record_without_chunk_size_gets_estimated_sizes() {
        let m = manifest(&[10, 10, 10, 5], true);
        let mut record = m.to_record(true);
        record.chunk_size = None;

        let back = UploadManifest::from_record(&record).unwrap();
        assert!(back.estimated_sizes);
        assert_eq!(back.chunk_count, 4);
        assert_eq!(back.total_size, 35);
        assert_eq!(back.chunks.iter().map(|c| c.size).sum::<u64>(), 35);
        back.validate().unwrap();

        // An estimated manifest never claims a chunk size it did not see.
        assert_eq!(back.to_record(true).chunk_size, None);
    }

    #[test]
    fn partial_hash_list_is_ignored() {
        let m = manifest(&[4, 4, 2], true);
        let mut record = m.to_record(true);
        record.chunk_shas = Some(vec!["only-one".into()]);
        let back = UploadManifest::from_record(&record).unwrap();
        assert!(!back.has_all_hashes());
        assert!(back.chunks.iter().all(|c| c.content_hash.is_none()));
    }

    #[test]
    fn record_with_inconsistent_chunk_size_rejected() {
        let mut record = manifest(&[4, 4, 2], true).to_record(true);
        record.chunk_size = Some(5);
        assert!(matches!(
            UploadManifest::from_record(&record),
            Err(TransferError::InvalidManifest(_))
        ));
    }

    #[test]
    fn unchunked_record_is_single_object() {
        let m = manifest(&[30], true);
        let record = m.to_record(false);
        assert_eq!(record.chunk_size, None);
        let back = UploadManifest::from_record(&record).unwrap();
        assert_eq!(back.chunks.len(), 1);
        assert_eq!(back.chunks[0].size, 30);
    }

    #[test]
    fn flat_record_rejected() {
        let mut record = manifest(&[4], true).to_record(false);
        record.storage_type = StorageTarget::Flat;
        assert!(UploadManifest::from_record(&record).is_err());
    }

    #[test]
    fn record_json_uses_store_column_names() {
        let record = manifest(&[4, 2], false).to_record(true);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["storage_type"], "chunk_capable");
        assert_eq!(json["is_chunked"], true);
        assert_eq!(json["chunk_count"], 2);
        assert_eq!(json["chunk_size"], 4);
        assert!(json.get("chunk_shas").is_none());
    }

    #[test]
    fn manifest_json_is_camel_case() {
        let json = serde_json::to_value(manifest(&[1], true)).unwrap();
        assert!(json.get("totalSize").is_some());
        assert!(json["chunks"][0].get("contentHash").is_some());
        assert!(json.get("estimatedSizes").is_none());
    }

    #[test]
    fn file_source_memory_len_and_open() {
        use std::io::Read;
        let src = FileSource::from(b"hello".to_vec());
        assert_eq!(src.len().unwrap(), 5);
        let mut out = String::new();
        src.open().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn file_source_path_len() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, [0u8; 17]).unwrap();
        assert_eq!(FileSource::from(path).len().unwrap(), 17);
    }
}
