//! Chunk planning, manifests, and progress reporting.
//!
//! This crate holds the pure half of the chunked transfer engine: how a
//! byte source is cut into regions, how chunk paths are named, what a
//! finished upload looks like (`UploadManifest`), and how progress flows
//! back to the caller. It performs no network I/O.

mod chunked;
mod naming;
mod plan;
mod progress;
mod types;
mod validation;

pub use chunked::{ChunkReader, ReadSeek, checksum_bytes, git_blob_id};
pub use naming::{FileKind, destination_path, generate_file_name};
pub use plan::{chunk_path, plan};
pub use progress::{ProgressSink, TransferPhase, TransferProgress};
pub use types::{
    ChunkDescriptor, ChunkRegion, FileRecord, FileSource, StorageTarget, UploadManifest,
};
pub use validation::validate_object_path;

/// Default raw chunk size: 15 MiB.
///
/// Base64 transports inflate payloads by 4/3, so a 15 MiB chunk encodes to
/// 20 MiB, which is the store's request ceiling.
pub const DEFAULT_CHUNK_SIZE: u64 = 15 * 1024 * 1024;

/// Largest encoded request body the remote store accepts.
pub const ENCODED_PAYLOAD_LIMIT: u64 = 20 * 1024 * 1024;

/// Size of `raw` bytes once base64 encoded (with padding).
pub const fn encoded_len(raw: u64) -> u64 {
    raw.div_ceil(3) * 4
}

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("short read at offset {offset}: wanted {wanted} bytes, got {got}")]
    ShortRead { offset: u64, wanted: u64, got: u64 },
}
