use std::io::{Read, Seek, SeekFrom};

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::types::ChunkRegion;

/// A seekable byte source that can move between threads.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes the git blob id of `data`: SHA-1 over `"blob <len>\0"` followed
/// by the content. Git-backed stores address content objects by this id.
pub fn git_blob_id(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", data.len()).as_bytes());
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads planned regions out of a seekable source.
pub struct ChunkReader<R> {
    source: R,
    source_size: u64,
}

impl<R: Read + Seek> ChunkReader<R> {
    /// Wraps `source`, measuring its size by seeking to the end.
    pub fn new(mut source: R) -> Result<Self, TransferError> {
        let source_size = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(0))?;
        Ok(Self {
            source,
            source_size,
        })
    }

    /// Total source size in bytes.
    pub fn source_size(&self) -> u64 {
        self.source_size
    }

    /// Reads exactly the bytes of `region`.
    ///
    /// A source that ends early (for example a file truncated after it was
    /// planned) is reported as [`TransferError::ShortRead`].
    pub fn read_region(&mut self, region: &ChunkRegion) -> Result<Vec<u8>, TransferError> {
        self.source.seek(SeekFrom::Start(region.offset))?;

        let mut buf = Vec::with_capacity(region.length as usize);
        let got = (&mut self.source)
            .take(region.length)
            .read_to_end(&mut buf)? as u64;
        if got != region.length {
            return Err(TransferError::ShortRead {
                offset: region.offset,
                wanted: region.length,
                got,
            });
        }
        Ok(buf)
    }

    /// Releases the underlying source.
    pub fn into_inner(self) -> R {
        self.source
    }
}
