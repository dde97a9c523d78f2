use crate::TransferError;
use crate::types::ChunkRegion;

/// Splits a source of `source_size` bytes into contiguous regions of at
/// most `chunk_size` bytes, ordered by index.
///
/// An empty source yields a single zero-length region so every upload
/// still produces one chunk (and therefore one visible object).
pub fn plan(source_size: u64, chunk_size: u64) -> Result<Vec<ChunkRegion>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::ZeroChunkSize);
    }

    if source_size == 0 {
        return Ok(vec![ChunkRegion {
            index: 0,
            offset: 0,
            length: 0,
        }]);
    }

    let count = source_size.div_ceil(chunk_size);
    let regions = (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            let end = (offset + chunk_size).min(source_size);
            ChunkRegion {
                index: i as usize,
                offset,
                length: end - offset,
            }
        })
        .collect();
    Ok(regions)
}

/// Derives the stored path of chunk `index` from the file's destination.
///
/// `.partNNN` (zero-padded to three digits) goes in front of the file
/// extension: `videos/movie.mp4` becomes `videos/movie.part002.mp4`.
/// Files without an extension get the suffix appended.
pub fn chunk_path(base_path: &str, index: usize) -> String {
    let (dir, name) = match base_path.rfind('/') {
        Some(pos) => base_path.split_at(pos + 1),
        None => ("", base_path),
    };

    // A leading dot marks a hidden file, not an extension.
    match name.rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, ext) = name.split_at(dot);
            format!("{dir}{stem}.part{index:03}{ext}")
        }
        _ => format!("{dir}{name}.part{index:03}"),
    }
}
