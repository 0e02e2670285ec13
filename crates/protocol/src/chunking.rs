//! Chunk codec: slicing arithmetic, optional LZ4 compression and sealing.
//!
//! A file of `size` bytes is split into `ceil(size / chunk_size)` chunks.
//! Each chunk is optionally LZ4-compressed (size-prepended block format)
//! and then sealed with a fresh per-chunk key, see [`crate::crypto`].

use crate::crypto::{open_chunk, seal_chunk};
use crate::error::{ProtocolError, Result};
use crate::messages::FileChunk;

/// Default chunk size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Smallest accepted chunk size (1 KiB).
pub const MIN_CHUNK_SIZE: u32 = 1024;

/// Largest accepted chunk size (1 MiB).
pub const MAX_CHUNK_SIZE: u32 = 1024 * 1024;

/// Number of chunks needed for `file_size` bytes.
///
/// A zero-byte file has zero chunks.
pub fn chunk_count(file_size: u64, chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(u64::from(chunk_size)) as u32
}

/// Byte range `(offset, len)` of chunk `index`.
pub fn chunk_range(file_size: u64, chunk_size: u32, index: u32) -> Result<(u64, usize)> {
    let total = chunk_count(file_size, chunk_size);
    if index >= total {
        return Err(ProtocolError::ChunkOutOfRange { index, total });
    }
    let offset = u64::from(index) * u64::from(chunk_size);
    let len = u64::from(chunk_size).min(file_size - offset) as usize;
    Ok((offset, len))
}

/// Bytes covered by chunks `0..=index`, capped at the file size.
pub fn bytes_through(file_size: u64, chunk_size: u32, index: u32) -> u64 {
    ((u64::from(index) + 1) * u64::from(chunk_size)).min(file_size)
}

/// Encodes and decodes chunk payloads for one transfer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkCodec {
    compression: bool,
}

impl ChunkCodec {
    /// Creates a codec; `compression` must match the offer's `useCompression`.
    pub fn new(compression: bool) -> Self {
        Self { compression }
    }

    /// Compresses (if enabled) and seals `plaintext` into a `file-chunk`.
    pub fn encode(
        &self,
        file_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        plaintext: &[u8],
    ) -> Result<FileChunk> {
        if chunk_index >= total_chunks {
            return Err(ProtocolError::ChunkOutOfRange {
                index: chunk_index,
                total: total_chunks,
            });
        }

        let (chunk, encryption_details) = if self.compression {
            seal_chunk(&lz4_flex::compress_prepend_size(plaintext))?
        } else {
            seal_chunk(plaintext)?
        };

        Ok(FileChunk {
            file_id: file_id.to_string(),
            chunk_index,
            total_chunks,
            chunk,
            encryption_details,
        })
    }

    /// Opens and decompresses (if enabled) a received chunk.
    ///
    /// Payloads that decode to more than [`MAX_CHUNK_SIZE`] bytes are
    /// rejected before any decompression buffer is allocated.
    pub fn decode(&self, chunk: &FileChunk) -> Result<Vec<u8>> {
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(ProtocolError::ChunkOutOfRange {
                index: chunk.chunk_index,
                total: chunk.total_chunks,
            });
        }

        let plaintext = open_chunk(&chunk.chunk, &chunk.encryption_details)?;
        if !self.compression {
            check_chunk_len(plaintext.len())?;
            return Ok(plaintext);
        }

        let prefix: [u8; 4] = plaintext
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| ProtocolError::Decompression("missing size prefix".to_string()))?;
        check_chunk_len(u32::from_le_bytes(prefix) as usize)?;
        Ok(lz4_flex::decompress_size_prepended(&plaintext)?)
    }
}

fn check_chunk_len(len: usize) -> Result<()> {
    if len > MAX_CHUNK_SIZE as usize {
        return Err(ProtocolError::ChunkTooLarge {
            len,
            max: MAX_CHUNK_SIZE,
        });
    }
    Ok(())
}
