//! Chunk splitting and out-of-order assembly.
//!
//! A payload is split into fixed-size chunks, each carrying its index and
//! a SHA-256 checksum; [`ChunkMetadata`] describes the whole transfer.
//! The assembler accepts chunks in any order and completes only when
//! every index has arrived and the concatenated payload matches the
//! transfer checksum.

use std::collections::HashMap;
use std::io::Read;

use trellis_core::constants::DEFAULT_CHUNK_SIZE;

use crate::checksum;
use crate::diff::Cursor;
use crate::error::BackupError;
use crate::error::Result;

/// A single chunk of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based index within the transfer.
    pub index: u32,
    /// Byte length of `data` (shorter than the chunk size for the tail).
    pub size: u32,
    /// SHA-256 over `data`.
    pub checksum: Vec<u8>,
    pub data: Vec<u8>,
}

impl Chunk {
    /// Build a chunk with its checksum stamped.
    pub fn new(index: u32, data: Vec<u8>) -> Self {
        Self {
            index,
            size: data.len() as u32,
            checksum: checksum(&data),
            data,
        }
    }

    /// Verify the stamped checksum against the carried bytes.
    pub fn verify(&self) -> Result<()> {
        if checksum(&self.data) != self.checksum {
            return Err(BackupError::ChecksumMismatch {
                context: format!("for chunk {}", self.index),
            });
        }
        Ok(())
    }
}

/// Description of a chunked transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub total_chunks: u32,
    pub total_size: u64,
    /// Caller-assigned identifier for the payload.
    pub file_id: String,
    /// SHA-256 over the whole payload.
    pub checksum: Vec<u8>,
}

impl ChunkMetadata {
    /// Metadata for `payload` split at `chunk_size`.
    pub fn for_payload(payload: &[u8], chunk_size: usize, file_id: impl Into<String>) -> Self {
        Self {
            total_chunks: total_chunks(payload.len(), chunk_size),
            total_size: payload.len() as u64,
            file_id: file_id.into(),
            checksum: checksum(payload),
        }
    }
}

/// Number of chunks a payload of `len` bytes occupies at `chunk_size`.
pub fn total_chunks(len: usize, chunk_size: usize) -> u32 {
    len.div_ceil(chunk_size) as u32
}

/// Split `payload` into checksummed chunks of `chunk_size` bytes.
pub fn split_chunks(payload: &[u8], chunk_size: usize) -> Vec<Chunk> {
    payload
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(i, data)| Chunk::new(i as u32, data.to_vec()))
        .collect()
}

/// Reassembles a payload from chunks received in any order.
#[derive(Debug)]
pub struct ChunkAssembler {
    metadata: ChunkMetadata,
    chunks: HashMap<u32, Vec<u8>>,
}

impl ChunkAssembler {
    pub fn new(metadata: ChunkMetadata) -> Self {
        Self {
            metadata,
            chunks: HashMap::new(),
        }
    }

    pub fn metadata(&self) -> &ChunkMetadata {
        &self.metadata
    }

    /// Number of distinct chunks received so far.
    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Accept a chunk.
    ///
    /// The per-chunk checksum is verified first, so a corrupt re-send of
    /// an already-present index still fails; a valid duplicate is ignored.
    pub fn add_chunk(&mut self, chunk: Chunk) -> Result<()> {
        chunk.verify()?;
        if chunk.index >= self.metadata.total_chunks {
            return Err(BackupError::ChunkOutOfRange {
                index: chunk.index,
                total: self.metadata.total_chunks,
            });
        }
        self.chunks.entry(chunk.index).or_insert(chunk.data);
        Ok(())
    }

    /// Whether every chunk index has been received.
    pub fn is_complete(&self) -> bool {
        self.received() == self.metadata.total_chunks
    }

    /// Indices not yet received, in ascending order.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.metadata.total_chunks).filter(|i| !self.chunks.contains_key(i)).collect()
    }

    /// Concatenate all chunks and verify the whole-payload checksum.
    pub fn assemble(&self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(BackupError::IncompleteTransfer {
                received: self.received(),
                total: self.metadata.total_chunks,
            });
        }

        let mut payload = Vec::with_capacity(self.metadata.total_size as usize);
        for index in 0..self.metadata.total_chunks {
            let data = self.chunks.get(&index).ok_or(BackupError::MissingChunk { index })?;
            payload.extend_from_slice(data);
        }

        if checksum(&payload) != self.metadata.checksum {
            return Err(BackupError::ChecksumMismatch {
                context: "for assembled payload".to_string(),
            });
        }
        Ok(payload)
    }
}

/// Incremental chunk reader over any [`Read`] source.
///
/// For client-side uploads of payloads that should not be held fully in
/// memory. Yields `None` at end of stream.
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    index: u32,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size },
            index: 0,
        }
    }

    /// Read the next chunk from the stream.
    pub fn next_chunk(&mut self) -> std::io::Result<Option<Chunk>> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        let chunk = Chunk::new(self.index, buf);
        self.index += 1;
        Ok(Some(chunk))
    }
}

// ============================================================================
// Binary framing
// ============================================================================

/// Serialize a chunk to the little-endian framed format.
pub fn encode_chunk(chunk: &Chunk) -> Vec<u8> {
    let mut buf = Vec::with_capacity(13 + chunk.checksum.len() + chunk.data.len());
    buf.extend_from_slice(&chunk.index.to_le_bytes());
    buf.extend_from_slice(&chunk.size.to_le_bytes());
    buf.push(chunk.checksum.len() as u8);
    buf.extend_from_slice(&chunk.checksum);
    buf.extend_from_slice(&chunk.data);
    buf
}

/// Deserialize a chunk from the little-endian framed format.
pub fn decode_chunk(data: &[u8]) -> Result<Chunk> {
    let mut cursor = Cursor::new(data);
    let index = cursor.read_u32()?;
    let size = cursor.read_u32()?;
    let checksum_len = cursor.read_u8()? as usize;
    let checksum = cursor.read_bytes(checksum_len)?.to_vec();
    let data = cursor.read_bytes(size as usize)?.to_vec();
    Ok(Chunk {
        index,
        size,
        checksum,
        data,
    })
}

/// Serialize transfer metadata to the little-endian framed format.
pub fn encode_chunk_metadata(metadata: &ChunkMetadata) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&metadata.total_chunks.to_le_bytes());
    buf.extend_from_slice(&metadata.total_size.to_le_bytes());
    buf.push(metadata.file_id.len() as u8);
    buf.extend_from_slice(metadata.file_id.as_bytes());
    buf.push(metadata.checksum.len() as u8);
    buf.extend_from_slice(&metadata.checksum);
    buf
}

/// Deserialize transfer metadata from the little-endian framed format.
pub fn decode_chunk_metadata(data: &[u8]) -> Result<ChunkMetadata> {
    let mut cursor = Cursor::new(data);
    let total_chunks = cursor.read_u32()?;
    let total_size = cursor.read_u64()?;
    let file_id_len = cursor.read_u8()? as usize;
    let file_id = String::from_utf8_lossy(cursor.read_bytes(file_id_len)?).into_owned();
    let checksum_len = cursor.read_u8()? as usize;
    let checksum = cursor.read_bytes(checksum_len)?.to_vec();
    Ok(ChunkMetadata {
        total_chunks,
        total_size,
        file_id,
        checksum,
    })
}
