//! Chunk codec: zlib (deflate with zlib framing) at a fixed level.
//!
//! # Stored chunks
//! A chunk whose compressed form is not smaller than the input is stored
//! as-is followed by the little-endian Adler-32 of the data, and its table
//! entry is left without the compressed flag. Level `None` always stores.
//!
//! # End of stream
//! A chunk with `original_size == 0` is the sentinel that tells the
//! container writer no more data follows. It is never written.

use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ewf::adler32;

pub const CHECKSUM_LEN: usize = 4;

// ── Compression level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    None,
    #[default]
    Fast,
    Balanced,
    Best,
}

impl CompressionLevel {
    pub const ALL: [CompressionLevel; 4] = [
        CompressionLevel::None,
        CompressionLevel::Fast,
        CompressionLevel::Balanced,
        CompressionLevel::Best,
    ];

    /// zlib level handed to the encoder.
    #[inline]
    pub fn zlib_level(self) -> u32 {
        match self {
            CompressionLevel::None     => 0,
            CompressionLevel::Fast     => 1,
            CompressionLevel::Balanced => 4,
            CompressionLevel::Best     => 9,
        }
    }

    /// Value recorded in the volume section.
    pub fn ewf_level(self) -> u32 {
        match self {
            CompressionLevel::None                           => 0,
            CompressionLevel::Fast | CompressionLevel::Balanced => 1,
            CompressionLevel::Best                           => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionLevel::None     => "none",
            CompressionLevel::Fast     => "fast",
            CompressionLevel::Balanced => "balanced",
            CompressionLevel::Best     => "best",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"     => Some(CompressionLevel::None),
            "fast"     => Some(CompressionLevel::Fast),
            "balanced" => Some(CompressionLevel::Balanced),
            "best"     => Some(CompressionLevel::Best),
            _          => None,
        }
    }
}

impl std::fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CompressionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown compression level '{s}' (none|fast|balanced|best)"))
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Stored chunk checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("Compression task was dropped before producing a result")]
    TaskLost,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Chunk ───────────────────────────────────────────────────────────────────

/// One chunk as it will be laid out inside a `sectors` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedChunk {
    /// Bytes of media this chunk represents.
    pub original_size: usize,
    pub compressed:    bool,
    /// Exactly the bytes to write: deflate stream, or raw data plus checksum.
    pub data:          Vec<u8>,
}

impl CompressedChunk {
    pub fn end_of_stream() -> Self {
        Self { original_size: 0, compressed: false, data: Vec::new() }
    }

    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.original_size == 0
    }

    pub fn stored_len(&self) -> usize {
        self.data.len()
    }

    fn stored(raw: &[u8]) -> Self {
        let mut data = Vec::with_capacity(raw.len() + CHECKSUM_LEN);
        data.extend_from_slice(raw);
        data.extend_from_slice(&adler32(raw).to_le_bytes());
        Self { original_size: raw.len(), compressed: false, data }
    }
}

// ── zlib helpers ────────────────────────────────────────────────────────────

pub fn zlib_compress(data: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn zlib_decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Encode one chunk of media. An empty input yields the end-of-stream
/// sentinel.
pub fn compress_chunk(raw: &[u8], level: CompressionLevel) -> Result<CompressedChunk, CodecError> {
    if raw.is_empty() {
        return Ok(CompressedChunk::end_of_stream());
    }
    if level == CompressionLevel::None {
        return Ok(CompressedChunk::stored(raw));
    }
    let deflated = zlib_compress(raw, level.zlib_level())
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    if deflated.len() >= raw.len() {
        return Ok(CompressedChunk::stored(raw));
    }
    Ok(CompressedChunk { original_size: raw.len(), compressed: true, data: deflated })
}

/// Recover the media bytes of a chunk read back from a `sectors` section.
pub fn decompress_chunk(payload: &[u8], compressed: bool) -> Result<Vec<u8>, CodecError> {
    if compressed {
        return zlib_decompress(payload).map_err(|e| CodecError::Decompression(e.to_string()));
    }
    if payload.len() < CHECKSUM_LEN {
        return Err(CodecError::Decompression(format!(
            "stored chunk of {} bytes has no checksum",
            payload.len()
        )));
    }
    let (data, tail) = payload.split_at(payload.len() - CHECKSUM_LEN);
    let stored   = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let computed = adler32(data);
    if stored != computed {
        return Err(CodecError::ChecksumMismatch { stored, computed });
    }
    Ok(data.to_vec())
}
