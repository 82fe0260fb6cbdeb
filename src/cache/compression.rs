//! Body and Column-Block Compression
//!
//! Disk-tier bodies and partition column blocks are compressed before they
//! hit storage. Compression is best-effort: failures and incompressible
//! payloads fall back to the raw bytes, with the algorithm tag persisted so
//! readers always know how to reverse it.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Algorithm
// =============================================================================

/// Compression algorithm identifier, persisted in sidecars and headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Lz4,
    Zstd,
    Snappy,
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionAlgorithm::None => write!(f, "none"),
            CompressionAlgorithm::Lz4 => write!(f, "lz4"),
            CompressionAlgorithm::Zstd => write!(f, "zstd"),
            CompressionAlgorithm::Snappy => write!(f, "snappy"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Algorithm for disk bodies and column blocks
    pub algorithm: CompressionAlgorithm,
    /// Payloads smaller than this are stored raw
    pub min_size_bytes: u64,
    /// Level (algorithm-specific; ignored by snappy)
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Lz4,
            min_size_bytes: 1024,
            level: 3,
        }
    }
}

impl CompressionConfig {
    /// Compression disabled entirely
    pub fn disabled() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Codec Implementations
// =============================================================================

fn compress_raw(algorithm: CompressionAlgorithm, level: i32, data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(level)),
            true,
        )
        .map_err(|e| Error::Internal(format!("lz4 compression failed: {}", e))),
        CompressionAlgorithm::Zstd => zstd::bulk::compress(data, level)
            .map_err(|e| Error::Internal(format!("zstd compression failed: {}", e))),
        CompressionAlgorithm::Snappy => {
            let mut encoder = snap::raw::Encoder::new();
            encoder
                .compress_vec(data)
                .map_err(|e| Error::Internal(format!("snappy compression failed: {}", e)))
        }
    }
}

fn decompress_raw(algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => lz4::block::decompress(data, None)
            .map_err(|e| Error::Corruption(format!("lz4 decompression failed: {}", e))),
        CompressionAlgorithm::Zstd => {
            zstd::stream::decode_all(data)
                .map_err(|e| Error::Corruption(format!("zstd decompression failed: {}", e)))
        }
        CompressionAlgorithm::Snappy => {
            let mut decoder = snap::raw::Decoder::new();
            decoder
                .decompress_vec(data)
                .map_err(|e| Error::Corruption(format!("snappy decompression failed: {}", e)))
        }
    }
}

// =============================================================================
// Compressor
// =============================================================================

/// Stateless compression front-end configured once per node
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Compress a payload.
    ///
    /// Returns the stored bytes and the algorithm tag to persist. Small,
    /// incompressible, or failing payloads come back raw with
    /// [`CompressionAlgorithm::None`].
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if self.config.algorithm == CompressionAlgorithm::None
            || (data.len() as u64) < self.config.min_size_bytes
        {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }
        match compress_raw(self.config.algorithm, self.config.level, data) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), self.config.algorithm)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!(algorithm = %self.config.algorithm, error = %e, "compression failed, storing raw");
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Reverse `compress` given the persisted algorithm tag
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        if algorithm == CompressionAlgorithm::None {
            return Ok(Bytes::copy_from_slice(data));
        }
        Ok(Bytes::from(decompress_raw(algorithm, data)?))
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}
