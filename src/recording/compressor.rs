//! zstd compression of trace artifacts
//!
//! Traces are highly repetitive (class and method names repeat on every row),
//! so even the fast level shrinks them several times over.

use crate::utils::errors::{Result, TraceError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Compression levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// Fast compression (level 1)
    Fast,

    /// Balanced (level 3)
    #[default]
    Balanced,

    /// Best compression (level 19)
    Best,
}

impl CompressionLevel {
    pub fn as_i32(&self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
            CompressionLevel::Best => 19,
        }
    }
}

/// Compressor using zstd
#[derive(Debug, Clone, Copy, Default)]
pub struct Compressor {
    level: CompressionLevel,
}

impl Compressor {
    pub fn new(level: CompressionLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Compress a rendered trace
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let level = self.level.as_i32();

        let compressed = zstd::encode_all(data, level).map_err(|e| {
            TraceError::CompressionFailed(format!("Compression error: {}", e))
        })?;

        debug!(
            "Compressed trace {} bytes -> {} bytes (ratio: {:.2}x)",
            data.len(),
            compressed.len(),
            data.len() as f64 / compressed.len().max(1) as f64
        );

        Ok(compressed)
    }

    /// Decompress a trace artifact
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| {
            TraceError::CompressionFailed(format!("Decompression error: {}", e))
        })
    }
}
