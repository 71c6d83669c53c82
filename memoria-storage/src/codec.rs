// Copyright 2025 Memoria Contributors (https://github.com/memoria-db/memoria)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Compression codec pipeline.
//!
//! Turns a byte string into a possibly-smaller byte string plus a
//! [`CompressionTag`], and reverses the transformation bit-exactly.
//! Compression failures fall back to the input; decompression failures are
//! corruption and surface as errors so the caller can fail over to a
//! replica.

use flate2::read::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use flate2::Compression as FlateLevel;
use memoria_core::{CompressionAlgorithm, CompressionConfig, CompressionTag, MemoriaError, Result};
use std::io::Read;
use tracing::warn;

/// Inputs at or above this size skip codec trials and go straight to zstd.
const TRIAL_CUTOFF: usize = 50_000;

/// Candidate order for adaptive trials; earlier wins ties.
const ADAPTIVE_ORDER: [CompressionTag; 3] =
    [CompressionTag::Zstd, CompressionTag::Gzip, CompressionTag::Zlib];

/// Adaptive compress/decompress pipeline.
#[derive(Debug, Clone, Copy)]
pub struct CodecPipeline {
    enabled: bool,
    algorithm: CompressionAlgorithm,
    level: i32,
    threshold: usize,
}

impl Default for CodecPipeline {
    fn default() -> Self {
        Self::from_config(&CompressionConfig::default())
    }
}

impl CodecPipeline {
    pub fn from_config(config: &CompressionConfig) -> Self {
        Self {
            enabled: config.enabled,
            algorithm: config.algorithm,
            level: config.level,
            threshold: config.threshold_bytes,
        }
    }

    /// Compress `input`, returning the (possibly unchanged) bytes and the
    /// tag needed to reverse them.
    ///
    /// Returns the input untouched when compression is disabled, the input
    /// is below the threshold, or no codec produces output smaller than the
    /// input.
    pub fn compress(&self, input: &[u8]) -> (Vec<u8>, CompressionTag) {
        if !self.enabled
            || self.algorithm == CompressionAlgorithm::None
            || input.len() < self.threshold
        {
            return (input.to_vec(), CompressionTag::None);
        }

        let candidates: &[CompressionTag] = match self.algorithm {
            CompressionAlgorithm::Adaptive => {
                if input.len() >= TRIAL_CUTOFF {
                    // Large payloads: zstd wins on both speed and ratio, so
                    // skip the trial round.
                    &[CompressionTag::Zstd]
                } else {
                    &ADAPTIVE_ORDER
                }
            }
            CompressionAlgorithm::Zstd => &[CompressionTag::Zstd],
            CompressionAlgorithm::Gzip => &[CompressionTag::Gzip],
            CompressionAlgorithm::Zlib => &[CompressionTag::Zlib],
            CompressionAlgorithm::None => unreachable!(),
        };

        let mut best: Option<(Vec<u8>, CompressionTag)> = None;
        for &tag in candidates {
            match self.encode(input, tag) {
                Ok(encoded) => {
                    let better = match &best {
                        Some((current, _)) => encoded.len() < current.len(),
                        None => true,
                    };
                    if better {
                        best = Some((encoded, tag));
                    }
                }
                Err(e) => {
                    warn!(codec = %tag, error = %e, "compression failed, skipping codec");
                }
            }
        }

        match best {
            Some((encoded, tag)) if encoded.len() < input.len() => (encoded, tag),
            _ => (input.to_vec(), CompressionTag::None),
        }
    }

    /// Exact inverse of [`compress`](Self::compress). A `None` tag returns
    /// the input unchanged; a failed decode is a [`MemoriaError::Corruption`].
    pub fn decompress(&self, input: &[u8], tag: CompressionTag) -> Result<Vec<u8>> {
        match tag {
            CompressionTag::None => Ok(input.to_vec()),
            CompressionTag::Zstd => zstd::decode_all(input)
                .map_err(|e| MemoriaError::Corruption(format!("zstd decode failed: {e}"))),
            CompressionTag::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(input)
                    .read_to_end(&mut out)
                    .map_err(|e| MemoriaError::Corruption(format!("gzip decode failed: {e}")))?;
                Ok(out)
            }
            CompressionTag::Zlib => {
                let mut out = Vec::new();
                ZlibDecoder::new(input)
                    .read_to_end(&mut out)
                    .map_err(|e| MemoriaError::Corruption(format!("zlib decode failed: {e}")))?;
                Ok(out)
            }
        }
    }

    /// Space saved as a fraction of the original size, clamped at 0 for
    /// empty input.
    pub fn ratio(original_size: usize, compressed_size: usize) -> f64 {
        if original_size == 0 {
            return 0.0;
        }
        (1.0 - compressed_size as f64 / original_size as f64).max(0.0)
    }

    /// Compress on the blocking pool; for payloads big enough that the CPU
    /// work must not stall the async runtime.
    pub async fn compress_blocking(&self, input: Vec<u8>) -> Result<(Vec<u8>, CompressionTag)> {
        let pipeline = *self;
        tokio::task::spawn_blocking(move || pipeline.compress(&input))
            .await
            .map_err(|e| MemoriaError::Transient(format!("compression task failed: {e}")))
    }

    /// Decompress on the blocking pool.
    pub async fn decompress_blocking(
        &self,
        input: Vec<u8>,
        tag: CompressionTag,
    ) -> Result<Vec<u8>> {
        let pipeline = *self;
        tokio::task::spawn_blocking(move || pipeline.decompress(&input, tag))
            .await
            .map_err(|e| MemoriaError::Transient(format!("decompression task failed: {e}")))?
    }

    fn encode(&self, input: &[u8], tag: CompressionTag) -> std::io::Result<Vec<u8>> {
        match tag {
            CompressionTag::None => Ok(input.to_vec()),
            CompressionTag::Zstd => zstd::encode_all(input, self.level),
            CompressionTag::Gzip => {
                let mut out = Vec::new();
                GzEncoder::new(input, self.flate_level()).read_to_end(&mut out)?;
                Ok(out)
            }
            CompressionTag::Zlib => {
                let mut out = Vec::new();
                ZlibEncoder::new(input, self.flate_level()).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }

    fn flate_level(&self) -> FlateLevel {
        FlateLevel::new(self.level.clamp(0, 9) as u32)
    }
}
