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

use super::{CompressionTag, MemoryId};
use serde::{Deserialize, Serialize};

/// Identifier of a chunk row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChunkId(pub i64);

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-chunk bookkeeping stored alongside the data.
///
/// `full_object_hash` is carried by chunk 0 only: the SHA-256 of the whole
/// uncompressed content, used to verify the reassembled object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub original_size: u64,
    pub compressed_size: u64,
    /// Space saved as a fraction of the original, 0.0 when uncompressed.
    pub compression_ratio: f32,
    /// SHA-256 of this chunk's uncompressed slice, lowercase hex.
    pub sha256_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_object_hash: Option<String>,
}

/// One slice of a chunked memory's content.
///
/// Chunks for one memory form a contiguous 0-based sequence; concatenating
/// their decompressed data yields the original content exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryChunk {
    pub id: ChunkId,
    pub memory_id: MemoryId,
    pub chunk_index: u32,
    /// Possibly compressed slice bytes.
    #[serde(with = "chunk_bytes")]
    pub chunk_data: Vec<u8>,
    pub compression: CompressionTag,
    pub metadata: ChunkMetadata,
}

mod chunk_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
