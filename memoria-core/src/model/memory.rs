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

use super::{AccessLevel, ChunkId, CompressionTag, ContextId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum title length in characters.
pub const MAX_TITLE_LEN: usize = 200;

/// Identifier of a memory. Ids are monotonic integers assigned by the
/// repository and stable for the life of the row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MemoryId(pub i64);

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The unit of stored content: a titled piece of text plus bookkeeping.
///
/// Invariants maintained by the repository and chunk store:
/// - `content_size` is always the uncompressed byte count;
/// - when `chunk_ids` is non-empty the row's `content` is empty and the true
///   bytes live in chunks;
/// - `content_compressed` implies decompression yields exactly
///   `content_size` bytes;
/// - `version` increases monotonically on every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub title: String,
    /// Inline content bytes, possibly compressed. Empty when chunked or when
    /// the row was loaded lazily.
    #[serde(with = "content_bytes")]
    pub content: Vec<u8>,
    /// Uncompressed byte count of the full content.
    pub content_size: u64,
    pub content_compressed: bool,
    /// Codec of the inline content; `None` when uncompressed or chunked
    /// (chunk rows carry their own tags).
    #[serde(default)]
    pub content_compression: CompressionTag,
    /// Short decompressed prefix used by lazy loads and search.
    pub content_preview: Option<String>,
    /// False when `content` holds only the preview stub.
    pub content_loaded: bool,
    pub owner_id: i64,
    pub context_id: Option<ContextId>,
    pub access_level: AccessLevel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Opaque embedding blob (little-endian f32s); produced externally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<u8>>,
    /// Chunk rows holding the content when chunked storage is in use.
    #[serde(default)]
    pub chunk_ids: Vec<ChunkId>,
    /// Router file id when the bytes live outside the primary store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_locator: Option<String>,
    pub version: u32,
    pub is_active: bool,
}

impl Memory {
    /// Create a new memory with defaults. The repository assigns the real id
    /// at insert time.
    pub fn new(owner_id: i64, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: MemoryId(0),
            title: title.into(),
            content: Vec::new(),
            content_size: 0,
            content_compressed: false,
            content_compression: CompressionTag::None,
            content_preview: None,
            content_loaded: true,
            owner_id,
            context_id: None,
            access_level: AccessLevel::default(),
            created_at: now,
            updated_at: now,
            access_count: 0,
            last_accessed: None,
            metadata: serde_json::Map::new(),
            embedding: None,
            chunk_ids: Vec::new(),
            external_locator: None,
            version: 1,
            is_active: true,
        }
    }

    pub fn content(mut self, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        self.content_size = content.len() as u64;
        self.content = content;
        self
    }

    pub fn context(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn access_level(mut self, level: AccessLevel) -> Self {
        self.access_level = level;
        self
    }

    pub fn metadata_entry(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the content lives in chunk rows rather than inline.
    pub fn is_chunked(&self) -> bool {
        !self.chunk_ids.is_empty()
    }

    /// Validate structural invariants that do not require store access.
    pub fn validate(&self) -> crate::Result<()> {
        if self.title.is_empty() {
            return Err(crate::MemoriaError::Integrity("memory title is empty".into()));
        }
        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(crate::MemoriaError::Integrity(format!(
                "memory title exceeds {} characters",
                MAX_TITLE_LEN
            )));
        }
        if self.is_chunked() && !self.content.is_empty() {
            return Err(crate::MemoriaError::Integrity(
                "chunked memory must not carry inline content".into(),
            ));
        }
        Ok(())
    }
}

/// Content is stored as base64 in JSON exports so compressed bytes survive
/// the round trip.
mod content_bytes {
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
