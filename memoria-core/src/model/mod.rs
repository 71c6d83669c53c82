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

//! Entity model: memories, contexts, relations, and chunks.

mod chunk;
mod context;
mod memory;
mod relation;

pub use chunk::{ChunkId, ChunkMetadata, MemoryChunk};
pub use context::{Context, ContextId};
pub use memory::{Memory, MemoryId, MAX_TITLE_LEN};
pub use relation::{Relation, RelationId};

use serde::{Deserialize, Serialize};

/// Access levels, ordered from least to most privileged.
///
/// A requester may read a row whose level is at or below their own.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Public,
    #[default]
    User,
    Privileged,
    Admin,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Public => "public",
            AccessLevel::User => "user",
            AccessLevel::Privileged => "privileged",
            AccessLevel::Admin => "admin",
        }
    }

    /// Parse from the wire form used in filters and exports.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(AccessLevel::Public),
            "user" => Some(AccessLevel::User),
            "privileged" => Some(AccessLevel::Privileged),
            "admin" => Some(AccessLevel::Admin),
            _ => None,
        }
    }
}

/// Compression algorithm tag carried alongside compressed bytes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum CompressionTag {
    #[default]
    None,
    Zstd,
    Gzip,
    Zlib,
}

impl CompressionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionTag::None => "none",
            CompressionTag::Zstd => "zstd",
            CompressionTag::Gzip => "gzip",
            CompressionTag::Zlib => "zlib",
        }
    }
}

impl std::fmt::Display for CompressionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_levels_are_ordered() {
        assert!(AccessLevel::Public < AccessLevel::User);
        assert!(AccessLevel::User < AccessLevel::Privileged);
        assert!(AccessLevel::Privileged < AccessLevel::Admin);
    }

    #[test]
    fn access_level_round_trips_through_str() {
        for level in [
            AccessLevel::Public,
            AccessLevel::User,
            AccessLevel::Privileged,
            AccessLevel::Admin,
        ] {
            assert_eq!(AccessLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(AccessLevel::parse("root"), None);
    }

    #[test]
    fn compression_tag_serde_uses_lowercase() {
        let json = serde_json::to_string(&CompressionTag::Zstd).unwrap();
        assert_eq!(json, "\"zstd\"");
        let tag: CompressionTag = serde_json::from_str("\"gzip\"").unwrap();
        assert_eq!(tag, CompressionTag::Gzip);
    }
}
