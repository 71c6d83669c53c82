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

//! Memoria Core
//!
//! Fundamental data structures for the Memoria multi-context memory store:
//! the entity model (memories, contexts, relations, chunks), the error
//! taxonomy shared by every crate in the workspace, and the engine
//! configuration with all tunable knobs.
//!
//! The unit of user-visible storage is the [`Memory`]: a titled piece of
//! content that may be stored inline, compressed, or split into
//! [`MemoryChunk`]s when large. Memories are grouped into [`Context`]s and
//! linked by typed, directed [`Relation`]s.

pub mod config;
pub mod error;
pub mod model;

pub use config::{
    ArchiveFormat, ArchivePolicy, ArchivalConfig, BackendDescriptor, BackendKind, BulkConfig,
    ChunkingConfig, CompressionAlgorithm, CompressionConfig, DedupConfig, DedupStrategy,
    EngineConfig, HashMethod, RedisConfig, RouterConfig, SimilarityMetric,
};
pub use error::{MemoriaError, Result};
pub use model::{
    AccessLevel, ChunkId, ChunkMetadata, CompressionTag, Context, ContextId, Memory, MemoryChunk,
    MemoryId, Relation, RelationId,
};
