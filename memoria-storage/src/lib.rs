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

//! Memoria Storage Layer
//!
//! Converts a logical memory into a durable, space-efficient physical
//! representation and back:
//!
//! - **Codec pipeline**: adaptive compression with a per-payload tag
//! - **Chunk store**: splits large content into bounded, individually
//!   compressed chunks and reassembles them with integrity checks
//! - **Backend adapters**: in-memory, local filesystem, and object-store
//!   implementations of one asynchronous [`backend::StorageBackend`] trait
//! - **Storage router**: replicates objects across backends by priority,
//!   fails reads over to healthy replicas, and repairs missing copies
//! - **Repository**: the only path to the durable entity tables, with an
//!   all-or-nothing unit-of-work around every mutation

pub mod backend;
pub mod chunk;
pub mod codec;
pub mod repository;
pub mod router;

pub use backend::{
    build_backend, BackendStats, LocalFsBackend, MemoryBackend, ObjectStoreBackend,
    StorageBackend,
};
pub use chunk::{ChunkCacheStats, ChunkInfo, ChunkStore, StagedChunks};
pub use codec::CodecPipeline;
pub use repository::{
    AuditRecord, MemoryVersion, Repository, RepositoryStats, SearchFilters, SearchRecord,
    UnitOfWork,
};
pub use router::{
    BackendHealth, BackendReport, BackendState, CleanupStats, CompressionInfo, FileEntry,
    RouterBackgroundTasks, RouterReport, StorageRouter,
};
