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

//! Memoria Engine
//!
//! The service layer of the Memoria multi-context memory store: one facade
//! orchestrating the repository, codec pipeline, chunk store, storage
//! router, deduplication engine, and archival manager.
//!
//! # Example
//!
//! ```rust,ignore
//! use memoria_core::EngineConfig;
//! use memoria_engine::{LoadMode, MemoryEngine, NewMemory, OpContext};
//!
//! #[tokio::main]
//! async fn main() -> memoria_core::Result<()> {
//!     let engine = MemoryEngine::open(EngineConfig::default()).await?;
//!     let ctx = OpContext::unbounded();
//!
//!     let note = engine
//!         .create_memory(&ctx, NewMemory::new(1, "First note", "hello"), None)
//!         .await?;
//!     let loaded = engine
//!         .get_memory(&ctx, None, note.id, LoadMode::Eager)
//!         .await?;
//!     assert_eq!(loaded.content, b"hello");
//!     Ok(())
//! }
//! ```

pub mod book;
pub mod engine;
pub mod options;

pub use book::{split_chapters, Chapter};
pub use engine::{
    BookIngestReport, BulkReport, EngineStatistics, MemoryEngine, MemoryEngineBuilder,
    MemoryPatch, NewMemory,
};
pub use options::{Accessor, LoadMode, OpContext, StorageOptions};

// The collaborators' public types, re-exported so embedding applications
// depend on one crate.
pub use memoria_archive::{ArchiveRecord, ArchiveSelection, ArchiveStatus, RestoreOutcome};
pub use memoria_core::{
    AccessLevel, Context, ContextId, EngineConfig, Memory, MemoryId, MemoriaError, Relation,
    RelationId, Result,
};
pub use memoria_dedup::{DuplicateGroup, MergeOutcome, MergeStrategy};
pub use memoria_storage::SearchFilters;
