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

//! Memoria Archival Engine
//!
//! Moves old or low-access memories into compressed pack-files on a
//! retention schedule. An archive is a structured JSON export (memories,
//! contexts, relations, plus a summary index) packed as tar.gz or left as a
//! directory tree, checksummed with SHA-256, and tracked in an on-disk
//! registry that is replaced atomically on every change.
//!
//! Restores are idempotent at the id level: rows whose ids already exist
//! are skipped with a warning.

mod export;
mod manager;
mod record;
mod registry;

pub use export::{ContextExport, MemoryExport, RelationExport};
pub use manager::{ArchiveSelection, ArchivalManager, ArchiveStatistics, RestoreOutcome};
pub use record::{ArchiveRecord, ArchiveStatus};
pub use registry::Registry;
