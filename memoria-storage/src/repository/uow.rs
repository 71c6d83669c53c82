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

//! Unit-of-work: an all-or-nothing group of repository mutations.
//!
//! Mutations are buffered while the unit-of-work is open and applied to the
//! tables in one atomic step at commit. Readers therefore observe either the
//! pre-commit or the post-commit state, never a partial write. Dropping an
//! uncommitted unit-of-work discards every staged change.

use super::{AuditRecord, MemoryVersion, Repository};
use memoria_core::{Context, ContextId, Memory, MemoryChunk, MemoryId, Relation, RelationId, Result};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// A staged mutation. `expect_new` distinguishes inserts from updates so the
/// apply step can report `Conflict` and `NotFound` precisely.
#[derive(Debug)]
pub(crate) enum Op {
    PutMemory { row: Memory, expect_new: bool },
    DeleteMemory(MemoryId),
    PutContext { row: Context, expect_new: bool },
    DeleteContext(ContextId),
    DetachMemoryContext(MemoryId),
    PutRelation { row: Relation, expect_new: bool },
    DeleteRelation(RelationId),
    PutChunk(MemoryChunk),
    DeleteChunksFor(MemoryId),
    SetSystemConfig(String, serde_json::Value),
    Audit(AuditRecord),
    Version(MemoryVersion),
}

/// An open transaction scope holding the per-memory locks it was begun with.
///
/// Writes to the same memory id are linearized by these locks; the commit
/// itself is serialized by the table store.
pub struct UnitOfWork {
    pub(crate) repo: Arc<Repository>,
    pub(crate) _guards: Vec<OwnedMutexGuard<()>>,
    pub(crate) ops: Vec<Op>,
}

impl UnitOfWork {
    /// Stage an insert of a new memory row.
    pub fn insert_memory(&mut self, row: Memory) {
        self.ops.push(Op::PutMemory { row, expect_new: true });
    }

    /// Stage an update of an existing memory row.
    pub fn update_memory(&mut self, row: Memory) {
        self.ops.push(Op::PutMemory { row, expect_new: false });
    }

    /// Stage deletion of a memory. The apply step cascades to the memory's
    /// chunks and to every relation touching it.
    pub fn delete_memory(&mut self, id: MemoryId) {
        self.ops.push(Op::DeleteMemory(id));
    }

    pub fn insert_context(&mut self, row: Context) {
        self.ops.push(Op::PutContext { row, expect_new: true });
    }

    pub fn update_context(&mut self, row: Context) {
        self.ops.push(Op::PutContext { row, expect_new: false });
    }

    /// Stage deletion of a context. Fails at apply time with `Integrity`
    /// while memories still reference it.
    pub fn delete_context(&mut self, id: ContextId) {
        self.ops.push(Op::DeleteContext(id));
    }

    /// Stage clearing of one memory's context back-link (cascade deletes).
    pub fn detach_memory_context(&mut self, id: MemoryId) {
        self.ops.push(Op::DetachMemoryContext(id));
    }

    pub fn insert_relation(&mut self, row: Relation) {
        self.ops.push(Op::PutRelation { row, expect_new: true });
    }

    pub fn update_relation(&mut self, row: Relation) {
        self.ops.push(Op::PutRelation { row, expect_new: false });
    }

    pub fn delete_relation(&mut self, id: RelationId) {
        self.ops.push(Op::DeleteRelation(id));
    }

    pub fn insert_chunk(&mut self, chunk: MemoryChunk) {
        self.ops.push(Op::PutChunk(chunk));
    }

    /// Stage removal of every chunk row belonging to a memory.
    pub fn delete_chunks_for(&mut self, id: MemoryId) {
        self.ops.push(Op::DeleteChunksFor(id));
    }

    pub fn set_system_config(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.ops.push(Op::SetSystemConfig(key.into(), value));
    }

    /// Stage an audit row describing this unit of work.
    pub fn audit(&mut self, record: AuditRecord) {
        self.ops.push(Op::Audit(record));
    }

    /// Stage a version snapshot for a mutated memory.
    pub fn version(&mut self, snapshot: MemoryVersion) {
        self.ops.push(Op::Version(snapshot));
    }

    /// Number of staged mutations.
    pub fn staged(&self) -> usize {
        self.ops.len()
    }

    /// Apply every staged change atomically. On error nothing is applied and
    /// the store is left in its pre-commit state.
    pub async fn commit(self) -> Result<()> {
        let UnitOfWork { repo, _guards, ops } = self;
        let result = repo.apply(ops).await;
        // Per-memory locks release when the guards drop here.
        drop(_guards);
        result
    }

    /// Discard every staged change. Equivalent to dropping the scope; named
    /// for call sites where the intent should be visible.
    pub fn rollback(self) {
        drop(self);
    }
}
