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

//! Repository: the only path through which entities reach the durable store.
//!
//! An embedded table store with eight tables (`memories`, `contexts`,
//! `relations`, `memory_chunks`, `memory_versions`, `search_history`,
//! `system_config`, `audit_logs`) held in memory and persisted as one JSON
//! file per table under the database directory. Table files are replaced via
//! rename-over-temp so a crash mid-write never leaves a torn file.
//!
//! All mutations flow through a [`UnitOfWork`]; see that module for the
//! atomicity and locking rules.

mod uow;

pub(crate) use uow::Op;
pub use uow::UnitOfWork;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use memoria_core::{
    AccessLevel, Context, ContextId, Memory, MemoryChunk, MemoryId, MemoriaError, Relation,
    RelationId, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Snapshot of a memory taken on every mutation, forming its version trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryVersion {
    pub memory_id: MemoryId,
    pub version: u32,
    pub title: String,
    pub content_size: u64,
    pub change: String,
    pub created_at: DateTime<Utc>,
}

/// One row of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub owner_id: Option<i64>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        action: impl Into<String>,
        entity_kind: impl Into<String>,
        entity_id: impl std::fmt::Display,
    ) -> Self {
        Self {
            action: action.into(),
            entity_kind: entity_kind.into(),
            entity_id: entity_id.to_string(),
            owner_id: None,
            detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn owner(mut self, owner_id: i64) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One executed search, kept for analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRecord {
    pub query: String,
    pub filters: String,
    pub result_count: usize,
    pub created_at: DateTime<Utc>,
}

/// AND-combined search filters.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub owner_id: Option<i64>,
    pub context_id: Option<ContextId>,
    pub access_level: Option<AccessLevel>,
}

impl SearchFilters {
    fn matches(&self, memory: &Memory) -> bool {
        if let Some(owner_id) = self.owner_id {
            if memory.owner_id != owner_id {
                return false;
            }
        }
        if let Some(context_id) = self.context_id {
            if memory.context_id != Some(context_id) {
                return false;
            }
        }
        if let Some(level) = self.access_level {
            if memory.access_level != level {
                return false;
            }
        }
        true
    }

    fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(owner_id) = self.owner_id {
            parts.push(format!("owner_id={owner_id}"));
        }
        if let Some(context_id) = self.context_id {
            parts.push(format!("context_id={context_id}"));
        }
        if let Some(level) = self.access_level {
            parts.push(format!("access_level={}", level.as_str()));
        }
        parts.join(",")
    }
}

/// Aggregate counts and sizes across the tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub memory_count: usize,
    pub context_count: usize,
    pub relation_count: usize,
    pub chunk_count: usize,
    pub version_count: usize,
    pub total_content_bytes: u64,
    pub compressed_memories: usize,
    pub chunked_memories: usize,
}

#[derive(Default)]
struct Tables {
    memories: BTreeMap<i64, Memory>,
    contexts: BTreeMap<i64, Context>,
    relations: BTreeMap<i64, Relation>,
    chunks: BTreeMap<i64, MemoryChunk>,
    versions: Vec<MemoryVersion>,
    search_history: Vec<SearchRecord>,
    system_config: BTreeMap<String, serde_json::Value>,
    audit_logs: Vec<AuditRecord>,
}

/// Which table files a batch of ops touched, so commit persists only those.
#[derive(Default, Clone, Copy)]
struct Dirty {
    memories: bool,
    contexts: bool,
    relations: bool,
    chunks: bool,
    versions: bool,
    system_config: bool,
    audit_logs: bool,
}

/// The durable entity store.
pub struct Repository {
    db_dir: PathBuf,
    tables: RwLock<Tables>,
    memory_locks: DashMap<i64, Arc<Mutex<()>>>,
    next_memory_id: AtomicI64,
    next_context_id: AtomicI64,
    next_relation_id: AtomicI64,
    next_chunk_id: AtomicI64,
}

impl Repository {
    /// Open (or create) the store under `db_dir`, loading any persisted
    /// tables.
    pub async fn open(db_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let db_dir = db_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&db_dir).await?;

        let mut tables = Tables::default();
        tables.memories = load_table(&db_dir, "memories").await?;
        tables.contexts = load_table(&db_dir, "contexts").await?;
        tables.relations = load_table(&db_dir, "relations").await?;
        tables.chunks = load_table(&db_dir, "memory_chunks").await?;
        tables.versions = load_rows(&db_dir, "memory_versions").await?;
        tables.search_history = load_rows(&db_dir, "search_history").await?;
        tables.system_config = load_map(&db_dir, "system_config").await?;
        tables.audit_logs = load_rows(&db_dir, "audit_logs").await?;

        fn next_id<T>(table: &BTreeMap<i64, T>) -> i64 {
            table.keys().next_back().copied().unwrap_or(0) + 1
        }
        let repo = Self {
            next_memory_id: AtomicI64::new(next_id(&tables.memories)),
            next_context_id: AtomicI64::new(next_id(&tables.contexts)),
            next_relation_id: AtomicI64::new(next_id(&tables.relations)),
            next_chunk_id: AtomicI64::new(next_id(&tables.chunks)),
            db_dir,
            tables: RwLock::new(tables),
            memory_locks: DashMap::new(),
        };
        info!(db_dir = %repo.db_dir.display(), "repository opened");
        Ok(Arc::new(repo))
    }

    /// Begin a unit of work holding exclusive locks on the given memories.
    /// Ids are locked in sorted order so overlapping scopes cannot deadlock.
    pub async fn begin(self: &Arc<Self>, memory_ids: &[MemoryId]) -> UnitOfWork {
        let mut ids: Vec<i64> = memory_ids.iter().map(|id| id.0).collect();
        ids.sort_unstable();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let lock = self
                .memory_locks
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(lock.lock_owned().await);
        }
        UnitOfWork {
            repo: Arc::clone(self),
            _guards: guards,
            ops: Vec::new(),
        }
    }

    // ---- id allocation -------------------------------------------------

    pub fn alloc_memory_id(&self) -> MemoryId {
        MemoryId(self.next_memory_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn alloc_context_id(&self) -> ContextId {
        ContextId(self.next_context_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn alloc_relation_id(&self) -> RelationId {
        RelationId(self.next_relation_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn alloc_chunk_id(&self) -> memoria_core::ChunkId {
        memoria_core::ChunkId(self.next_chunk_id.fetch_add(1, Ordering::SeqCst))
    }

    // ---- memory reads --------------------------------------------------

    pub async fn get_memory(&self, id: MemoryId) -> Result<Memory> {
        let tables = self.tables.read().await;
        tables
            .memories
            .get(&id.0)
            .cloned()
            .ok_or_else(|| MemoriaError::NotFound(format!("memory {id}")))
    }

    pub async fn memory_exists(&self, id: MemoryId) -> bool {
        self.tables.read().await.memories.contains_key(&id.0)
    }

    /// All memories in insertion (id-ascending) order.
    pub async fn list_memories(&self) -> Vec<Memory> {
        self.tables.read().await.memories.values().cloned().collect()
    }

    pub async fn count_memories(&self) -> usize {
        self.tables.read().await.memories.len()
    }

    pub async fn find_memories_by_owner(&self, owner_id: i64) -> Vec<Memory> {
        self.tables
            .read()
            .await
            .memories
            .values()
            .filter(|m| m.owner_id == owner_id)
            .cloned()
            .collect()
    }

    pub async fn find_memories_by_context(&self, context_id: ContextId) -> Vec<Memory> {
        self.tables
            .read()
            .await
            .memories
            .values()
            .filter(|m| m.context_id == Some(context_id))
            .cloned()
            .collect()
    }

    /// Case-insensitive exact title match.
    pub async fn find_memories_by_title(&self, title: &str) -> Vec<Memory> {
        let needle = title.to_lowercase();
        self.tables
            .read()
            .await
            .memories
            .values()
            .filter(|m| m.title.to_lowercase() == needle)
            .cloned()
            .collect()
    }

    /// Case-insensitive substring search over title and content preview.
    /// Filters are AND-combined; results come back in id order. The query is
    /// recorded in `search_history`.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let needle = query.to_lowercase();
        let results: Vec<Memory> = {
            let tables = self.tables.read().await;
            tables
                .memories
                .values()
                .filter(|m| filters.matches(m))
                .filter(|m| {
                    needle.is_empty()
                        || m.title.to_lowercase().contains(&needle)
                        || m.content_preview
                            .as_deref()
                            .is_some_and(|p| p.to_lowercase().contains(&needle))
                })
                .take(limit)
                .cloned()
                .collect()
        };

        let record = SearchRecord {
            query: query.to_string(),
            filters: filters.summary(),
            result_count: results.len(),
            created_at: Utc::now(),
        };
        {
            let mut tables = self.tables.write().await;
            tables.search_history.push(record);
            self.persist_rows(&tables.search_history, "search_history").await?;
        }
        Ok(results)
    }

    /// Bump access bookkeeping for a read. Not versioned or audited.
    pub async fn record_access(&self, id: MemoryId) -> Result<()> {
        let mut tables = self.tables.write().await;
        let memory = tables
            .memories
            .get_mut(&id.0)
            .ok_or_else(|| MemoriaError::NotFound(format!("memory {id}")))?;
        memory.access_count += 1;
        memory.last_accessed = Some(Utc::now());
        self.persist_table(&tables.memories, "memories").await
    }

    // ---- context reads -------------------------------------------------

    pub async fn get_context(&self, id: ContextId) -> Result<Context> {
        let tables = self.tables.read().await;
        tables
            .contexts
            .get(&id.0)
            .cloned()
            .ok_or_else(|| MemoriaError::NotFound(format!("context {id}")))
    }

    pub async fn list_contexts(&self) -> Vec<Context> {
        self.tables.read().await.contexts.values().cloned().collect()
    }

    pub async fn find_contexts_by_name(&self, name: &str) -> Vec<Context> {
        let needle = name.to_lowercase();
        self.tables
            .read()
            .await
            .contexts
            .values()
            .filter(|c| c.name.to_lowercase() == needle)
            .cloned()
            .collect()
    }

    pub async fn count_context_members(&self, id: ContextId) -> usize {
        self.tables
            .read()
            .await
            .memories
            .values()
            .filter(|m| m.context_id == Some(id))
            .count()
    }

    // ---- relation reads ------------------------------------------------

    pub async fn get_relation(&self, id: RelationId) -> Result<Relation> {
        let tables = self.tables.read().await;
        tables
            .relations
            .get(&id.0)
            .cloned()
            .ok_or_else(|| MemoriaError::NotFound(format!("relation {id}")))
    }

    pub async fn list_relations(&self) -> Vec<Relation> {
        self.tables.read().await.relations.values().cloned().collect()
    }

    pub async fn relations_for_memory(&self, id: MemoryId) -> Vec<Relation> {
        self.tables
            .read()
            .await
            .relations
            .values()
            .filter(|r| r.touches(id))
            .cloned()
            .collect()
    }

    pub async fn find_relations_by_strength_range(&self, min: f64, max: f64) -> Vec<Relation> {
        self.tables
            .read()
            .await
            .relations
            .values()
            .filter(|r| r.strength >= min && r.strength <= max)
            .cloned()
            .collect()
    }

    // ---- chunk reads ---------------------------------------------------

    /// Chunk rows for one memory, ordered by chunk index.
    pub async fn chunks_for_memory(&self, id: MemoryId) -> Vec<MemoryChunk> {
        let mut chunks: Vec<MemoryChunk> = self
            .tables
            .read()
            .await
            .chunks
            .values()
            .filter(|c| c.memory_id == id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        chunks
    }

    // ---- history / config reads ---------------------------------------

    pub async fn versions_for_memory(&self, id: MemoryId) -> Vec<MemoryVersion> {
        self.tables
            .read()
            .await
            .versions
            .iter()
            .filter(|v| v.memory_id == id)
            .cloned()
            .collect()
    }

    pub async fn recent_audit(&self, limit: usize) -> Vec<AuditRecord> {
        let tables = self.tables.read().await;
        tables.audit_logs.iter().rev().take(limit).cloned().collect()
    }

    pub async fn recent_searches(&self, limit: usize) -> Vec<SearchRecord> {
        let tables = self.tables.read().await;
        tables.search_history.iter().rev().take(limit).cloned().collect()
    }

    pub async fn get_system_config(&self, key: &str) -> Option<serde_json::Value> {
        self.tables.read().await.system_config.get(key).cloned()
    }

    pub async fn statistics(&self) -> RepositoryStats {
        let tables = self.tables.read().await;
        RepositoryStats {
            memory_count: tables.memories.len(),
            context_count: tables.contexts.len(),
            relation_count: tables.relations.len(),
            chunk_count: tables.chunks.len(),
            version_count: tables.versions.len(),
            total_content_bytes: tables.memories.values().map(|m| m.content_size).sum(),
            compressed_memories: tables
                .memories
                .values()
                .filter(|m| m.content_compressed)
                .count(),
            chunked_memories: tables.memories.values().filter(|m| m.is_chunked()).count(),
        }
    }

    // ---- convenience mutations ----------------------------------------

    /// Insert a new memory under its own unit of work, assigning a fresh id
    /// when the row carries the placeholder id 0.
    pub async fn create_memory(self: &Arc<Self>, mut memory: Memory) -> Result<Memory> {
        memory.validate()?;
        if memory.id.0 == 0 {
            memory.id = self.alloc_memory_id();
        }
        let mut uow = self.begin(&[memory.id]).await;
        uow.version(MemoryVersion {
            memory_id: memory.id,
            version: memory.version,
            title: memory.title.clone(),
            content_size: memory.content_size,
            change: "create".to_string(),
            created_at: Utc::now(),
        });
        uow.audit(AuditRecord::new("create", "memory", memory.id).owner(memory.owner_id));
        uow.insert_memory(memory.clone());
        uow.commit().await?;
        Ok(memory)
    }

    /// Update an existing memory under its own unit of work, bumping the
    /// version counter.
    pub async fn update_memory(self: &Arc<Self>, mut memory: Memory) -> Result<Memory> {
        memory.validate()?;
        let mut uow = self.begin(&[memory.id]).await;
        let current = self.get_memory(memory.id).await?;
        memory.version = current.version + 1;
        memory.updated_at = Utc::now();
        uow.version(MemoryVersion {
            memory_id: memory.id,
            version: memory.version,
            title: memory.title.clone(),
            content_size: memory.content_size,
            change: "update".to_string(),
            created_at: Utc::now(),
        });
        uow.audit(AuditRecord::new("update", "memory", memory.id).owner(memory.owner_id));
        uow.update_memory(memory.clone());
        uow.commit().await?;
        Ok(memory)
    }

    /// Delete a memory under its own unit of work, cascading to chunks and
    /// relations.
    pub async fn delete_memory(self: &Arc<Self>, id: MemoryId) -> Result<()> {
        let mut uow = self.begin(&[id]).await;
        if !self.memory_exists(id).await {
            return Err(MemoriaError::NotFound(format!("memory {id}")));
        }
        uow.audit(AuditRecord::new("delete", "memory", id));
        uow.delete_memory(id);
        uow.commit().await
    }

    pub async fn create_context(self: &Arc<Self>, mut context: Context) -> Result<Context> {
        context.validate()?;
        if context.id.0 == 0 {
            context.id = self.alloc_context_id();
        }
        let mut uow = self.begin(&[]).await;
        uow.audit(AuditRecord::new("create", "context", context.id).owner(context.owner_id));
        uow.insert_context(context.clone());
        uow.commit().await?;
        Ok(context)
    }

    pub async fn update_context(self: &Arc<Self>, mut context: Context) -> Result<Context> {
        context.validate()?;
        context.updated_at = Utc::now();
        let mut uow = self.begin(&[]).await;
        uow.audit(AuditRecord::new("update", "context", context.id));
        uow.update_context(context.clone());
        uow.commit().await?;
        Ok(context)
    }

    /// Delete a context. With `cascade` the member memories are detached
    /// (their back-links cleared); without it the delete fails while members
    /// remain.
    pub async fn delete_context(self: &Arc<Self>, id: ContextId, cascade: bool) -> Result<()> {
        // Resolve the member set first so their locks can be taken.
        let members: Vec<MemoryId> = self
            .find_memories_by_context(id)
            .await
            .into_iter()
            .map(|m| m.id)
            .collect();
        if !cascade && !members.is_empty() {
            return Err(MemoriaError::Integrity(format!(
                "context {id} still referenced by {} memories",
                members.len()
            )));
        }
        let mut uow = self.begin(&members).await;
        for member in &members {
            uow.detach_memory_context(*member);
        }
        uow.audit(AuditRecord::new("delete", "context", id));
        uow.delete_context(id);
        uow.commit().await
    }

    pub async fn create_relation(self: &Arc<Self>, mut relation: Relation) -> Result<Relation> {
        relation.validate()?;
        if relation.id.0 == 0 {
            relation.id = self.alloc_relation_id();
        }
        let mut uow = self
            .begin(&[relation.source_memory_id, relation.target_memory_id])
            .await;
        uow.audit(AuditRecord::new("create", "relation", relation.id).owner(relation.owner_id));
        uow.insert_relation(relation.clone());
        uow.commit().await?;
        Ok(relation)
    }

    pub async fn update_relation(self: &Arc<Self>, mut relation: Relation) -> Result<Relation> {
        relation.validate()?;
        relation.updated_at = Utc::now();
        let mut uow = self
            .begin(&[relation.source_memory_id, relation.target_memory_id])
            .await;
        uow.audit(AuditRecord::new("update", "relation", relation.id));
        uow.update_relation(relation.clone());
        uow.commit().await?;
        Ok(relation)
    }

    pub async fn delete_relation(self: &Arc<Self>, id: RelationId) -> Result<()> {
        let relation = self.get_relation(id).await?;
        let mut uow = self
            .begin(&[relation.source_memory_id, relation.target_memory_id])
            .await;
        uow.audit(AuditRecord::new("delete", "relation", id));
        uow.delete_relation(id);
        uow.commit().await
    }

    pub async fn set_system_config(
        self: &Arc<Self>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        let mut uow = self.begin(&[]).await;
        uow.set_system_config(key, value);
        uow.commit().await
    }

    // ---- apply ---------------------------------------------------------

    /// Apply a batch of staged ops atomically: integrity-check and stage
    /// everything against a working copy, swap it in, then persist the dirty
    /// tables.
    pub(crate) async fn apply(&self, ops: Vec<Op>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let mut dirty = Dirty::default();

        // Work on clones of the touched tables so a failed op leaves the
        // committed state untouched.
        let mut memories = tables.memories.clone();
        let mut contexts = tables.contexts.clone();
        let mut relations = tables.relations.clone();
        let mut chunks = tables.chunks.clone();
        let mut versions = tables.versions.clone();
        let mut system_config = tables.system_config.clone();
        let mut audit_logs = tables.audit_logs.clone();

        for op in ops {
            match op {
                Op::PutMemory { row, expect_new } => {
                    row.validate()?;
                    let exists = memories.contains_key(&row.id.0);
                    if expect_new && exists {
                        return Err(MemoriaError::Conflict(format!(
                            "memory {} already exists",
                            row.id
                        )));
                    }
                    if !expect_new && !exists {
                        return Err(MemoriaError::NotFound(format!("memory {}", row.id)));
                    }
                    if let Some(context_id) = row.context_id {
                        if !contexts.contains_key(&context_id.0) {
                            return Err(MemoriaError::Integrity(format!(
                                "memory {} references missing context {context_id}",
                                row.id
                            )));
                        }
                    }
                    self.bump_next(&self.next_memory_id, row.id.0);
                    memories.insert(row.id.0, row);
                    dirty.memories = true;
                }
                Op::DeleteMemory(id) => {
                    if memories.remove(&id.0).is_none() {
                        return Err(MemoriaError::NotFound(format!("memory {id}")));
                    }
                    let before = relations.len();
                    relations.retain(|_, r| !r.touches(id));
                    if relations.len() != before {
                        dirty.relations = true;
                    }
                    let before = chunks.len();
                    chunks.retain(|_, c| c.memory_id != id);
                    if chunks.len() != before {
                        dirty.chunks = true;
                    }
                    dirty.memories = true;
                }
                Op::PutContext { row, expect_new } => {
                    row.validate()?;
                    let exists = contexts.contains_key(&row.id.0);
                    if expect_new && exists {
                        return Err(MemoriaError::Conflict(format!(
                            "context {} already exists",
                            row.id
                        )));
                    }
                    if !expect_new && !exists {
                        return Err(MemoriaError::NotFound(format!("context {}", row.id)));
                    }
                    self.bump_next(&self.next_context_id, row.id.0);
                    contexts.insert(row.id.0, row);
                    dirty.contexts = true;
                }
                Op::DeleteContext(id) => {
                    if contexts.remove(&id.0).is_none() {
                        return Err(MemoriaError::NotFound(format!("context {id}")));
                    }
                    if memories.values().any(|m| m.context_id == Some(id)) {
                        return Err(MemoriaError::Integrity(format!(
                            "context {id} still referenced"
                        )));
                    }
                    dirty.contexts = true;
                }
                Op::DetachMemoryContext(id) => {
                    let memory = memories
                        .get_mut(&id.0)
                        .ok_or_else(|| MemoriaError::NotFound(format!("memory {id}")))?;
                    memory.context_id = None;
                    memory.updated_at = Utc::now();
                    dirty.memories = true;
                }
                Op::PutRelation { row, expect_new } => {
                    row.validate()?;
                    let exists = relations.contains_key(&row.id.0);
                    if expect_new && exists {
                        return Err(MemoriaError::Conflict(format!(
                            "relation {} already exists",
                            row.id
                        )));
                    }
                    if !expect_new && !exists {
                        return Err(MemoriaError::NotFound(format!("relation {}", row.id)));
                    }
                    for endpoint in [row.source_memory_id, row.target_memory_id] {
                        if !memories.contains_key(&endpoint.0) {
                            return Err(MemoriaError::Integrity(format!(
                                "relation {} references missing memory {endpoint}",
                                row.id
                            )));
                        }
                    }
                    self.bump_next(&self.next_relation_id, row.id.0);
                    relations.insert(row.id.0, row);
                    dirty.relations = true;
                }
                Op::DeleteRelation(id) => {
                    if relations.remove(&id.0).is_none() {
                        return Err(MemoriaError::NotFound(format!("relation {id}")));
                    }
                    dirty.relations = true;
                }
                Op::PutChunk(chunk) => {
                    if !memories.contains_key(&chunk.memory_id.0) {
                        return Err(MemoriaError::Integrity(format!(
                            "chunk for missing memory {}",
                            chunk.memory_id
                        )));
                    }
                    self.bump_next(&self.next_chunk_id, chunk.id.0);
                    chunks.insert(chunk.id.0, chunk);
                    dirty.chunks = true;
                }
                Op::DeleteChunksFor(id) => {
                    let before = chunks.len();
                    chunks.retain(|_, c| c.memory_id != id);
                    if chunks.len() != before {
                        dirty.chunks = true;
                    }
                }
                Op::SetSystemConfig(key, value) => {
                    system_config.insert(key, value);
                    dirty.system_config = true;
                }
                Op::Audit(record) => {
                    audit_logs.push(record);
                    dirty.audit_logs = true;
                }
                Op::Version(snapshot) => {
                    versions.push(snapshot);
                    dirty.versions = true;
                }
            }
        }

        // Swap the working copies in, then persist while still holding the
        // write lock so concurrent commits cannot interleave their files.
        tables.memories = memories;
        tables.contexts = contexts;
        tables.relations = relations;
        tables.chunks = chunks;
        tables.versions = versions;
        tables.system_config = system_config;
        tables.audit_logs = audit_logs;

        if dirty.memories {
            self.persist_table(&tables.memories, "memories").await?;
        }
        if dirty.contexts {
            self.persist_table(&tables.contexts, "contexts").await?;
        }
        if dirty.relations {
            self.persist_table(&tables.relations, "relations").await?;
        }
        if dirty.chunks {
            self.persist_table(&tables.chunks, "memory_chunks").await?;
        }
        if dirty.versions {
            self.persist_rows(&tables.versions, "memory_versions").await?;
        }
        if dirty.system_config {
            self.persist_map(&tables.system_config, "system_config").await?;
        }
        if dirty.audit_logs {
            self.persist_rows(&tables.audit_logs, "audit_logs").await?;
        }
        debug!("unit of work committed");
        Ok(())
    }

    fn bump_next(&self, counter: &AtomicI64, used: i64) {
        // Keep allocation monotonic when rows arrive with explicit ids
        // (archive restore).
        counter.fetch_max(used + 1, Ordering::SeqCst);
    }

    async fn persist_table<T: Serialize>(
        &self,
        table: &BTreeMap<i64, T>,
        name: &str,
    ) -> Result<()> {
        let rows: Vec<&T> = table.values().collect();
        let json = serde_json::to_vec_pretty(&rows)?;
        write_atomic(&self.db_dir, name, json).await
    }

    async fn persist_rows<T: Serialize>(&self, rows: &[T], name: &str) -> Result<()> {
        let json = serde_json::to_vec_pretty(rows)?;
        write_atomic(&self.db_dir, name, json).await
    }

    async fn persist_map(
        &self,
        map: &BTreeMap<String, serde_json::Value>,
        name: &str,
    ) -> Result<()> {
        let json = serde_json::to_vec_pretty(map)?;
        write_atomic(&self.db_dir, name, json).await
    }
}

async fn write_atomic(dir: &Path, name: &str, bytes: Vec<u8>) -> Result<()> {
    let tmp = dir.join(format!("{name}.json.tmp"));
    let path = dir.join(format!("{name}.json"));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

async fn load_rows<T: for<'de> Deserialize<'de>>(dir: &Path, name: &str) -> Result<Vec<T>> {
    let path = dir.join(format!("{name}.json"));
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = tokio::fs::read(&path).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| MemoriaError::Corruption(format!("table {name} failed to decode: {e}")))
}

async fn load_map(
    dir: &Path,
    name: &str,
) -> Result<BTreeMap<String, serde_json::Value>> {
    let path = dir.join(format!("{name}.json"));
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let bytes = tokio::fs::read(&path).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| MemoriaError::Corruption(format!("table {name} failed to decode: {e}")))
}

async fn load_table<T>(dir: &Path, name: &str) -> Result<BTreeMap<i64, T>>
where
    T: for<'de> Deserialize<'de> + HasId,
{
    let rows: Vec<T> = load_rows(dir, name).await?;
    Ok(rows.into_iter().map(|row| (row.row_id(), row)).collect())
}

/// Internal helper to key loaded rows by id.
trait HasId {
    fn row_id(&self) -> i64;
}

impl HasId for Memory {
    fn row_id(&self) -> i64 {
        self.id.0
    }
}

impl HasId for Context {
    fn row_id(&self) -> i64 {
        self.id.0
    }
}

impl HasId for Relation {
    fn row_id(&self) -> i64 {
        self.id.0
    }
}

impl HasId for MemoryChunk {
    fn row_id(&self) -> i64 {
        self.id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_repo(dir: &Path) -> Arc<Repository> {
        Repository::open(dir).await.unwrap()
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let dir = tempdir().unwrap();
        let repo = open_repo(dir.path()).await;

        let created = repo
            .create_memory(Memory::new(1, "First note").content(b"hello".to_vec()))
            .await
            .unwrap();
        assert_eq!(created.id.0, 1);

        let loaded = repo.get_memory(created.id).await.unwrap();
        assert_eq!(loaded.title, "First note");
        assert_eq!(loaded.content, b"hello");
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn ids_ascend_in_insertion_order() {
        let dir = tempdir().unwrap();
        let repo = open_repo(dir.path()).await;
        for i in 0..5 {
            repo.create_memory(Memory::new(1, format!("m{i}"))).await.unwrap();
        }
        let all = repo.list_memories().await;
        let ids: Vec<i64> = all.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let dir = tempdir().unwrap();
        let repo = open_repo(dir.path()).await;
        let m = repo.create_memory(Memory::new(1, "v1")).await.unwrap();

        let mut edited = m.clone();
        edited.title = "v2".to_string();
        let updated = repo.update_memory(edited).await.unwrap();
        assert_eq!(updated.version, 2);

        let versions = repo.versions_for_memory(m.id).await;
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].change, "update");
    }

    #[tokio::test]
    async fn delete_cascades_to_relations_and_chunks() {
        let dir = tempdir().unwrap();
        let repo = open_repo(dir.path()).await;
        let a = repo.create_memory(Memory::new(1, "a")).await.unwrap();
        let b = repo.create_memory(Memory::new(1, "b")).await.unwrap();
        repo.create_relation(Relation::new(1, "related", a.id, b.id))
            .await
            .unwrap();

        repo.delete_memory(a.id).await.unwrap();
        assert!(repo.get_memory(a.id).await.is_err());
        assert!(repo.relations_for_memory(b.id).await.is_empty());
    }

    #[tokio::test]
    async fn context_delete_without_cascade_fails_when_referenced() {
        let dir = tempdir().unwrap();
        let repo = open_repo(dir.path()).await;
        let ctx = repo.create_context(Context::new(1, "bucket")).await.unwrap();
        repo.create_memory(Memory::new(1, "member").context(ctx.id))
            .await
            .unwrap();

        let err = repo.delete_context(ctx.id, false).await;
        assert!(matches!(err, Err(MemoriaError::Integrity(_))));

        repo.delete_context(ctx.id, true).await.unwrap();
        assert!(repo.get_context(ctx.id).await.is_err());
        let members = repo.find_memories_by_context(ctx.id).await;
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn relation_to_missing_memory_is_integrity_error() {
        let dir = tempdir().unwrap();
        let repo = open_repo(dir.path()).await;
        let a = repo.create_memory(Memory::new(1, "a")).await.unwrap();
        let err = repo
            .create_relation(Relation::new(1, "next", a.id, MemoryId(999)))
            .await;
        assert!(matches!(err, Err(MemoriaError::Integrity(_))));
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_everything() {
        let dir = tempdir().unwrap();
        let repo = open_repo(dir.path()).await;
        let a = repo.create_memory(Memory::new(1, "a")).await.unwrap();

        // Second op in the batch fails: the first must not stick.
        let mut uow = repo.begin(&[a.id]).await;
        let mut edited = a.clone();
        edited.title = "edited".to_string();
        uow.update_memory(edited);
        uow.insert_relation(Relation::new(1, "next", a.id, MemoryId(999)));
        assert!(uow.commit().await.is_err());

        let unchanged = repo.get_memory(a.id).await.unwrap();
        assert_eq!(unchanged.title, "a");
    }

    #[tokio::test]
    async fn search_matches_title_and_preview_with_filters() {
        let dir = tempdir().unwrap();
        let repo = open_repo(dir.path()).await;
        let ctx = repo.create_context(Context::new(1, "books")).await.unwrap();

        let mut m1 = Memory::new(1, "Moby Dick").context(ctx.id);
        m1.content_preview = Some("Call me Ishmael".to_string());
        repo.create_memory(m1).await.unwrap();

        let mut m2 = Memory::new(2, "Grocery list");
        m2.content_preview = Some("milk, bread".to_string());
        repo.create_memory(m2).await.unwrap();

        let hits = repo
            .search("ishmael", &SearchFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Moby Dick");

        let filters = SearchFilters {
            owner_id: Some(2),
            ..SearchFilters::default()
        };
        let hits = repo.search("", &filters, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Grocery list");

        assert_eq!(repo.recent_searches(10).await.len(), 2);
    }

    #[tokio::test]
    async fn tables_survive_reopen() {
        let dir = tempdir().unwrap();
        let id = {
            let repo = open_repo(dir.path()).await;
            let m = repo
                .create_memory(Memory::new(1, "persisted").content(b"bytes".to_vec()))
                .await
                .unwrap();
            m.id
        };

        let repo = open_repo(dir.path()).await;
        let loaded = repo.get_memory(id).await.unwrap();
        assert_eq!(loaded.title, "persisted");

        // Fresh ids continue after the persisted maximum.
        let next = repo.create_memory(Memory::new(1, "next")).await.unwrap();
        assert!(next.id.0 > id.0);
    }

    #[tokio::test]
    async fn lookup_queries_filter_correctly() {
        let dir = tempdir().unwrap();
        let repo = open_repo(dir.path()).await;
        let ctx = repo.create_context(Context::new(1, "Research")).await.unwrap();
        repo.create_memory(Memory::new(1, "Alpha").context(ctx.id))
            .await
            .unwrap();
        repo.create_memory(Memory::new(2, "Beta")).await.unwrap();

        assert_eq!(repo.find_memories_by_owner(1).await.len(), 1);
        assert_eq!(repo.find_memories_by_context(ctx.id).await.len(), 1);
        assert_eq!(repo.find_memories_by_title("alpha").await.len(), 1);
        assert_eq!(repo.find_contexts_by_name("research").await.len(), 1);
        assert_eq!(repo.count_context_members(ctx.id).await, 1);

        // Every mutation so far left an audit row.
        assert_eq!(repo.recent_audit(10).await.len(), 3);

        repo.set_system_config("schema_version", serde_json::json!(1))
            .await
            .unwrap();
        assert_eq!(
            repo.get_system_config("schema_version").await,
            Some(serde_json::json!(1))
        );
    }

    #[tokio::test]
    async fn strength_range_query_bounds_are_inclusive() {
        let dir = tempdir().unwrap();
        let repo = open_repo(dir.path()).await;
        let a = repo.create_memory(Memory::new(1, "a")).await.unwrap();
        let b = repo.create_memory(Memory::new(1, "b")).await.unwrap();
        let c = repo.create_memory(Memory::new(1, "c")).await.unwrap();
        repo.create_relation(Relation::new(1, "weak", a.id, b.id).strength(0.2))
            .await
            .unwrap();
        repo.create_relation(Relation::new(1, "strong", b.id, c.id).strength(0.9))
            .await
            .unwrap();

        let strong = repo.find_relations_by_strength_range(0.5, 1.0).await;
        assert_eq!(strong.len(), 1);
        assert_eq!(strong[0].name, "strong");
        assert_eq!(repo.find_relations_by_strength_range(0.2, 0.9).await.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_insert_is_conflict() {
        let dir = tempdir().unwrap();
        let repo = open_repo(dir.path()).await;
        let a = repo.create_memory(Memory::new(1, "a")).await.unwrap();

        let mut clone = Memory::new(1, "dup");
        clone.id = a.id;
        let mut uow = repo.begin(&[a.id]).await;
        uow.insert_memory(clone);
        assert!(matches!(uow.commit().await, Err(MemoriaError::Conflict(_))));
    }
}
