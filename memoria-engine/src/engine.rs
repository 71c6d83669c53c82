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

//! The memory engine facade.
//!
//! Orchestrates the repository, codec pipeline, chunk store, storage
//! router, deduplication engine, and archival manager behind one API.
//! Business rules (validation, access checks, default filling) live here;
//! the collaborators stay mechanism-only.

use crate::book::split_chapters;
use crate::options::{Accessor, LoadMode, OpContext, StorageOptions};
use bytes::Bytes;
use chrono::Utc;
use memoria_archive::{
    ArchivalManager, ArchiveRecord, ArchiveSelection, ArchiveStatistics, ArchiveStatus,
    RestoreOutcome,
};
use memoria_core::{
    AccessLevel, CompressionTag, Context, ContextId, DedupStrategy, EngineConfig, Memory,
    MemoryId, MemoriaError, Relation, RelationId, Result,
};
use memoria_dedup::{DedupEngine, DedupReport, DuplicateGroup, MergeOutcome, MergeStrategy};
use memoria_storage::{
    AuditRecord, ChunkCacheStats, ChunkStore, CodecPipeline, CompressionInfo, MemoryVersion,
    Repository, RepositoryStats, RouterBackgroundTasks, RouterReport, SearchFilters,
    StorageRouter, UnitOfWork,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Input for a new memory.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub title: String,
    pub content: Vec<u8>,
    pub owner_id: i64,
    pub context_id: Option<ContextId>,
    pub access_level: AccessLevel,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub embedding: Option<Vec<u8>>,
}

impl NewMemory {
    pub fn new(owner_id: i64, title: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            owner_id,
            context_id: None,
            access_level: AccessLevel::default(),
            metadata: serde_json::Map::new(),
            embedding: None,
        }
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

    pub fn embedding(mut self, embedding: Vec<u8>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Field-wise update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub title: Option<String>,
    pub content: Option<Vec<u8>>,
    /// `Some(None)` detaches from the current context.
    pub context_id: Option<Option<ContextId>>,
    pub access_level: Option<AccessLevel>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub embedding: Option<Option<Vec<u8>>>,
}

/// Structured report for bulk ingestion jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkReport {
    pub migrated: Vec<MemoryId>,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Result of ingesting one book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookIngestReport {
    /// Container memory carrying the book title.
    pub book_id: MemoryId,
    /// Chapter memories in reading order.
    pub chapter_ids: Vec<MemoryId>,
    pub relations_created: usize,
}

/// Aggregate statistics across every collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    pub repository: RepositoryStats,
    pub chunk_cache: ChunkCacheStats2,
    pub dedup: DedupReport,
    pub archives: ArchiveStatistics,
    pub router: Option<RouterReport>,
}

/// Serializable mirror of the chunk cache counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkCacheStats2 {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

impl From<ChunkCacheStats> for ChunkCacheStats2 {
    fn from(stats: ChunkCacheStats) -> Self {
        Self {
            hits: stats.hits,
            misses: stats.misses,
            entries: stats.entries,
        }
    }
}

/// Builder wiring the engine's collaborators together explicitly.
pub struct MemoryEngineBuilder {
    config: EngineConfig,
    router: Option<Arc<StorageRouter>>,
}

impl MemoryEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            router: None,
        }
    }

    /// Inject a pre-built router (custom tiers, test doubles).
    pub fn router(mut self, router: Arc<StorageRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub async fn build(self) -> Result<MemoryEngine> {
        self.config.validate()?;
        let config = self.config;

        let repo = Repository::open(config.db_dir()).await?;
        let codec = CodecPipeline::from_config(&config.compression);
        let chunks = Arc::new(ChunkStore::new(
            Arc::clone(&repo),
            codec,
            &config.chunked_storage,
        ));
        let router = match self.router {
            Some(router) => Some(router),
            None if !config.router.backends.is_empty() => Some(Arc::new(StorageRouter::new(
                &config.router,
                &config.data_dir.0,
            )?)),
            None => None,
        };
        let dedup = DedupEngine::new(
            Arc::clone(&repo),
            Arc::clone(&chunks),
            config.deduplication.clone(),
        );
        let archival = ArchivalManager::open(Arc::clone(&repo), Arc::clone(&chunks), &config.archival)?;
        let workers = config.bulk_workers();

        info!(workers, backends = config.router.backends.len(), "memory engine ready");
        Ok(MemoryEngine {
            repo,
            codec,
            chunks,
            router,
            dedup,
            archival,
            bulk: Arc::new(Semaphore::new(workers)),
            pending: AtomicUsize::new(0),
            config,
        })
    }
}

/// The facade over the whole storage engine.
pub struct MemoryEngine {
    config: EngineConfig,
    repo: Arc<Repository>,
    codec: CodecPipeline,
    chunks: Arc<ChunkStore>,
    router: Option<Arc<StorageRouter>>,
    dedup: DedupEngine,
    archival: ArchivalManager,
    bulk: Arc<Semaphore>,
    pending: AtomicUsize,
}

impl MemoryEngine {
    /// Open an engine with the default wiring.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        MemoryEngineBuilder::new(config).build().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Per-call storage decisions defaulted from the configuration.
    pub fn default_options(&self) -> StorageOptions {
        StorageOptions::from_config(&self.config)
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn archival(&self) -> &ArchivalManager {
        &self.archival
    }

    pub fn router(&self) -> Option<&Arc<StorageRouter>> {
        self.router.as_ref()
    }

    // ---- memory lifecycle ----------------------------------------------

    /// Create a memory. Returns the row with its full content loaded.
    pub async fn create_memory(
        &self,
        ctx: &OpContext,
        new: NewMemory,
        options: Option<StorageOptions>,
    ) -> Result<Memory> {
        ctx.check()?;
        let options = options.unwrap_or_else(|| self.default_options());
        let content = new.content;

        let mut row = Memory::new(new.owner_id, new.title);
        row.id = self.repo.alloc_memory_id();
        row.context_id = new.context_id;
        row.access_level = new.access_level;
        row.metadata = new.metadata;
        row.embedding = new.embedding;
        row.content_size = content.len() as u64;
        row.content_preview = Some(preview_of(&content, self.config.preview_length.0));
        row.validate()?;

        let mut uow = self.repo.begin(&[row.id]).await;
        let external_id = self
            .stage_content(ctx, &mut uow, &mut row, &content, &options)
            .await?;

        uow.version(MemoryVersion {
            memory_id: row.id,
            version: row.version,
            title: row.title.clone(),
            content_size: row.content_size,
            change: "create".to_string(),
            created_at: Utc::now(),
        });
        uow.audit(AuditRecord::new("create", "memory", row.id).owner(row.owner_id));
        uow.insert_memory(row.clone());

        if let Err(e) = self.commit_checked(ctx, uow).await {
            // The router write (if any) happened before the commit; take the
            // orphaned object back out.
            if let (Some(router), Some(file_id)) = (&self.router, &external_id) {
                let _ = router.delete(file_id).await;
            }
            return Err(e);
        }

        if options.dedup_check {
            self.log_duplicates_of(row.id).await;
        }

        debug!(memory_id = %row.id, bytes = content.len(), "memory created");
        row.content = content;
        row.content_loaded = true;
        Ok(row)
    }

    /// Fetch a memory. Lazy mode returns a stub whose content is just the
    /// preview; eager mode reassembles and decompresses everything.
    pub async fn get_memory(
        &self,
        ctx: &OpContext,
        accessor: Option<&Accessor>,
        id: MemoryId,
        mode: LoadMode,
    ) -> Result<Memory> {
        ctx.check()?;
        let mut row = self.repo.get_memory(id).await?;
        check_access(accessor, row.access_level, id)?;
        self.repo.record_access(id).await?;

        let lazy = mode == LoadMode::Lazy && self.config.lazy_loading_enabled.0;
        if lazy {
            row.content = row
                .content_preview
                .clone()
                .unwrap_or_default()
                .into_bytes();
            row.content_loaded = false;
            return Ok(row);
        }

        ctx.check()?;
        let content = self.resolve_content(&row).await?;
        row.content = content;
        row.content_loaded = true;
        Ok(row)
    }

    /// Promote a lazy stub to a fully loaded memory in place.
    pub async fn load_full_content(&self, ctx: &OpContext, memory: &mut Memory) -> Result<()> {
        if memory.content_loaded {
            return Ok(());
        }
        ctx.check()?;
        let row = self.repo.get_memory(memory.id).await?;
        memory.content = self.resolve_content(&row).await?;
        memory.content_loaded = true;
        Ok(())
    }

    /// Apply a field-wise patch under one unit of work.
    pub async fn update_memory(
        &self,
        ctx: &OpContext,
        accessor: Option<&Accessor>,
        id: MemoryId,
        patch: MemoryPatch,
        options: Option<StorageOptions>,
    ) -> Result<Memory> {
        ctx.check()?;
        let options = options.unwrap_or_else(|| self.default_options());
        let mut row = self.repo.get_memory(id).await?;
        check_access(accessor, row.access_level, id)?;
        let old_external = row.external_locator.clone();

        let mut uow = self.repo.begin(&[id]).await;
        if let Some(title) = patch.title {
            row.title = title;
        }
        if let Some(context_id) = patch.context_id {
            row.context_id = context_id;
        }
        if let Some(level) = patch.access_level {
            row.access_level = level;
        }
        if let Some(metadata) = patch.metadata {
            row.metadata = metadata;
        }
        if let Some(embedding) = patch.embedding {
            row.embedding = embedding;
        }
        row.version += 1;
        row.updated_at = Utc::now();

        let mut external_id = None;
        let mut replaced_external = None;
        let returned_content = if let Some(content) = patch.content {
            row.content_size = content.len() as u64;
            row.content_preview = Some(preview_of(&content, self.config.preview_length.0));
            self.chunks.stage_delete(&mut uow, id).await;
            row.chunk_ids.clear();
            replaced_external = old_external;
            row.external_locator = None;
            external_id = self
                .stage_content(ctx, &mut uow, &mut row, &content, &options)
                .await?;
            Some(content)
        } else {
            None
        };

        row.validate()?;
        uow.version(MemoryVersion {
            memory_id: id,
            version: row.version,
            title: row.title.clone(),
            content_size: row.content_size,
            change: "update".to_string(),
            created_at: Utc::now(),
        });
        uow.audit(AuditRecord::new("update", "memory", id).owner(row.owner_id));
        uow.update_memory(row.clone());

        if let Err(e) = self.commit_checked(ctx, uow).await {
            if let (Some(router), Some(file_id)) = (&self.router, &external_id) {
                let _ = router.delete(file_id).await;
            }
            return Err(e);
        }

        // The old external object is unreferenced once the commit landed.
        if let (Some(router), Some(old)) = (&self.router, replaced_external) {
            if Some(&old) != row.external_locator.as_ref() {
                let _ = router.delete(&old).await;
            }
        }

        if let Some(content) = returned_content {
            row.content = content;
        } else {
            row.content = self.resolve_content(&row).await?;
        }
        row.content_loaded = true;
        Ok(row)
    }

    /// Delete a memory; chunks and relations cascade, external objects are
    /// removed from the router.
    pub async fn delete_memory(
        &self,
        ctx: &OpContext,
        accessor: Option<&Accessor>,
        id: MemoryId,
    ) -> Result<()> {
        ctx.check()?;
        let row = self.repo.get_memory(id).await?;
        check_access(accessor, row.access_level, id)?;

        let mut uow = self.repo.begin(&[id]).await;
        uow.audit(AuditRecord::new("delete", "memory", id).owner(row.owner_id));
        uow.delete_memory(id);
        self.commit_checked(ctx, uow).await?;

        if let (Some(router), Some(file_id)) = (&self.router, &row.external_locator) {
            let _ = router.delete(file_id).await;
        }
        Ok(())
    }

    /// Case-insensitive substring search over titles and previews, with
    /// AND-combined filters. Results are lazy stubs in id order.
    pub async fn search_memories(
        &self,
        ctx: &OpContext,
        accessor: Option<&Accessor>,
        query: &str,
        filters: SearchFilters,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        ctx.check()?;
        let mut results = self.repo.search(query, &filters, limit).await?;
        if let Some(accessor) = accessor {
            results.retain(|m| m.access_level <= accessor.level);
        }
        for row in &mut results {
            row.content = row
                .content_preview
                .clone()
                .unwrap_or_default()
                .into_bytes();
            row.content_loaded = false;
        }
        Ok(results)
    }

    /// Create many memories, fanning out over the worker pool. Refuses the
    /// batch outright when it would push pending work past the high-water
    /// mark.
    pub async fn bulk_create(
        &self,
        ctx: &OpContext,
        items: Vec<NewMemory>,
        options: Option<StorageOptions>,
    ) -> Result<BulkReport> {
        ctx.check()?;
        let queued = self.pending.fetch_add(items.len(), Ordering::SeqCst) + items.len();
        if queued > self.config.bulk.high_water_mark {
            self.pending.fetch_sub(items.len(), Ordering::SeqCst);
            return Err(MemoriaError::Transient(format!(
                "bulk queue at {queued} items exceeds the high-water mark of {}",
                self.config.bulk.high_water_mark
            )));
        }

        let options = options.unwrap_or_else(|| self.default_options());
        let jobs = items.into_iter().map(|item| {
            let options = options.clone();
            async move {
                let _permit = self.bulk.acquire().await.map_err(|_| {
                    MemoriaError::Cancelled("worker pool shut down".into())
                })?;
                let result = self.create_memory(ctx, item, Some(options)).await;
                self.pending.fetch_sub(1, Ordering::SeqCst);
                result
            }
        });

        let mut report = BulkReport::default();
        for result in futures::future::join_all(jobs).await {
            match result {
                Ok(memory) => report.migrated.push(memory.id),
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(e.to_string());
                    // A fatal corruption ends the job; transient errors were
                    // already retried below this layer.
                    if e.is_corruption() {
                        break;
                    }
                }
            }
        }
        Ok(report)
    }

    // ---- contexts ------------------------------------------------------

    pub async fn create_context(&self, ctx: &OpContext, context: Context) -> Result<Context> {
        ctx.check()?;
        self.repo.create_context(context).await
    }

    pub async fn get_context(&self, ctx: &OpContext, id: ContextId) -> Result<Context> {
        ctx.check()?;
        self.repo.get_context(id).await
    }

    pub async fn update_context(&self, ctx: &OpContext, context: Context) -> Result<Context> {
        ctx.check()?;
        self.repo.update_context(context).await
    }

    /// Delete a context. Without `cascade` the call fails while memories
    /// still reference it; with it they are detached.
    pub async fn delete_context(&self, ctx: &OpContext, id: ContextId, cascade: bool) -> Result<()> {
        ctx.check()?;
        self.repo.delete_context(id, cascade).await
    }

    pub async fn list_contexts(&self, ctx: &OpContext) -> Result<Vec<Context>> {
        ctx.check()?;
        Ok(self.repo.list_contexts().await)
    }

    // ---- relations -----------------------------------------------------

    pub async fn create_relation(&self, ctx: &OpContext, relation: Relation) -> Result<Relation> {
        ctx.check()?;
        self.repo.create_relation(relation).await
    }

    pub async fn get_relation(&self, ctx: &OpContext, id: RelationId) -> Result<Relation> {
        ctx.check()?;
        self.repo.get_relation(id).await
    }

    pub async fn update_relation(&self, ctx: &OpContext, relation: Relation) -> Result<Relation> {
        ctx.check()?;
        self.repo.update_relation(relation).await
    }

    pub async fn delete_relation(&self, ctx: &OpContext, id: RelationId) -> Result<()> {
        ctx.check()?;
        self.repo.delete_relation(id).await
    }

    pub async fn relations_for_memory(&self, ctx: &OpContext, id: MemoryId) -> Result<Vec<Relation>> {
        ctx.check()?;
        Ok(self.repo.relations_for_memory(id).await)
    }

    pub async fn find_relations_by_strength(
        &self,
        ctx: &OpContext,
        min: f64,
        max: f64,
    ) -> Result<Vec<Relation>> {
        ctx.check()?;
        Ok(self.repo.find_relations_by_strength_range(min, max).await)
    }

    // ---- dedup ---------------------------------------------------------

    pub async fn find_duplicates(
        &self,
        ctx: &OpContext,
        strategy: Option<DedupStrategy>,
    ) -> Result<Vec<DuplicateGroup>> {
        ctx.check()?;
        self.dedup.find_duplicates(strategy).await
    }

    pub async fn merge_duplicates(
        &self,
        ctx: &OpContext,
        group: &DuplicateGroup,
        strategy: MergeStrategy,
    ) -> Result<MergeOutcome> {
        ctx.check()?;
        self.dedup.merge_duplicates(group, strategy).await
    }

    // ---- archival ------------------------------------------------------

    pub async fn create_archive(
        &self,
        ctx: &OpContext,
        policy: &str,
        selection: ArchiveSelection,
    ) -> Result<ArchiveRecord> {
        ctx.check()?;
        self.archival.create_archive(policy, selection).await
    }

    pub async fn restore_archive(&self, ctx: &OpContext, archive_id: &str) -> Result<RestoreOutcome> {
        ctx.check()?;
        self.archival.restore_archive(archive_id).await
    }

    pub async fn verify_archive(&self, ctx: &OpContext, archive_id: &str) -> Result<ArchiveStatus> {
        ctx.check()?;
        self.archival.verify_archive(archive_id).await
    }

    pub async fn cleanup_expired_archives(&self, ctx: &OpContext) -> Result<Vec<String>> {
        ctx.check()?;
        self.archival.cleanup_expired().await
    }

    // ---- books ---------------------------------------------------------

    /// Parse a book into chapter memories linked by a spine of "next"
    /// relations, all hanging off a container memory via "contains" edges.
    pub async fn ingest_book(
        &self,
        ctx: &OpContext,
        owner_id: i64,
        book_title: &str,
        text: &str,
        context_id: Option<ContextId>,
        options: Option<StorageOptions>,
    ) -> Result<BookIngestReport> {
        ctx.check()?;
        let chapters = split_chapters(book_title, text);
        if chapters.is_empty() {
            return Err(MemoriaError::Integrity("book has no content".into()));
        }

        let mut container = NewMemory::new(owner_id, book_title, Vec::new());
        container.context_id = context_id;
        let container = self.create_memory(ctx, container, options.clone()).await?;

        let mut chapter_ids = Vec::with_capacity(chapters.len());
        let mut relations_created = 0usize;
        let mut previous: Option<MemoryId> = None;
        for (index, chapter) in chapters.into_iter().enumerate() {
            ctx.check()?;
            let mut new = NewMemory::new(owner_id, chapter.title, chapter.body.into_bytes());
            new.context_id = context_id;
            new = new.metadata_entry("chapter_index", serde_json::json!(index));
            let memory = self.create_memory(ctx, new, options.clone()).await?;

            self.repo
                .create_relation(Relation::new(
                    owner_id,
                    "contains",
                    container.id,
                    memory.id,
                ))
                .await?;
            relations_created += 1;
            if let Some(previous) = previous {
                self.repo
                    .create_relation(Relation::new(owner_id, "next", previous, memory.id))
                    .await?;
                relations_created += 1;
            }
            previous = Some(memory.id);
            chapter_ids.push(memory.id);
        }

        info!(
            book = book_title,
            chapters = chapter_ids.len(),
            relations = relations_created,
            "book ingested"
        );
        Ok(BookIngestReport {
            book_id: container.id,
            chapter_ids,
            relations_created,
        })
    }

    // ---- statistics / housekeeping -------------------------------------

    pub async fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            repository: self.repo.statistics().await,
            chunk_cache: self.chunks.cache_stats().into(),
            dedup: self.dedup.report(),
            archives: self.archival.statistics(),
            router: match &self.router {
                Some(router) => Some(router.storage_report().await),
                None => None,
            },
        }
    }

    /// Chunk statistics for one memory.
    pub async fn chunk_info(&self, id: MemoryId) -> memoria_storage::ChunkInfo {
        self.chunks.chunk_info(id).await
    }

    /// Spawn the router's probe and cache-cleanup daemons. No-op without a
    /// router.
    pub fn start_background_tasks(&self) -> Option<RouterBackgroundTasks> {
        self.router.as_ref().map(|router| {
            router.start_background_tasks(
                Duration::from_secs(self.config.router.probe_interval_secs),
                Duration::from_secs(60 * 60),
                self.config.router.cache_max_age_days,
            )
        })
    }

    // ---- internals -----------------------------------------------------

    /// Stage a memory's content per the options: external object, chunk
    /// rows, or inline bytes. Returns the router file id when external.
    ///
    /// External file ids are versioned so an update never overwrites the
    /// object the committed row still points at.
    async fn stage_content(
        &self,
        ctx: &OpContext,
        uow: &mut UnitOfWork,
        row: &mut Memory,
        content: &[u8],
        options: &StorageOptions,
    ) -> Result<Option<String>> {
        if options.external {
            let router = self.router.as_ref().ok_or_else(|| {
                MemoriaError::Config("external storage requested but no backends configured".into())
            })?;
            let (payload, tag) = if options.compress {
                self.codec.compress_blocking(content.to_vec()).await?
            } else {
                (content.to_vec(), CompressionTag::None)
            };
            let file_id = format!("memory_{}_v{}", row.id, row.version);
            ctx.check()?;
            router
                .store(
                    &file_id,
                    &format!("memory_{}.bin", row.id),
                    Bytes::from(payload.clone()),
                    Some(CompressionInfo {
                        tag,
                        original_size: content.len() as u64,
                        compressed_size: payload.len() as u64,
                    }),
                )
                .await?;
            row.content = Vec::new();
            row.content_compressed = tag != CompressionTag::None;
            row.content_compression = tag;
            row.external_locator = Some(file_id.clone());
            return Ok(Some(file_id));
        }

        if options.chunked && !content.is_empty() {
            let staged = self
                .chunks
                .stage_store(uow, row.id, content, options.compress)
                .await?;
            row.chunk_ids = staged.chunk_ids;
            row.content = Vec::new();
            row.content_compressed = false;
            row.content_compression = CompressionTag::None;
            return Ok(None);
        }

        let (payload, tag) = if options.compress {
            self.codec.compress_blocking(content.to_vec()).await?
        } else {
            (content.to_vec(), CompressionTag::None)
        };
        row.content = payload;
        row.content_compressed = tag != CompressionTag::None;
        row.content_compression = tag;
        Ok(None)
    }

    /// Resolve the full decompressed content wherever it lives.
    async fn resolve_content(&self, row: &Memory) -> Result<Vec<u8>> {
        if let Some(file_id) = &row.external_locator {
            let router = self.router.as_ref().ok_or_else(|| {
                MemoriaError::Config(format!(
                    "memory {} is stored externally but no backends are configured",
                    row.id
                ))
            })?;
            let stored = router.retrieve(file_id).await?;
            let content = self
                .codec
                .decompress_blocking(stored.to_vec(), row.content_compression)
                .await?;
            if content.len() as u64 != row.content_size {
                return Err(MemoriaError::Corruption(format!(
                    "memory {} decompressed to {} bytes, expected {}",
                    row.id,
                    content.len(),
                    row.content_size
                )));
            }
            return Ok(content);
        }
        self.chunks.load_content(row).await
    }

    /// Commit unless the deadline has passed; an expired context rolls the
    /// unit of work back instead.
    async fn commit_checked(&self, ctx: &OpContext, uow: UnitOfWork) -> Result<()> {
        if let Err(e) = ctx.check() {
            uow.rollback();
            return Err(e);
        }
        uow.commit().await
    }

    async fn log_duplicates_of(&self, id: MemoryId) {
        match self.dedup.find_duplicates(Some(DedupStrategy::ContentHash)).await {
            Ok(groups) => {
                if let Some(group) = groups.iter().find(|g| g.memory_ids.contains(&id)) {
                    warn!(
                        memory_id = %id,
                        group_size = group.memory_ids.len(),
                        "new memory duplicates existing content"
                    );
                }
            }
            Err(e) => warn!(error = %e, "post-write duplicate check failed"),
        }
    }
}

fn preview_of(content: &[u8], length: usize) -> String {
    String::from_utf8_lossy(content).chars().take(length).collect()
}

fn check_access(accessor: Option<&Accessor>, level: AccessLevel, id: MemoryId) -> Result<()> {
    match accessor {
        // Access denials read as not-found so ids cannot be probed.
        Some(accessor) if accessor.level < level => {
            Err(MemoriaError::NotFound(format!("memory {id}")))
        }
        _ => Ok(()),
    }
}
