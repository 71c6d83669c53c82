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

//! Chunked storage: transparently store arbitrarily large content as an
//! ordered sequence of bounded, individually compressed chunks.
//!
//! Each chunk carries the SHA-256 of its uncompressed slice; chunk 0 also
//! carries the SHA-256 of the whole object so retrieval can verify the
//! reassembled content. Content larger than `chunk_size * max_chunks` is
//! rejected outright rather than silently truncated.

use crate::codec::CodecPipeline;
use crate::repository::{Repository, UnitOfWork};
use memoria_core::{
    ChunkId, ChunkingConfig, ChunkMetadata, CompressionTag, Memory, MemoryChunk, MemoryId,
    MemoriaError, Result,
};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Aggregate information about one memory's chunks.
#[derive(Debug, Clone, Default)]
pub struct ChunkInfo {
    pub chunk_count: usize,
    pub total_original_size: u64,
    pub total_compressed_size: u64,
    /// Space saved across all chunks, 0.0 when nothing was compressed.
    pub compression_ratio: f64,
    /// Distinct compression tags in use, in first-seen order.
    pub compression_tags: Vec<CompressionTag>,
}

/// Decompressed-slice cache counters.
#[derive(Debug, Clone, Default)]
pub struct ChunkCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

/// Result of staging a chunked write.
#[derive(Debug, Clone)]
pub struct StagedChunks {
    pub chunk_ids: Vec<ChunkId>,
    /// SHA-256 of the whole uncompressed content, lowercase hex.
    pub full_hash: String,
}

/// Splits, compresses, stores, and reassembles large content.
pub struct ChunkStore {
    repo: Arc<Repository>,
    codec: CodecPipeline,
    chunk_size: usize,
    max_chunks: usize,
    cache: moka::sync::Cache<i64, Arc<Vec<u8>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ChunkStore {
    pub fn new(repo: Arc<Repository>, codec: CodecPipeline, config: &ChunkingConfig) -> Self {
        Self {
            repo,
            codec,
            chunk_size: config.chunk_size,
            max_chunks: config.max_chunks,
            cache: moka::sync::Cache::new(1_000),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Stage chunk rows for `content` into an open unit of work. Empty
    /// content stages nothing and returns zero chunk ids.
    ///
    /// Fails with `Integrity` when the content would need more than
    /// `max_chunks` chunks.
    pub async fn stage_store(
        &self,
        uow: &mut UnitOfWork,
        memory_id: MemoryId,
        content: &[u8],
        compress: bool,
    ) -> Result<StagedChunks> {
        let full_hash = sha256_hex(content);
        if content.is_empty() {
            return Ok(StagedChunks {
                chunk_ids: Vec::new(),
                full_hash,
            });
        }

        let needed = content.len().div_ceil(self.chunk_size);
        if needed > self.max_chunks {
            return Err(MemoriaError::Integrity(format!(
                "content of {} bytes needs {} chunks, exceeding the limit of {}",
                content.len(),
                needed,
                self.max_chunks
            )));
        }

        let mut chunk_ids = Vec::with_capacity(needed);
        for (index, slice) in content.chunks(self.chunk_size).enumerate() {
            let slice_hash = sha256_hex(slice);
            let (data, tag) = if compress {
                self.codec.compress_blocking(slice.to_vec()).await?
            } else {
                (slice.to_vec(), CompressionTag::None)
            };

            let id = self.repo.alloc_chunk_id();
            let metadata = ChunkMetadata {
                original_size: slice.len() as u64,
                compressed_size: data.len() as u64,
                compression_ratio: CodecPipeline::ratio(slice.len(), data.len()) as f32,
                sha256_hash: slice_hash,
                full_object_hash: (index == 0).then(|| full_hash.clone()),
            };
            uow.insert_chunk(MemoryChunk {
                id,
                memory_id,
                chunk_index: index as u32,
                chunk_data: data,
                compression: tag,
                metadata,
            });
            chunk_ids.push(id);
        }

        debug!(memory_id = %memory_id, chunks = chunk_ids.len(), "staged chunked write");
        Ok(StagedChunks {
            chunk_ids,
            full_hash,
        })
    }

    /// Stage a rewrite: existing chunks are dropped and the new content is
    /// stored, all in the caller's unit of work.
    pub async fn stage_update(
        &self,
        uow: &mut UnitOfWork,
        memory_id: MemoryId,
        content: &[u8],
        compress: bool,
    ) -> Result<StagedChunks> {
        self.invalidate_cached(memory_id).await;
        uow.delete_chunks_for(memory_id);
        self.stage_store(uow, memory_id, content, compress).await
    }

    /// Stage removal of every chunk for a memory.
    pub async fn stage_delete(&self, uow: &mut UnitOfWork, memory_id: MemoryId) {
        self.invalidate_cached(memory_id).await;
        uow.delete_chunks_for(memory_id);
    }

    /// Reassemble a memory's content from its chunks, verifying both the
    /// per-chunk hashes and the whole-object hash. A memory with no chunks
    /// yields empty bytes.
    pub async fn retrieve(&self, memory_id: MemoryId) -> Result<Vec<u8>> {
        let chunks = self.repo.chunks_for_memory(memory_id).await;
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        for (expected, chunk) in chunks.iter().enumerate() {
            if chunk.chunk_index as usize != expected {
                return Err(MemoriaError::Corruption(format!(
                    "memory {memory_id} chunk sequence broken at index {expected}"
                )));
            }
        }

        let full_hash = chunks[0].metadata.full_object_hash.clone();
        let mut content =
            Vec::with_capacity(chunks.iter().map(|c| c.metadata.original_size as usize).sum());
        for chunk in chunks {
            let slice = self.load_chunk(chunk).await?;
            content.extend_from_slice(&slice);
        }

        if let Some(expected) = full_hash {
            let actual = sha256_hex(&content);
            if actual != expected {
                return Err(MemoriaError::Corruption(format!(
                    "memory {memory_id} reassembled content hash mismatch"
                )));
            }
        }
        Ok(content)
    }

    /// Aggregate chunk statistics for one memory.
    pub async fn chunk_info(&self, memory_id: MemoryId) -> ChunkInfo {
        let chunks = self.repo.chunks_for_memory(memory_id).await;
        let mut info = ChunkInfo {
            chunk_count: chunks.len(),
            ..ChunkInfo::default()
        };
        for chunk in &chunks {
            info.total_original_size += chunk.metadata.original_size;
            info.total_compressed_size += chunk.metadata.compressed_size;
            if !info.compression_tags.contains(&chunk.compression) {
                info.compression_tags.push(chunk.compression);
            }
        }
        info.compression_ratio = CodecPipeline::ratio(
            info.total_original_size as usize,
            info.total_compressed_size as usize,
        );
        info
    }

    /// Resolve a memory's full uncompressed content whether it is chunked,
    /// compressed inline, or stored plain.
    pub async fn load_content(&self, memory: &Memory) -> Result<Vec<u8>> {
        if memory.is_chunked() {
            return self.retrieve(memory.id).await;
        }
        if memory.content_compressed {
            let content = self
                .codec
                .decompress_blocking(memory.content.clone(), memory.content_compression)
                .await?;
            if content.len() as u64 != memory.content_size {
                return Err(MemoriaError::Corruption(format!(
                    "memory {} decompressed to {} bytes, expected {}",
                    memory.id,
                    content.len(),
                    memory.content_size
                )));
            }
            return Ok(content);
        }
        Ok(memory.content.clone())
    }

    pub fn cache_stats(&self) -> ChunkCacheStats {
        ChunkCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }

    async fn load_chunk(&self, chunk: MemoryChunk) -> Result<Arc<Vec<u8>>> {
        if let Some(cached) = self.cache.get(&chunk.id.0) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let slice = self
            .codec
            .decompress_blocking(chunk.chunk_data, chunk.compression)
            .await?;
        let actual = sha256_hex(&slice);
        if actual != chunk.metadata.sha256_hash {
            return Err(MemoriaError::Corruption(format!(
                "chunk {} of memory {} failed its hash check",
                chunk.chunk_index, chunk.memory_id
            )));
        }
        let slice = Arc::new(slice);
        self.cache.insert(chunk.id.0, Arc::clone(&slice));
        Ok(slice)
    }

    async fn invalidate_cached(&self, memory_id: MemoryId) {
        for chunk in self.repo.chunks_for_memory(memory_id).await {
            self.cache.invalidate(&chunk.id.0);
        }
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
