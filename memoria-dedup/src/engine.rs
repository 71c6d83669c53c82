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

//! Duplicate detection and merge.

use crate::hash::ContentHasher;
use crate::similarity::{
    cosine_f32, decode_embedding, jaccard, normalized_levenshtein, tokenize, TfIdf,
};
use chrono::Utc;
use memoria_core::{
    DedupConfig, DedupStrategy, Memory, MemoryId, MemoriaError, Result, SimilarityMetric,
};
use memoria_storage::{AuditRecord, ChunkStore, Repository};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Delimiter between contents when merging with [`MergeStrategy::MergeAll`].
const MERGE_DELIMITER: &str = "\n\n---\n\n";

/// How a duplicate group collapses to one survivor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Keep the earliest row (lowest id).
    KeepFirst,
    /// Keep the most recently updated row.
    KeepLatest,
    /// Keep the row with the most content.
    KeepLongest,
    /// Concatenate every content into the first row, then keep it.
    MergeAll,
}

/// One detected group of duplicate memories, ids in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    /// Group key: the shared hash for exact matches, a representative id
    /// otherwise.
    pub key: String,
    pub memory_ids: Vec<MemoryId>,
    /// Lowest pairwise similarity that joined the group; 1.0 for exact.
    pub similarity: f64,
}

/// Result of merging one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub survivor: MemoryId,
    pub removed: Vec<MemoryId>,
    pub relations_rewritten: usize,
    pub bytes_reclaimed: u64,
}

/// Running counters across detection and merge calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupStats {
    pub total_candidates: u64,
    pub groups_found: u64,
    pub duplicates_found: u64,
    pub bytes_reclaimed: u64,
    pub elapsed_ms: u64,
}

/// Snapshot returned by [`DedupEngine::report`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupReport {
    pub strategy: DedupStrategy,
    pub threshold: f64,
    pub comparison_window: usize,
    pub stats: DedupStats,
    pub generated_at: chrono::DateTime<Utc>,
}

/// Detects and merges duplicate memories.
pub struct DedupEngine {
    repo: Arc<Repository>,
    chunks: Arc<ChunkStore>,
    config: DedupConfig,
    hasher: ContentHasher,
    stats: parking_lot::Mutex<DedupStats>,
}

impl DedupEngine {
    pub fn new(repo: Arc<Repository>, chunks: Arc<ChunkStore>, config: DedupConfig) -> Self {
        let hasher = ContentHasher::new(config.hash_method);
        Self {
            repo,
            chunks,
            config,
            hasher,
            stats: parking_lot::Mutex::new(DedupStats::default()),
        }
    }

    /// Find duplicate groups across every stored memory using the given
    /// strategy (or the configured default).
    pub async fn find_duplicates(
        &self,
        strategy: Option<DedupStrategy>,
    ) -> Result<Vec<DuplicateGroup>> {
        let strategy = strategy.unwrap_or(self.config.strategy);
        let started = Instant::now();

        let memories = self.repo.list_memories().await;
        let mut candidates = Vec::with_capacity(memories.len());
        for memory in memories {
            let content = self.chunks.load_content(&memory).await?;
            candidates.push(Candidate {
                embedding: memory.embedding.as_deref().map(decode_embedding),
                id: memory.id,
                content,
            });
        }

        let groups = match strategy {
            DedupStrategy::ContentHash => self.find_exact(&candidates),
            DedupStrategy::Fuzzy => self.find_fuzzy(&candidates),
            DedupStrategy::Semantic => self.find_semantic(&candidates),
        };

        let duplicates: u64 = groups
            .iter()
            .map(|g| g.memory_ids.len().saturating_sub(1) as u64)
            .sum();
        {
            let mut stats = self.stats.lock();
            stats.total_candidates += candidates.len() as u64;
            stats.groups_found += groups.len() as u64;
            stats.duplicates_found += duplicates;
            stats.elapsed_ms += started.elapsed().as_millis() as u64;
        }
        info!(
            strategy = ?strategy,
            candidates = candidates.len(),
            groups = groups.len(),
            "duplicate scan complete"
        );
        Ok(groups)
    }

    /// Merge one duplicate group down to a single survivor inside one unit
    /// of work: relations are rewritten to the survivor, then the rest are
    /// deleted.
    pub async fn merge_duplicates(
        &self,
        group: &DuplicateGroup,
        strategy: MergeStrategy,
    ) -> Result<MergeOutcome> {
        if group.memory_ids.len() < 2 {
            return Err(MemoriaError::Integrity(
                "a duplicate group needs at least two members".into(),
            ));
        }

        let mut members = Vec::with_capacity(group.memory_ids.len());
        for &id in &group.memory_ids {
            members.push(self.repo.get_memory(id).await?);
        }

        let survivor_id = select_survivor(&members, strategy);
        let removed: Vec<MemoryId> = members
            .iter()
            .map(|m| m.id)
            .filter(|&id| id != survivor_id)
            .collect();
        let bytes_reclaimed: u64 = members
            .iter()
            .filter(|m| m.id != survivor_id)
            .map(|m| m.content_size)
            .sum();

        let mut uow = self.repo.begin(&group.memory_ids).await;

        // Rewrite every edge touching a doomed member. Edges that would
        // become self-loops after rewriting are dropped instead. An edge
        // touching two doomed members shows up twice, so track processed
        // ids.
        let mut relations_rewritten = 0usize;
        let mut seen: HashMap<(String, MemoryId, MemoryId), ()> = HashMap::new();
        let mut processed: std::collections::HashSet<memoria_core::RelationId> =
            std::collections::HashSet::new();
        for &doomed in &removed {
            for mut relation in self.repo.relations_for_memory(doomed).await {
                if !processed.insert(relation.id) {
                    continue;
                }
                let mut source = relation.source_memory_id;
                let mut target = relation.target_memory_id;
                if removed.contains(&source) {
                    source = survivor_id;
                }
                if removed.contains(&target) {
                    target = survivor_id;
                }
                if source == target {
                    uow.delete_relation(relation.id);
                    continue;
                }
                if seen.insert((relation.name.clone(), source, target), ()).is_some() {
                    // A parallel edge with the same type already survived.
                    uow.delete_relation(relation.id);
                    continue;
                }
                if source != relation.source_memory_id || target != relation.target_memory_id {
                    relation.source_memory_id = source;
                    relation.target_memory_id = target;
                    relation.updated_at = Utc::now();
                    uow.update_relation(relation);
                    relations_rewritten += 1;
                }
            }
        }

        if strategy == MergeStrategy::MergeAll {
            let mut merged = Vec::new();
            for (index, member) in members.iter().enumerate() {
                if index > 0 {
                    merged.extend_from_slice(MERGE_DELIMITER.as_bytes());
                }
                merged.extend_from_slice(&self.chunks.load_content(member).await?);
            }
            let mut survivor = members
                .iter()
                .find(|m| m.id == survivor_id)
                .cloned()
                .expect("survivor is a member");
            self.chunks.stage_delete(&mut uow, survivor_id).await;
            survivor.chunk_ids.clear();
            survivor.content_size = merged.len() as u64;
            survivor.content = merged;
            survivor.content_compressed = false;
            survivor.content_compression = memoria_core::CompressionTag::None;
            survivor.version += 1;
            survivor.updated_at = Utc::now();
            uow.update_memory(survivor);
        }

        for &doomed in &removed {
            uow.delete_memory(doomed);
        }
        uow.audit(
            AuditRecord::new("merge_duplicates", "memory", survivor_id)
                .detail(format!("removed {} duplicates", removed.len())),
        );
        uow.commit().await?;

        self.stats.lock().bytes_reclaimed += bytes_reclaimed;
        info!(
            survivor = %survivor_id,
            removed = removed.len(),
            relations_rewritten,
            "duplicate group merged"
        );
        Ok(MergeOutcome {
            survivor: survivor_id,
            removed,
            relations_rewritten,
            bytes_reclaimed,
        })
    }

    /// Counters plus configuration, for dashboards and logs.
    pub fn report(&self) -> DedupReport {
        DedupReport {
            strategy: self.config.strategy,
            threshold: self.config.threshold,
            comparison_window: self.config.comparison_window,
            stats: self.stats.lock().clone(),
            generated_at: Utc::now(),
        }
    }

    // ---- strategies ----------------------------------------------------

    fn find_exact(&self, candidates: &[Candidate]) -> Vec<DuplicateGroup> {
        let mut by_hash: HashMap<String, Vec<MemoryId>> = HashMap::new();
        for candidate in candidates {
            by_hash
                .entry(self.hasher.hash(&candidate.content))
                .or_default()
                .push(candidate.id);
        }
        let mut groups: Vec<DuplicateGroup> = by_hash
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(key, memory_ids)| DuplicateGroup {
                key,
                memory_ids,
                similarity: 1.0,
            })
            .collect();
        groups.sort_by_key(|g| g.memory_ids[0]);
        groups
    }

    fn find_fuzzy(&self, candidates: &[Candidate]) -> Vec<DuplicateGroup> {
        let documents: Vec<Vec<String>> = candidates
            .iter()
            .map(|c| tokenize(&String::from_utf8_lossy(&c.content)))
            .collect();
        let model = TfIdf::fit(&documents);
        let vectors: Vec<_> = documents.iter().map(|d| model.vector(d)).collect();

        let window = self.config.comparison_window;
        let mut grouping = Grouping::new(candidates.len());
        for i in 0..candidates.len() {
            // Bounded comparison: each candidate against the next k only,
            // keeping the scan at O(N*k).
            for j in (i + 1)..candidates.len().min(i + 1 + window) {
                let similarity = match self.config.similarity_metric {
                    SimilarityMetric::Cosine => TfIdf::cosine(&vectors[i], &vectors[j]),
                    SimilarityMetric::Jaccard => jaccard(&documents[i], &documents[j]),
                    SimilarityMetric::Levenshtein => normalized_levenshtein(
                        &String::from_utf8_lossy(&candidates[i].content),
                        &String::from_utf8_lossy(&candidates[j].content),
                    ),
                };
                if similarity >= self.config.threshold {
                    grouping.join(i, j, similarity);
                }
            }
        }
        grouping.into_groups(candidates)
    }

    fn find_semantic(&self, candidates: &[Candidate]) -> Vec<DuplicateGroup> {
        let without_embedding = candidates.iter().filter(|c| c.embedding.is_none()).count();
        if without_embedding > 0 {
            warn!(
                skipped = without_embedding,
                "candidates without embeddings are ignored by the semantic strategy"
            );
        }

        let window = self.config.comparison_window;
        let mut grouping = Grouping::new(candidates.len());
        for i in 0..candidates.len() {
            let Some(a) = candidates[i].embedding.as_deref() else {
                continue;
            };
            for j in (i + 1)..candidates.len().min(i + 1 + window) {
                let Some(b) = candidates[j].embedding.as_deref() else {
                    continue;
                };
                let similarity = cosine_f32(a, b);
                if similarity >= self.config.threshold {
                    grouping.join(i, j, similarity);
                }
            }
        }
        grouping.into_groups(candidates)
    }
}

struct Candidate {
    id: MemoryId,
    content: Vec<u8>,
    embedding: Option<Vec<f32>>,
}

fn select_survivor(members: &[Memory], strategy: MergeStrategy) -> MemoryId {
    match strategy {
        MergeStrategy::KeepFirst | MergeStrategy::MergeAll => members
            .iter()
            .map(|m| m.id)
            .min()
            .expect("group is non-empty"),
        MergeStrategy::KeepLatest => {
            members
                .iter()
                .max_by_key(|m| (m.updated_at, m.id))
                .expect("group is non-empty")
                .id
        }
        MergeStrategy::KeepLongest => {
            members
                .iter()
                .max_by_key(|m| (m.content_size, std::cmp::Reverse(m.id)))
                .expect("group is non-empty")
                .id
        }
    }
}

/// Union-find over candidate indices, tracking the weakest similarity that
/// joined each component.
struct Grouping {
    parent: Vec<usize>,
    min_similarity: Vec<f64>,
}

impl Grouping {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            min_similarity: vec![1.0; len],
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn join(&mut self, i: usize, j: usize, similarity: f64) {
        let root_i = self.find(i);
        let root_j = self.find(j);
        let merged_min = self.min_similarity[root_i]
            .min(self.min_similarity[root_j])
            .min(similarity);
        let (keep, fold) = if root_i <= root_j {
            (root_i, root_j)
        } else {
            (root_j, root_i)
        };
        self.parent[fold] = keep;
        self.min_similarity[keep] = merged_min;
    }

    fn into_groups(mut self, candidates: &[Candidate]) -> Vec<DuplicateGroup> {
        let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..candidates.len() {
            let root = self.find(i);
            components.entry(root).or_default().push(i);
        }
        let mut groups: Vec<DuplicateGroup> = components
            .into_iter()
            .filter(|(_, indices)| indices.len() > 1)
            .map(|(root, indices)| DuplicateGroup {
                key: candidates[root].id.to_string(),
                memory_ids: indices.iter().map(|&i| candidates[i].id).collect(),
                similarity: self.min_similarity[root],
            })
            .collect();
        groups.sort_by_key(|g| g.memory_ids[0]);
        debug!(groups = groups.len(), "similarity grouping complete");
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoria_core::{ChunkingConfig, CompressionConfig, Relation};
    use memoria_storage::CodecPipeline;
    use tempfile::tempdir;

    async fn setup(config: DedupConfig) -> (tempfile::TempDir, Arc<Repository>, DedupEngine) {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path()).await.unwrap();
        let chunks = Arc::new(ChunkStore::new(
            Arc::clone(&repo),
            CodecPipeline::from_config(&CompressionConfig::default()),
            &ChunkingConfig::default(),
        ));
        let engine = DedupEngine::new(Arc::clone(&repo), chunks, config);
        (dir, repo, engine)
    }

    async fn add_memory(repo: &Arc<Repository>, title: &str, content: &str) -> Memory {
        repo.create_memory(Memory::new(1, title).content(content.as_bytes().to_vec()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn exact_strategy_groups_identical_content() {
        let (_dir, repo, engine) = setup(DedupConfig::default()).await;
        for i in 0..5 {
            add_memory(&repo, &format!("copy {i}"), "identical body").await;
        }
        add_memory(&repo, "different", "something else entirely").await;

        let groups = engine.find_duplicates(Some(DedupStrategy::ContentHash)).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].memory_ids.len(), 5);
        assert_eq!(groups[0].similarity, 1.0);
    }

    #[tokio::test]
    async fn merge_keep_latest_rewrites_relations() {
        let (_dir, repo, engine) = setup(DedupConfig::default()).await;
        let a = add_memory(&repo, "a", "dup").await;
        let b = add_memory(&repo, "b", "dup").await;
        let c = add_memory(&repo, "c", "dup").await;
        let outside = add_memory(&repo, "outside", "unique").await;
        repo.create_relation(Relation::new(1, "related", outside.id, a.id))
            .await
            .unwrap();
        repo.create_relation(Relation::new(1, "next", a.id, b.id)).await.unwrap();

        let groups = engine.find_duplicates(Some(DedupStrategy::ContentHash)).await.unwrap();
        assert_eq!(groups.len(), 1);

        let outcome = engine
            .merge_duplicates(&groups[0], MergeStrategy::KeepLatest)
            .await
            .unwrap();
        assert_eq!(outcome.survivor, c.id);
        assert_eq!(outcome.removed.len(), 2);

        // Survivor remains, duplicates are gone.
        assert!(repo.get_memory(c.id).await.is_ok());
        assert!(repo.get_memory(a.id).await.is_err());
        assert!(repo.get_memory(b.id).await.is_err());

        // The outside edge now points at the survivor; the intra-group edge
        // collapsed to a self-loop and was dropped.
        let relations = repo.list_relations().await;
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].source_memory_id, outside.id);
        assert_eq!(relations[0].target_memory_id, c.id);

        // No dangling endpoints anywhere.
        for relation in &relations {
            assert!(repo.memory_exists(relation.source_memory_id).await);
            assert!(repo.memory_exists(relation.target_memory_id).await);
        }
    }

    #[tokio::test]
    async fn merge_all_concatenates_contents() {
        let (_dir, repo, engine) = setup(DedupConfig::default()).await;
        add_memory(&repo, "x", "same").await;
        add_memory(&repo, "y", "same").await;

        let groups = engine.find_duplicates(Some(DedupStrategy::ContentHash)).await.unwrap();
        let outcome = engine
            .merge_duplicates(&groups[0], MergeStrategy::MergeAll)
            .await
            .unwrap();

        let survivor = repo.get_memory(outcome.survivor).await.unwrap();
        let text = String::from_utf8(survivor.content).unwrap();
        assert_eq!(text, format!("same{MERGE_DELIMITER}same"));
        assert_eq!(survivor.content_size as usize, text.len());
    }

    #[tokio::test]
    async fn fuzzy_strategy_finds_near_duplicates() {
        let config = DedupConfig {
            threshold: 0.8,
            ..DedupConfig::default()
        };
        let (_dir, repo, engine) = setup(config).await;
        add_memory(
            &repo,
            "v1",
            "the quick brown fox jumps over the lazy dog near the river bank",
        )
        .await;
        add_memory(
            &repo,
            "v2",
            "the quick brown fox jumps over the lazy dog near the river",
        )
        .await;
        add_memory(&repo, "other", "completely unrelated quarterly financial report").await;

        let groups = engine.find_duplicates(Some(DedupStrategy::Fuzzy)).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].memory_ids.len(), 2);
        assert!(groups[0].similarity >= 0.8);
    }

    #[tokio::test]
    async fn semantic_strategy_uses_embeddings() {
        let (_dir, repo, engine) = setup(DedupConfig::default()).await;
        let embedding = |values: &[f32]| -> Vec<u8> {
            values.iter().flat_map(|f| f.to_le_bytes()).collect()
        };

        let mut a = Memory::new(1, "a").content(b"one".to_vec());
        a.embedding = Some(embedding(&[1.0, 0.0, 0.0]));
        repo.create_memory(a).await.unwrap();
        let mut b = Memory::new(1, "b").content(b"two".to_vec());
        b.embedding = Some(embedding(&[0.99, 0.05, 0.0]));
        repo.create_memory(b).await.unwrap();
        let mut c = Memory::new(1, "c").content(b"three".to_vec());
        c.embedding = Some(embedding(&[0.0, 1.0, 0.0]));
        repo.create_memory(c).await.unwrap();
        // No embedding: silently skipped.
        repo.create_memory(Memory::new(1, "d").content(b"four".to_vec()))
            .await
            .unwrap();

        let groups = engine.find_duplicates(Some(DedupStrategy::Semantic)).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].memory_ids.len(), 2);
    }

    #[tokio::test]
    async fn report_accumulates_counters() {
        let (_dir, repo, engine) = setup(DedupConfig::default()).await;
        add_memory(&repo, "a", "dup").await;
        add_memory(&repo, "b", "dup").await;
        engine.find_duplicates(None).await.unwrap();

        let report = engine.report();
        assert_eq!(report.stats.total_candidates, 2);
        assert_eq!(report.stats.groups_found, 1);
        assert_eq!(report.stats.duplicates_found, 1);
    }
}
