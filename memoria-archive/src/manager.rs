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

//! Archive lifecycle: create, restore, verify, clean up.

use crate::export::{ContextExport, MemoryExport, RelationExport};
use crate::record::{ArchiveRecord, ArchiveStatus};
use crate::registry::Registry;
use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use memoria_core::{
    ArchivalConfig, ArchiveFormat, ArchivePolicy, Context, ContextId, Memory, MemoryId,
    MemoriaError, Relation, RelationId, Result,
};
use memoria_storage::{ChunkStore, Repository};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Which memories go into an archive.
#[derive(Debug, Clone)]
pub enum ArchiveSelection {
    /// An explicit id list; unknown ids fail the call.
    Ids(Vec<MemoryId>),
    /// Memories created inside the range (inclusive).
    CreatedBetween(DateTime<Utc>, DateTime<Utc>),
    /// Memories older than the policy's retention window.
    OlderThanRetention,
}

/// Result of a restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub memories_restored: usize,
    pub contexts_restored: usize,
    pub relations_restored: usize,
    /// Rows skipped because their ids already existed.
    pub skipped: usize,
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveStatistics {
    pub archive_count: usize,
    pub total_size_bytes: u64,
    pub total_memories: usize,
    pub completed: usize,
    pub verified: usize,
    pub corrupted: usize,
    pub partial: usize,
}

/// Top-level `metadata.json` written into each archive.
#[derive(Debug, Serialize, Deserialize)]
struct ArchiveManifest {
    archive_id: String,
    policy_name: String,
    created_at: DateTime<Utc>,
    memory_count: usize,
    context_count: usize,
    relation_count: usize,
    /// id → title, a summary index for browsing without parsing every file.
    index: BTreeMap<i64, String>,
}

/// Creates, restores, verifies, and expires archives.
pub struct ArchivalManager {
    repo: Arc<Repository>,
    chunks: Arc<ChunkStore>,
    archive_dir: PathBuf,
    policies: parking_lot::RwLock<HashMap<String, ArchivePolicy>>,
    registry: Registry,
}

impl ArchivalManager {
    /// Open the manager, installing the default policy set when the config
    /// carries none.
    pub fn open(
        repo: Arc<Repository>,
        chunks: Arc<ChunkStore>,
        config: &ArchivalConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.archive_dir)?;
        let registry = Registry::open(&config.archive_dir)?;

        let mut policies = config.policies.clone();
        if policies.is_empty() {
            for policy in default_policies() {
                policies.insert(policy.name.clone(), policy);
            }
        }
        if !policies.contains_key("permanent") {
            let permanent = ArchivePolicy::named("permanent", None);
            policies.insert("permanent".to_string(), permanent);
        }

        Ok(Self {
            repo,
            chunks,
            archive_dir: config.archive_dir.clone(),
            policies: parking_lot::RwLock::new(policies),
            registry,
        })
    }

    // ---- policies ------------------------------------------------------

    pub fn policies(&self) -> Vec<ArchivePolicy> {
        self.policies.read().values().cloned().collect()
    }

    pub fn get_policy(&self, name: &str) -> Option<ArchivePolicy> {
        self.policies.read().get(name).cloned()
    }

    /// Add or replace a named policy.
    pub fn put_policy(&self, policy: ArchivePolicy) -> Result<()> {
        if policy.compression_level > 9 {
            return Err(MemoriaError::Config(format!(
                "archive compression level {} outside 0-9",
                policy.compression_level
            )));
        }
        self.policies.write().insert(policy.name.clone(), policy);
        Ok(())
    }

    /// Remove a policy. The permanent policy cannot be removed.
    pub fn delete_policy(&self, name: &str) -> Result<()> {
        if name == "permanent" {
            return Err(MemoriaError::Integrity(
                "the permanent policy cannot be deleted".into(),
            ));
        }
        self.policies
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MemoriaError::NotFound(format!("policy '{name}'")))
    }

    // ---- create --------------------------------------------------------

    /// Export the selected memories, pack them per the policy, checksum the
    /// pack, and register the archive.
    pub async fn create_archive(
        &self,
        policy_name: &str,
        selection: ArchiveSelection,
    ) -> Result<ArchiveRecord> {
        let policy = self
            .get_policy(policy_name)
            .ok_or_else(|| MemoriaError::Config(format!("unknown archive policy '{policy_name}'")))?;

        let memories = self.select(&policy, selection).await?;
        let archive_id = uuid::Uuid::new_v4().to_string();
        let staging = self.archive_dir.join(".staging").join(&archive_id);
        tokio::fs::create_dir_all(staging.join("memories")).await?;
        tokio::fs::create_dir_all(staging.join("contexts")).await?;
        tokio::fs::create_dir_all(staging.join("relations")).await?;

        // Export memories with decompressed content.
        let mut exported_bytes = 0u64;
        let mut index = BTreeMap::new();
        let mut context_ids: BTreeSet<i64> = BTreeSet::new();
        let selected_ids: BTreeSet<i64> = memories.iter().map(|m| m.id.0).collect();
        for memory in &memories {
            let content = self.chunks.load_content(memory).await?;
            let content = String::from_utf8_lossy(&content).into_owned();
            let mut export = MemoryExport::from_memory(memory, content);
            if !policy.include_metadata {
                export.memory_metadata = serde_json::Map::new();
            }
            let json = serde_json::to_vec_pretty(&export)?;
            exported_bytes += json.len() as u64;
            tokio::fs::write(
                staging.join("memories").join(format!("memory_{}.json", memory.id)),
                json,
            )
            .await?;
            index.insert(memory.id.0, memory.title.clone());
            if let Some(context_id) = memory.context_id {
                context_ids.insert(context_id.0);
            }
        }

        // Referenced contexts.
        let mut context_count = 0usize;
        if policy.include_contexts {
            for &context_id in &context_ids {
                match self.repo.get_context(ContextId(context_id)).await {
                    Ok(context) => {
                        let json =
                            serde_json::to_vec_pretty(&ContextExport::from_context(&context))?;
                        exported_bytes += json.len() as u64;
                        tokio::fs::write(
                            staging
                                .join("contexts")
                                .join(format!("context_{context_id}.json")),
                            json,
                        )
                        .await?;
                        context_count += 1;
                    }
                    Err(MemoriaError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        // Outbound relations of the selected set, grouped by source.
        let mut relation_count = 0usize;
        if policy.include_relations {
            let mut by_source: BTreeMap<i64, Vec<RelationExport>> = BTreeMap::new();
            for relation in self.repo.list_relations().await {
                if selected_ids.contains(&relation.source_memory_id.0) {
                    by_source
                        .entry(relation.source_memory_id.0)
                        .or_default()
                        .push(RelationExport::from_relation(&relation));
                }
            }
            for (source_id, relations) in by_source {
                relation_count += relations.len();
                let json = serde_json::to_vec_pretty(&relations)?;
                exported_bytes += json.len() as u64;
                tokio::fs::write(
                    staging
                        .join("relations")
                        .join(format!("relations_{source_id}.json")),
                    json,
                )
                .await?;
            }
        }

        let manifest = ArchiveManifest {
            archive_id: archive_id.clone(),
            policy_name: policy.name.clone(),
            created_at: Utc::now(),
            memory_count: memories.len(),
            context_count,
            relation_count,
            index,
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        exported_bytes += manifest_json.len() as u64;
        tokio::fs::write(staging.join("metadata.json"), manifest_json).await?;

        // Pack.
        let short_id: String = archive_id.chars().take(8).collect();
        let base_name = format!("archive_{}_{}", policy.name, short_id);
        let (pack_path, size_bytes, part_count) = match policy.format {
            ArchiveFormat::TarGz => {
                let pack_path = self.archive_dir.join(format!("{base_name}.tar.gz"));
                let level = if policy.compression_enabled {
                    policy.compression_level
                } else {
                    0
                };
                pack_tar_gz(&staging, &pack_path, level).await?;
                tokio::fs::remove_dir_all(&staging).await?;

                let packed = tokio::fs::metadata(&pack_path).await?.len();
                if policy.split_large_archives
                    && packed > policy.max_archive_size_mb * 1024 * 1024
                {
                    let (first, parts, total) =
                        split_pack(&pack_path, policy.max_archive_size_mb).await?;
                    (first, total, parts)
                } else {
                    (pack_path, packed, 1)
                }
            }
            ArchiveFormat::Directory => {
                let final_dir = self.archive_dir.join(&base_name);
                tokio::fs::rename(&staging, &final_dir).await?;
                let size = dir_size(final_dir.clone()).await?;
                (final_dir, size, 1)
            }
        };

        let checksum = checksum_path(&pack_path, policy.format).await?;
        let record = ArchiveRecord {
            archive_id: archive_id.clone(),
            policy_name: policy.name.clone(),
            created_at: Utc::now(),
            retention_until: policy
                .retention_days
                .map(|days| Utc::now() + Duration::days(i64::from(days))),
            size_bytes,
            memory_count: memories.len(),
            checksum,
            pack_path,
            status: ArchiveStatus::Completed,
            compression_ratio: ratio(exported_bytes, size_bytes),
            format: policy.format,
            part_count,
        };
        self.registry.put(record.clone()).await?;
        info!(
            %archive_id,
            memories = record.memory_count,
            bytes = record.size_bytes,
            "archive created"
        );

        if policy.checksum_verification {
            self.verify_archive(&archive_id).await?;
            return self
                .registry
                .get(&archive_id)
                .ok_or_else(|| MemoriaError::NotFound(format!("archive {archive_id}")));
        }
        Ok(record)
    }

    // ---- restore -------------------------------------------------------

    /// Re-insert an archive's rows through the repository. Rows whose ids
    /// already exist are skipped with a warning, making restore idempotent
    /// at the id level.
    pub async fn restore_archive(&self, archive_id: &str) -> Result<RestoreOutcome> {
        let record = self
            .registry
            .get(archive_id)
            .ok_or_else(|| MemoriaError::NotFound(format!("archive {archive_id}")))?;

        let (tree, scratch) = match record.format {
            ArchiveFormat::TarGz => {
                let scratch = self.archive_dir.join(".restore").join(archive_id);
                tokio::fs::create_dir_all(&scratch).await?;
                let pack = reassemble_parts(&record).await?;
                unpack_tar_gz(&pack.path, &scratch).await?;
                (scratch.clone(), Some((scratch, pack)))
            }
            ArchiveFormat::Directory => (record.pack_path.clone(), None),
        };

        let result = self.restore_tree(&tree).await;
        if let Some((scratch, _pack)) = scratch {
            let _ = tokio::fs::remove_dir_all(scratch).await;
        }
        let outcome = result?;
        info!(
            archive_id,
            restored = outcome.memories_restored,
            skipped = outcome.skipped,
            "archive restored"
        );
        Ok(outcome)
    }

    async fn restore_tree(&self, tree: &Path) -> Result<RestoreOutcome> {
        let mut outcome = RestoreOutcome::default();

        // Contexts first so memory back-links resolve.
        for export in read_exports::<ContextExport>(&tree.join("contexts")).await? {
            if self.repo.get_context(ContextId(export.id)).await.is_ok() {
                warn!(context_id = export.id, "context already exists, skipping");
                outcome.skipped += 1;
                continue;
            }
            let context = Context {
                id: ContextId(export.id),
                name: export.name,
                description: export.description,
                owner_id: export.owner_id,
                access_level: export.access_level,
                metadata: export.context_metadata,
                created_at: export.created_at,
                updated_at: export.updated_at,
                is_active: true,
            };
            let mut uow = self.repo.begin(&[]).await;
            uow.insert_context(context);
            uow.commit().await?;
            outcome.contexts_restored += 1;
        }

        for export in read_exports::<MemoryExport>(&tree.join("memories")).await? {
            let id = MemoryId(export.id);
            if self.repo.memory_exists(id).await {
                warn!(memory_id = export.id, "memory already exists, skipping");
                outcome.skipped += 1;
                continue;
            }
            let mut context_id = export.context_id.map(ContextId);
            if let Some(ctx) = context_id {
                if self.repo.get_context(ctx).await.is_err() {
                    warn!(
                        memory_id = export.id,
                        context_id = ctx.0,
                        "restored memory references a missing context, detaching"
                    );
                    context_id = None;
                }
            }
            let content = export.content.into_bytes();
            let mut memory = Memory::new(export.owner_id, export.title);
            memory.id = id;
            memory.content_size = content.len() as u64;
            memory.content = content;
            memory.context_id = context_id;
            memory.access_level = export.access_level;
            memory.metadata = export.memory_metadata;
            memory.created_at = export.created_at;
            memory.updated_at = export.updated_at;

            let mut uow = self.repo.begin(&[id]).await;
            uow.insert_memory(memory);
            uow.commit().await?;
            outcome.memories_restored += 1;
        }

        for export in read_relation_exports(&tree.join("relations")).await? {
            if self.repo.get_relation(RelationId(export.id)).await.is_ok() {
                warn!(relation_id = export.id, "relation already exists, skipping");
                outcome.skipped += 1;
                continue;
            }
            let source = MemoryId(export.source_memory_id);
            let target = MemoryId(export.target_memory_id);
            if !self.repo.memory_exists(source).await || !self.repo.memory_exists(target).await {
                warn!(
                    relation_id = export.id,
                    "relation endpoint missing after restore, skipping"
                );
                outcome.skipped += 1;
                continue;
            }
            let relation = Relation {
                id: RelationId(export.id),
                name: export.name,
                source_memory_id: source,
                target_memory_id: target,
                strength: export.strength,
                metadata: export.relation_metadata,
                owner_id: export.owner_id,
                created_at: export.created_at,
                updated_at: export.updated_at,
            };
            let mut uow = self.repo.begin(&[source, target]).await;
            uow.insert_relation(relation);
            uow.commit().await?;
            outcome.relations_restored += 1;
        }

        Ok(outcome)
    }

    // ---- verify / cleanup ----------------------------------------------

    /// Recompute the checksum and run a format-level integrity test,
    /// transitioning the record to `Verified` or `Corrupted`.
    pub async fn verify_archive(&self, archive_id: &str) -> Result<ArchiveStatus> {
        let mut record = self
            .registry
            .get(archive_id)
            .ok_or_else(|| MemoriaError::NotFound(format!("archive {archive_id}")))?;

        let checksum_ok = match checksum_path(&record.pack_path, record.format).await {
            Ok(actual) => actual == record.checksum,
            Err(_) => false,
        };
        let format_ok = checksum_ok && self.format_test(&record).await;

        record.status = if checksum_ok && format_ok {
            ArchiveStatus::Verified
        } else {
            warn!(archive_id, checksum_ok, format_ok, "archive failed verification");
            ArchiveStatus::Corrupted
        };
        let status = record.status;
        self.registry.put(record).await?;
        Ok(status)
    }

    async fn format_test(&self, record: &ArchiveRecord) -> bool {
        match record.format {
            ArchiveFormat::TarGz => match reassemble_parts(record).await {
                Ok(pack) => walk_tar_gz(&pack.path).await.is_ok(),
                Err(_) => false,
            },
            ArchiveFormat::Directory => {
                record.pack_path.is_dir() && record.pack_path.join("metadata.json").is_file()
            }
        }
    }

    /// Delete every archive past its retention that is not permanent.
    /// Corrupted archives are left in place for manual inspection.
    pub async fn cleanup_expired(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut removed = Vec::new();
        for record in self.registry.list() {
            if !record.is_expired(now) || record.status == ArchiveStatus::Corrupted {
                continue;
            }
            self.remove_files(&record).await?;
            self.registry.remove(&record.archive_id).await?;
            removed.push(record.archive_id);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "expired archives cleaned up");
        }
        Ok(removed)
    }

    /// Delete one archive. With `verify_checksum` the pack must pass its
    /// checksum first, so a corrupt archive is never silently discarded.
    pub async fn delete_archive(&self, archive_id: &str, verify_checksum: bool) -> Result<()> {
        let record = self
            .registry
            .get(archive_id)
            .ok_or_else(|| MemoriaError::NotFound(format!("archive {archive_id}")))?;
        if verify_checksum {
            let actual = checksum_path(&record.pack_path, record.format).await?;
            if actual != record.checksum {
                return Err(MemoriaError::Corruption(format!(
                    "archive {archive_id} failed its checksum; refusing to delete"
                )));
            }
        }
        self.remove_files(&record).await?;
        self.registry.remove(archive_id).await
    }

    pub fn list_archives(
        &self,
        policy: Option<&str>,
        status: Option<ArchiveStatus>,
    ) -> Vec<ArchiveRecord> {
        self.registry
            .list()
            .into_iter()
            .filter(|r| policy.map_or(true, |p| r.policy_name == p))
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect()
    }

    pub fn get_archive(&self, archive_id: &str) -> Option<ArchiveRecord> {
        self.registry.get(archive_id)
    }

    pub fn statistics(&self) -> ArchiveStatistics {
        let mut stats = ArchiveStatistics::default();
        for record in self.registry.list() {
            stats.archive_count += 1;
            stats.total_size_bytes += record.size_bytes;
            stats.total_memories += record.memory_count;
            match record.status {
                ArchiveStatus::Completed => stats.completed += 1,
                ArchiveStatus::Verified => stats.verified += 1,
                ArchiveStatus::Corrupted => stats.corrupted += 1,
                ArchiveStatus::Partial => stats.partial += 1,
            }
        }
        stats
    }

    // ---- internals -----------------------------------------------------

    async fn select(
        &self,
        policy: &ArchivePolicy,
        selection: ArchiveSelection,
    ) -> Result<Vec<Memory>> {
        match selection {
            ArchiveSelection::Ids(ids) => {
                let mut memories = Vec::with_capacity(ids.len());
                for id in ids {
                    memories.push(self.repo.get_memory(id).await?);
                }
                Ok(memories)
            }
            ArchiveSelection::CreatedBetween(from, to) => Ok(self
                .repo
                .list_memories()
                .await
                .into_iter()
                .filter(|m| m.created_at >= from && m.created_at <= to)
                .collect()),
            ArchiveSelection::OlderThanRetention => {
                let days = policy.retention_days.unwrap_or(0);
                let cutoff = Utc::now() - Duration::days(i64::from(days));
                Ok(self
                    .repo
                    .list_memories()
                    .await
                    .into_iter()
                    .filter(|m| m.last_accessed.unwrap_or(m.created_at) <= cutoff)
                    .collect())
            }
        }
    }

    async fn remove_files(&self, record: &ArchiveRecord) -> Result<()> {
        match record.format {
            ArchiveFormat::TarGz => {
                for path in part_paths(record) {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            ArchiveFormat::Directory => {
                if record.pack_path.exists() {
                    tokio::fs::remove_dir_all(&record.pack_path).await?;
                }
            }
        }
        Ok(())
    }
}

fn default_policies() -> Vec<ArchivePolicy> {
    let mut default = ArchivePolicy::named("default", Some(365));
    default.description = "Standard yearly retention".to_string();
    let mut permanent = ArchivePolicy::named("permanent", None);
    permanent.description = "Never cleaned up".to_string();
    let mut temporary = ArchivePolicy::named("temporary", Some(30));
    temporary.description = "Short-lived exports".to_string();
    vec![default, permanent, temporary]
}

fn ratio(original: u64, packed: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    (1.0 - packed as f64 / original as f64).max(0.0)
}

/// Paths of every part of a (possibly multi-part) tar.gz archive.
fn part_paths(record: &ArchiveRecord) -> Vec<PathBuf> {
    if record.part_count <= 1 {
        return vec![record.pack_path.clone()];
    }
    let first = record.pack_path.to_string_lossy();
    let Some(stem) = first.strip_suffix("_part1.tar.gz") else {
        return vec![record.pack_path.clone()];
    };
    (1..=record.part_count)
        .map(|n| PathBuf::from(format!("{stem}_part{n}.tar.gz")))
        .collect()
}

/// A reassembled pack file; temporary when the archive was split.
struct PackHandle {
    path: PathBuf,
    temp: Option<PathBuf>,
}

impl Drop for PackHandle {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            let _ = std::fs::remove_file(temp);
        }
    }
}

async fn reassemble_parts(record: &ArchiveRecord) -> Result<PackHandle> {
    if record.part_count <= 1 {
        return Ok(PackHandle {
            path: record.pack_path.clone(),
            temp: None,
        });
    }
    let joined = record.pack_path.with_extension("joined");
    let mut bytes = Vec::with_capacity(record.size_bytes as usize);
    for path in part_paths(record) {
        bytes.extend(tokio::fs::read(&path).await?);
    }
    tokio::fs::write(&joined, bytes).await?;
    Ok(PackHandle {
        path: joined.clone(),
        temp: Some(joined),
    })
}

async fn pack_tar_gz(staging: &Path, pack_path: &Path, level: u32) -> Result<()> {
    let staging = staging.to_path_buf();
    let pack_path = pack_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::File::create(&pack_path)?;
        let encoder = GzEncoder::new(file, GzLevel::new(level));
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", &staging)?;
        builder.into_inner()?.finish()?.sync_all()?;
        Ok(())
    })
    .await
    .map_err(|e| MemoriaError::Transient(format!("pack task failed: {e}")))??;
    Ok(())
}

async fn unpack_tar_gz(pack_path: &Path, dest: &Path) -> Result<()> {
    let pack_path = pack_path.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::File::open(&pack_path)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.unpack(&dest)
    })
    .await
    .map_err(|e| MemoriaError::Transient(format!("unpack task failed: {e}")))?
    .map_err(|e| MemoriaError::Corruption(format!("archive failed to unpack: {e}")))?;
    Ok(())
}

/// Walk every entry, fully reading each; any decode error fails the test.
async fn walk_tar_gz(pack_path: &Path) -> Result<()> {
    let pack_path = pack_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::File::open(&pack_path)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        for entry in archive.entries()? {
            let mut entry = entry?;
            std::io::copy(&mut entry, &mut std::io::sink())?;
        }
        Ok(())
    })
    .await
    .map_err(|e| MemoriaError::Transient(format!("verify task failed: {e}")))?
    .map_err(|e| MemoriaError::Corruption(format!("archive failed its format test: {e}")))
}

/// Split an oversized pack into `_partN` files; returns the first part's
/// path, the part count, and the total size.
async fn split_pack(pack_path: &Path, max_mb: u64) -> Result<(PathBuf, u32, u64)> {
    let bytes = tokio::fs::read(pack_path).await?;
    let total = bytes.len() as u64;
    let part_size = (max_mb * 1024 * 1024) as usize;
    let base = pack_path.to_string_lossy();
    let stem = base
        .strip_suffix(".tar.gz")
        .ok_or_else(|| MemoriaError::Integrity("pack file missing .tar.gz suffix".into()))?
        .to_string();

    let mut first = PathBuf::new();
    let mut part_count = 0u32;
    for (index, chunk) in bytes.chunks(part_size).enumerate() {
        let part = PathBuf::from(format!("{stem}_part{}.tar.gz", index + 1));
        tokio::fs::write(&part, chunk).await?;
        if index == 0 {
            first = part;
        }
        part_count += 1;
    }
    tokio::fs::remove_file(pack_path).await?;
    info!(parts = part_count, "archive split into parts");
    Ok((first, part_count, total))
}

async fn checksum_path(path: &Path, format: ArchiveFormat) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        match format {
            ArchiveFormat::TarGz => {
                let bytes = std::fs::read(&path)?;
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                Ok(hex::encode(hasher.finalize()))
            }
            ArchiveFormat::Directory => dir_checksum(&path),
        }
    })
    .await
    .map_err(|e| MemoriaError::Transient(format!("checksum task failed: {e}")))?
    .map_err(MemoriaError::from)
}

/// Deterministic digest over a directory: sorted relative paths and file
/// contents.
fn dir_checksum(dir: &Path) -> std::io::Result<String> {
    fn collect(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.metadata()?.is_dir() {
                collect(root, &entry.path(), files)?;
            } else {
                files.push(entry.path());
            }
        }
        Ok(())
    }
    let mut files = Vec::new();
    collect(dir, dir, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for file in files {
        let relative = file.strip_prefix(dir).unwrap_or(&file);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(std::fs::read(&file)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn dir_size(dir: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
        fn walk(dir: &Path) -> std::io::Result<u64> {
            let mut total = 0;
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                total += if meta.is_dir() { walk(&entry.path())? } else { meta.len() };
            }
            Ok(total)
        }
        walk(&dir)
    })
    .await
    .map_err(|e| MemoriaError::Transient(format!("size task failed: {e}")))?
    .map_err(MemoriaError::from)
}

async fn read_exports<T: for<'de> Deserialize<'de>>(dir: &Path) -> Result<Vec<T>> {
    let mut exports = Vec::new();
    if !dir.exists() {
        return Ok(exports);
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    entries.sort();
    for path in entries {
        let bytes = tokio::fs::read(&path).await?;
        let export = serde_json::from_slice(&bytes).map_err(|e| {
            MemoriaError::Corruption(format!("export {} failed to decode: {e}", path.display()))
        })?;
        exports.push(export);
    }
    Ok(exports)
}

async fn read_relation_exports(dir: &Path) -> Result<Vec<RelationExport>> {
    let grouped: Vec<Vec<RelationExport>> = read_exports(dir).await?;
    Ok(grouped.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoria_core::{ChunkingConfig, CompressionConfig};
    use memoria_storage::CodecPipeline;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: Arc<Repository>,
        manager: ArchivalManager,
    }

    async fn setup() -> Fixture {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("db")).await.unwrap();
        let chunks = Arc::new(ChunkStore::new(
            Arc::clone(&repo),
            CodecPipeline::from_config(&CompressionConfig::default()),
            &ChunkingConfig::default(),
        ));
        let config = ArchivalConfig {
            archive_dir: dir.path().join("archives"),
            policies: HashMap::new(),
        };
        let manager = ArchivalManager::open(Arc::clone(&repo), chunks, &config).unwrap();
        Fixture {
            _dir: dir,
            repo,
            manager,
        }
    }

    async fn seed_memories(repo: &Arc<Repository>, count: usize) -> Vec<Memory> {
        let mut memories = Vec::new();
        for i in 0..count {
            let memory = repo
                .create_memory(
                    Memory::new(1, format!("memory {i}"))
                        .content(format!("content of memory {i}").into_bytes()),
                )
                .await
                .unwrap();
            memories.push(memory);
        }
        memories
    }

    #[tokio::test]
    async fn archive_round_trip_restores_all_rows() {
        let fixture = setup().await;
        let memories = seed_memories(&fixture.repo, 20).await;
        let ids: Vec<MemoryId> = memories.iter().map(|m| m.id).collect();
        fixture
            .repo
            .create_relation(Relation::new(1, "next", ids[0], ids[1]))
            .await
            .unwrap();

        let record = fixture
            .manager
            .create_archive("default", ArchiveSelection::Ids(ids.clone()))
            .await
            .unwrap();
        assert_eq!(record.memory_count, 20);
        assert_eq!(record.status, ArchiveStatus::Verified);

        // Delete the originals, then restore.
        for &id in &ids {
            fixture.repo.delete_memory(id).await.unwrap();
        }
        assert_eq!(fixture.repo.count_memories().await, 0);

        let outcome = fixture
            .manager
            .restore_archive(&record.archive_id)
            .await
            .unwrap();
        assert_eq!(outcome.memories_restored, 20);
        assert_eq!(outcome.relations_restored, 1);

        for original in &memories {
            let restored = fixture.repo.get_memory(original.id).await.unwrap();
            assert_eq!(restored.title, original.title);
            assert_eq!(restored.owner_id, original.owner_id);
            assert_eq!(restored.created_at, original.created_at);
            assert_eq!(restored.content, original.content);
        }
    }

    #[tokio::test]
    async fn restore_is_idempotent_at_the_id_level() {
        let fixture = setup().await;
        let memories = seed_memories(&fixture.repo, 3).await;
        let ids: Vec<MemoryId> = memories.iter().map(|m| m.id).collect();

        let record = fixture
            .manager
            .create_archive("default", ArchiveSelection::Ids(ids))
            .await
            .unwrap();

        // Nothing was deleted: everything is skipped.
        let outcome = fixture
            .manager
            .restore_archive(&record.archive_id)
            .await
            .unwrap();
        assert_eq!(outcome.memories_restored, 0);
        assert_eq!(outcome.skipped, 3);
        assert_eq!(fixture.repo.count_memories().await, 3);
    }

    #[tokio::test]
    async fn tampered_pack_fails_verification() {
        let fixture = setup().await;
        let memories = seed_memories(&fixture.repo, 2).await;
        let record = fixture
            .manager
            .create_archive(
                "default",
                ArchiveSelection::Ids(memories.iter().map(|m| m.id).collect()),
            )
            .await
            .unwrap();

        // Flip one byte in the pack file.
        let mut bytes = std::fs::read(&record.pack_path).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xFF;
        std::fs::write(&record.pack_path, bytes).unwrap();

        let status = fixture
            .manager
            .verify_archive(&record.archive_id)
            .await
            .unwrap();
        assert_eq!(status, ArchiveStatus::Corrupted);

        // Corrupted archives survive cleanup even when expired.
        let removed = fixture.manager.cleanup_expired().await.unwrap();
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn retention_zero_expires_immediately_but_permanent_does_not() {
        let fixture = setup().await;
        seed_memories(&fixture.repo, 2).await;
        let ids: Vec<MemoryId> = fixture
            .repo
            .list_memories()
            .await
            .iter()
            .map(|m| m.id)
            .collect();

        let mut instant = ArchivePolicy::named("instant", Some(0));
        instant.checksum_verification = false;
        fixture.manager.put_policy(instant).unwrap();

        let expired = fixture
            .manager
            .create_archive("instant", ArchiveSelection::Ids(ids.clone()))
            .await
            .unwrap();
        let kept = fixture
            .manager
            .create_archive("permanent", ArchiveSelection::Ids(ids))
            .await
            .unwrap();

        let removed = fixture.manager.cleanup_expired().await.unwrap();
        assert_eq!(removed, vec![expired.archive_id.clone()]);
        assert!(fixture.manager.get_archive(&expired.archive_id).is_none());
        assert!(fixture.manager.get_archive(&kept.archive_id).is_some());
        assert!(!expired.pack_path.exists());
    }

    #[tokio::test]
    async fn directory_format_round_trips() {
        let fixture = setup().await;
        let memories = seed_memories(&fixture.repo, 4).await;
        let ids: Vec<MemoryId> = memories.iter().map(|m| m.id).collect();

        let mut policy = ArchivePolicy::named("dir", Some(365));
        policy.format = ArchiveFormat::Directory;
        fixture.manager.put_policy(policy).unwrap();

        let record = fixture
            .manager
            .create_archive("dir", ArchiveSelection::Ids(ids.clone()))
            .await
            .unwrap();
        assert!(record.pack_path.is_dir());
        assert_eq!(record.status, ArchiveStatus::Verified);

        for &id in &ids {
            fixture.repo.delete_memory(id).await.unwrap();
        }
        let outcome = fixture
            .manager
            .restore_archive(&record.archive_id)
            .await
            .unwrap();
        assert_eq!(outcome.memories_restored, 4);
    }

    #[tokio::test]
    async fn oversized_archive_splits_into_parts() {
        let fixture = setup().await;
        // Incompressible content keeps the pack big.
        use rand::RngCore as _;
        let mut blob = vec![0u8; 3 * 1024 * 1024];
        rand::thread_rng().fill_bytes(&mut blob);
        let blob = blob.iter().map(|b| (b % 64 + 32) as u8 as char).collect::<String>();
        let memory = fixture
            .repo
            .create_memory(Memory::new(1, "big").content(blob.into_bytes()))
            .await
            .unwrap();

        let mut policy = ArchivePolicy::named("split", Some(365));
        policy.split_large_archives = true;
        policy.max_archive_size_mb = 1;
        fixture.manager.put_policy(policy).unwrap();

        let record = fixture
            .manager
            .create_archive("split", ArchiveSelection::Ids(vec![memory.id]))
            .await
            .unwrap();
        assert!(record.part_count > 1);
        assert!(record
            .pack_path
            .to_string_lossy()
            .ends_with("_part1.tar.gz"));
        assert_eq!(record.status, ArchiveStatus::Verified);

        fixture.repo.delete_memory(memory.id).await.unwrap();
        let outcome = fixture
            .manager
            .restore_archive(&record.archive_id)
            .await
            .unwrap();
        assert_eq!(outcome.memories_restored, 1);
    }

    #[tokio::test]
    async fn unknown_policy_is_a_config_error() {
        let fixture = setup().await;
        let err = fixture
            .manager
            .create_archive("no-such-policy", ArchiveSelection::Ids(vec![]))
            .await;
        assert!(matches!(err, Err(MemoriaError::Config(_))));
    }

    #[tokio::test]
    async fn permanent_policy_is_undeletable() {
        let fixture = setup().await;
        assert!(fixture.manager.delete_policy("permanent").is_err());
        assert!(fixture.manager.delete_policy("temporary").is_ok());
    }
}
