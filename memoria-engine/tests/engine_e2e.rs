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

//! End-to-end scenarios across the whole engine.

use memoria_core::{
    AccessLevel, ArchivePolicy, BackendDescriptor, BackendKind, DedupStrategy, EngineConfig,
    MemoriaError, RouterConfig,
};
use memoria_engine::{
    split_chapters, ArchiveSelection, LoadMode, MemoryEngine, MemoryEngineBuilder, MemoryPatch,
    MergeStrategy, NewMemory, OpContext, Relation, SearchFilters,
};
use memoria_storage::{MemoryBackend, StorageBackend, StorageRouter};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn base_config(dir: &TempDir) -> EngineConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut config = EngineConfig::default();
    config.data_dir = memoria_core::config::DataDir(dir.path().to_path_buf());
    config.archival.archive_dir = dir.path().join("archives");
    config
}

async fn open_engine(dir: &TempDir) -> MemoryEngine {
    MemoryEngine::open(base_config(dir)).await.unwrap()
}

/// Engine wired to two injected in-memory tiers so tests can kill and
/// tamper with individual replicas.
async fn open_replicated_engine(
    dir: &TempDir,
) -> (MemoryEngine, Arc<MemoryBackend>, Arc<MemoryBackend>) {
    let a = Arc::new(MemoryBackend::new("a"));
    let b = Arc::new(MemoryBackend::new("b"));
    let router_config = RouterConfig {
        redundancy_factor: 2,
        retry_attempts: 1,
        ..RouterConfig::default()
    };
    let router = StorageRouter::with_backends(
        vec![
            (
                BackendDescriptor::new("a", BackendKind::Memory, 0),
                a.clone() as Arc<dyn StorageBackend>,
            ),
            (
                BackendDescriptor::new("b", BackendKind::Memory, 1),
                b.clone() as Arc<dyn StorageBackend>,
            ),
        ],
        &router_config,
        dir.path(),
    )
    .unwrap();
    let engine = MemoryEngineBuilder::new(base_config(dir))
        .router(Arc::new(router))
        .build()
        .await
        .unwrap();
    (engine, a, b)
}

fn book_text(chapters: usize, chapter_bytes: usize) -> String {
    let mut text = String::new();
    for n in 1..=chapters {
        text.push_str(&format!("Chapter {n}: Part {n}\n"));
        let line = format!("Paragraph text for chapter {n}, full of repeated words. ");
        let start = text.len();
        while text.len() - start < chapter_bytes {
            text.push_str(&line);
            text.push('\n');
        }
    }
    text
}

#[tokio::test]
async fn chunked_book_round_trips_byte_exact() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    config.chunked_storage.enabled = true;
    config.chunked_storage.chunk_size = 10_000;
    let engine = MemoryEngine::open(config).await.unwrap();
    let ctx = OpContext::unbounded();

    // ~500 KB across 10 chapters.
    let text = book_text(10, 50_000);
    assert!(text.len() >= 400_000);
    let expected = split_chapters("Big Book", &text);
    assert_eq!(expected.len(), 10);

    let report = engine
        .ingest_book(&ctx, 1, "Big Book", &text, None, None)
        .await
        .unwrap();
    assert_eq!(report.chapter_ids.len(), 10);
    // Spine of "next" edges plus a "contains" edge per chapter.
    assert_eq!(report.relations_created, 10 + 9);

    for (chapter, &id) in expected.iter().zip(&report.chapter_ids) {
        let loaded = engine
            .get_memory(&ctx, None, id, LoadMode::Eager)
            .await
            .unwrap();
        assert_eq!(loaded.content, chapter.body.as_bytes());
        assert_eq!(loaded.title, chapter.title);

        let info = engine.chunk_info(id).await;
        assert!(info.chunk_count <= 50, "chunk count {}", info.chunk_count);
        assert!(info.chunk_count >= 1);
        assert_eq!(info.total_original_size, chapter.body.len() as u64);
    }

    let next_edges = engine
        .find_relations_by_strength(&ctx, 0.0, 1.0)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.name == "next")
        .count();
    assert_eq!(next_edges, 9);
}

#[tokio::test]
async fn replicated_write_survives_primary_outage() {
    let dir = TempDir::new().unwrap();
    let (engine, a, _b) = open_replicated_engine(&dir).await;
    let ctx = OpContext::unbounded();

    let options = engine.default_options().external(true);
    let memory = engine
        .create_memory(&ctx, NewMemory::new(1, "greeting", "hello"), Some(options))
        .await
        .unwrap();
    assert!(memory.external_locator.is_some());

    a.set_healthy(false);
    let loaded = engine
        .get_memory(&ctx, None, memory.id, LoadMode::Eager)
        .await
        .unwrap();
    assert_eq!(loaded.content, b"hello");
}

#[tokio::test]
async fn corrupt_primary_copy_fails_over_and_is_marked() {
    let dir = TempDir::new().unwrap();
    let (engine, a, _b) = open_replicated_engine(&dir).await;
    let ctx = OpContext::unbounded();

    let options = engine.default_options().external(true).compress(false);
    let memory = engine
        .create_memory(
            &ctx,
            NewMemory::new(1, "precious", "do not lose me"),
            Some(options),
        )
        .await
        .unwrap();
    let file_id = memory.external_locator.clone().unwrap();

    assert!(a.tamper(&file_id, |bytes| bytes[0] ^= 0xFF));

    let loaded = engine
        .get_memory(&ctx, None, memory.id, LoadMode::Eager)
        .await
        .unwrap();
    assert_eq!(loaded.content, b"do not lose me");

    // The primary's copy is marked corrupt in the metadata cache.
    let entry = engine.router().unwrap().file_entry(&file_id).unwrap();
    assert!(entry.corrupt_backends.contains(&"a".to_string()));
    assert!(!entry.backends.contains(&"a".to_string()));
}

#[tokio::test]
async fn archival_round_trip_reinstates_every_row() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ctx = OpContext::unbounded();

    let mut originals = Vec::new();
    for i in 0..100 {
        let memory = engine
            .create_memory(
                &ctx,
                NewMemory::new(1, format!("note {i}"), format!("body of note {i}")),
                None,
            )
            .await
            .unwrap();
        originals.push(memory);
    }

    engine
        .archival()
        .put_policy(ArchivePolicy::named("flush", Some(0)))
        .unwrap();
    let ids: Vec<_> = originals.iter().map(|m| m.id).collect();
    let record = engine
        .create_archive(&ctx, "flush", ArchiveSelection::Ids(ids.clone()))
        .await
        .unwrap();
    assert_eq!(record.memory_count, 100);

    for &id in &ids {
        engine.delete_memory(&ctx, None, id).await.unwrap();
    }
    assert_eq!(engine.statistics().await.repository.memory_count, 0);

    let outcome = engine.restore_archive(&ctx, &record.archive_id).await.unwrap();
    assert_eq!(outcome.memories_restored, 100);

    for original in &originals {
        let restored = engine
            .get_memory(&ctx, None, original.id, LoadMode::Eager)
            .await
            .unwrap();
        assert_eq!(restored.title, original.title);
        assert_eq!(restored.content, original.content);
        assert_eq!(restored.owner_id, original.owner_id);
        assert_eq!(restored.created_at, original.created_at);
    }
}

#[tokio::test]
async fn exact_dedup_merges_five_copies_to_one_survivor() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ctx = OpContext::unbounded();

    let mut copies = Vec::new();
    for i in 0..5 {
        let memory = engine
            .create_memory(
                &ctx,
                NewMemory::new(1, format!("copy {i}"), "the same content in every copy"),
                None,
            )
            .await
            .unwrap();
        copies.push(memory);
    }
    let outside = engine
        .create_memory(&ctx, NewMemory::new(1, "other", "different content"), None)
        .await
        .unwrap();
    engine
        .create_relation(&ctx, Relation::new(1, "related", outside.id, copies[0].id))
        .await
        .unwrap();

    let groups = engine
        .find_duplicates(&ctx, Some(DedupStrategy::ContentHash))
        .await
        .unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].memory_ids.len(), 5);

    let outcome = engine
        .merge_duplicates(&ctx, &groups[0], MergeStrategy::KeepLatest)
        .await
        .unwrap();
    assert_eq!(outcome.survivor, copies[4].id);
    assert_eq!(outcome.removed.len(), 4);

    // The outside relation now points at the survivor; no dangling edges.
    let relations = engine.relations_for_memory(&ctx, outcome.survivor).await.unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].source_memory_id, outside.id);
    assert_eq!(relations[0].target_memory_id, outcome.survivor);
    assert_eq!(engine.statistics().await.repository.memory_count, 2);
}

#[tokio::test]
async fn adaptive_compression_compresses_text_and_skips_random_bytes() {
    use rand::RngCore;
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ctx = OpContext::unbounded();

    let text = "a very compressible sentence, over and over. ".repeat(230);
    assert!(text.len() >= 10_000);
    let compressible = engine
        .create_memory(&ctx, NewMemory::new(1, "text", text.clone()), None)
        .await
        .unwrap();
    let stored = engine
        .repository()
        .get_memory(compressible.id)
        .await
        .unwrap();
    assert!(stored.content_compressed);
    let ratio = 1.0 - stored.content.len() as f64 / text.len() as f64;
    assert!(ratio > 0.5, "ratio {ratio}");

    let mut random = vec![0u8; 10_240];
    rand::thread_rng().fill_bytes(&mut random);
    let incompressible = engine
        .create_memory(&ctx, NewMemory::new(1, "noise", random.clone()), None)
        .await
        .unwrap();
    let stored = engine
        .repository()
        .get_memory(incompressible.id)
        .await
        .unwrap();
    assert!(!stored.content_compressed);
    assert_eq!(stored.content, random);

    // Either way the logical content round-trips.
    let loaded = engine
        .get_memory(&ctx, None, compressible.id, LoadMode::Eager)
        .await
        .unwrap();
    assert_eq!(loaded.content, text.as_bytes());
}

#[tokio::test]
async fn lazy_read_returns_preview_until_promoted() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ctx = OpContext::unbounded();

    let body = "x".repeat(5_000);
    let memory = engine
        .create_memory(&ctx, NewMemory::new(1, "big note", body.clone()), None)
        .await
        .unwrap();

    let mut lazy = engine
        .get_memory(&ctx, None, memory.id, LoadMode::Lazy)
        .await
        .unwrap();
    assert!(!lazy.content_loaded);
    assert_eq!(lazy.content.len(), 100); // preview_length default
    assert_eq!(lazy.content_size, 5_000);

    engine.load_full_content(&ctx, &mut lazy).await.unwrap();
    assert!(lazy.content_loaded);
    assert_eq!(lazy.content, body.as_bytes());
}

#[tokio::test]
async fn access_levels_gate_reads() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ctx = OpContext::unbounded();

    let secret = engine
        .create_memory(
            &ctx,
            NewMemory::new(1, "secret", "classified").access_level(AccessLevel::Privileged),
            None,
        )
        .await
        .unwrap();

    let user = memoria_engine::Accessor::new(2, AccessLevel::User);
    let err = engine
        .get_memory(&ctx, Some(&user), secret.id, LoadMode::Eager)
        .await;
    assert!(matches!(err, Err(MemoriaError::NotFound(_))));

    let admin = memoria_engine::Accessor::admin(3);
    let loaded = engine
        .get_memory(&ctx, Some(&admin), secret.id, LoadMode::Eager)
        .await
        .unwrap();
    assert_eq!(loaded.content, b"classified");
}

#[tokio::test]
async fn search_filters_combine_and_respect_access() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ctx = OpContext::unbounded();

    engine
        .create_memory(&ctx, NewMemory::new(1, "Rust notes", "ownership and borrowing"), None)
        .await
        .unwrap();
    engine
        .create_memory(&ctx, NewMemory::new(2, "Rust tips", "lifetimes everywhere"), None)
        .await
        .unwrap();

    let hits = engine
        .search_memories(&ctx, None, "rust", SearchFilters::default(), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|m| !m.content_loaded));

    let filters = SearchFilters {
        owner_id: Some(2),
        ..SearchFilters::default()
    };
    let hits = engine
        .search_memories(&ctx, None, "rust", filters, 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].title, "Rust tips");
}

#[tokio::test]
async fn bulk_create_reports_and_respects_high_water_mark() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    config.bulk.high_water_mark = 10;
    let engine = MemoryEngine::open(config).await.unwrap();
    let ctx = OpContext::unbounded();

    let items: Vec<NewMemory> = (0..8)
        .map(|i| NewMemory::new(1, format!("bulk {i}"), format!("content {i}")))
        .collect();
    let report = engine.bulk_create(&ctx, items, None).await.unwrap();
    assert_eq!(report.migrated.len(), 8);
    assert_eq!(report.failed, 0);

    let too_many: Vec<NewMemory> = (0..11)
        .map(|i| NewMemory::new(1, format!("flood {i}"), "x"))
        .collect();
    let err = engine.bulk_create(&ctx, too_many, None).await;
    assert!(matches!(err, Err(MemoriaError::Transient(_))));
}

#[tokio::test]
async fn expired_deadline_cancels_before_any_write() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;

    let ctx = OpContext::with_timeout(Duration::from_secs(0));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let err = engine
        .create_memory(&ctx, NewMemory::new(1, "late", "too late"), None)
        .await;
    assert!(matches!(err, Err(MemoriaError::Cancelled(_))));
    assert_eq!(engine.statistics().await.repository.memory_count, 0);
}

#[tokio::test]
async fn update_rewrites_content_and_bumps_version() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    config.chunked_storage.enabled = true;
    config.chunked_storage.chunk_size = 100;
    let engine = MemoryEngine::open(config).await.unwrap();
    let ctx = OpContext::unbounded();

    let memory = engine
        .create_memory(&ctx, NewMemory::new(1, "doc", vec![b'a'; 350]), None)
        .await
        .unwrap();
    assert!(engine.chunk_info(memory.id).await.chunk_count >= 3);

    let patch = MemoryPatch {
        content: Some(vec![b'b'; 150]),
        ..MemoryPatch::default()
    };
    let updated = engine
        .update_memory(&ctx, None, memory.id, patch, None)
        .await
        .unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.content, vec![b'b'; 150]);

    let loaded = engine
        .get_memory(&ctx, None, memory.id, LoadMode::Eager)
        .await
        .unwrap();
    assert_eq!(loaded.content, vec![b'b'; 150]);
    assert_eq!(engine.chunk_info(memory.id).await.chunk_count, 2);
}

#[tokio::test]
async fn context_cascade_rules_hold_through_the_facade() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir).await;
    let ctx = OpContext::unbounded();

    let bucket = engine
        .create_context(&ctx, memoria_engine::Context::new(1, "bucket"))
        .await
        .unwrap();
    let member = engine
        .create_memory(
            &ctx,
            NewMemory::new(1, "member", "in the bucket").context(bucket.id),
            None,
        )
        .await
        .unwrap();

    let err = engine.delete_context(&ctx, bucket.id, false).await;
    assert!(matches!(err, Err(MemoriaError::Integrity(_))));

    engine.delete_context(&ctx, bucket.id, true).await.unwrap();
    let detached = engine
        .get_memory(&ctx, None, member.id, LoadMode::Lazy)
        .await
        .unwrap();
    assert_eq!(detached.context_id, None);
}
