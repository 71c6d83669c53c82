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

//! Storage router: decides which backends hold each object, replicates
//! writes until the redundancy factor is met, and routes reads to the
//! fastest healthy copy.
//!
//! Reads verify the stored checksum; a mismatch marks that copy corrupt in
//! the metadata cache and fails over to the next backend. A successful read
//! from a non-primary backend triggers an asynchronous repair write to the
//! primary when the primary is healthy but missing the object.
//!
//! The metadata cache is guarded by a mutex held only for map access, never
//! across I/O, and is persisted via rename-over-temp.

use crate::backend::{build_backend, BackendStats, StorageBackend};
use crate::chunk::sha256_hex;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use memoria_core::{BackendDescriptor, CompressionTag, MemoriaError, Result, RouterConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const METADATA_VERSION: &str = "1.0";
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Health state of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Up,
    Down,
}

/// Per-backend health record, updated with atomics on every call.
#[derive(Debug, Default)]
pub struct BackendHealth {
    state_down: AtomicU8,
    consecutive_errors: AtomicU32,
    last_ok_unix_ms: AtomicI64,
    latency_ema_us: AtomicU64,
}

impl BackendHealth {
    pub fn state(&self) -> BackendState {
        if self.state_down.load(Ordering::SeqCst) == 1 {
            BackendState::Down
        } else {
            BackendState::Up
        }
    }

    pub fn is_down(&self) -> bool {
        self.state() == BackendState::Down
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.latency_ema_us.load(Ordering::Relaxed) as f64 / 1_000.0
    }

    pub fn last_ok(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_ok_unix_ms.load(Ordering::Relaxed);
        (ms > 0).then(|| DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now))
    }

    fn record_success(&self, latency: Duration) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
        self.state_down.store(0, Ordering::SeqCst);
        self.last_ok_unix_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        let sample = latency.as_micros() as u64;
        let current = self.latency_ema_us.load(Ordering::Relaxed);
        let next = if current == 0 {
            sample
        } else {
            (current * 4 + sample) / 5
        };
        self.latency_ema_us.store(next, Ordering::Relaxed);
    }

    fn record_error(&self, down_after: u32) {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        if errors >= down_after {
            self.state_down.store(1, Ordering::SeqCst);
        }
    }
}

/// One backend with its descriptor and health record.
pub struct RoutedBackend {
    pub descriptor: BackendDescriptor,
    pub backend: Arc<dyn StorageBackend>,
    pub health: BackendHealth,
}

/// Compression bookkeeping carried in the metadata cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub tag: CompressionTag,
    pub original_size: u64,
    pub compressed_size: u64,
}

/// One object tracked by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    /// SHA-256 of the stored bytes, lowercase hex.
    pub checksum: String,
    /// Backends currently holding a good copy.
    pub backends: Vec<String>,
    /// Backends whose copy failed its checksum.
    #[serde(default)]
    pub corrupt_backends: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataCache {
    version: String,
    files: BTreeMap<String, FileEntry>,
    updated_at: DateTime<Utc>,
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION.to_string(),
            files: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Per-backend slice of a [`RouterReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendReport {
    pub name: String,
    pub priority: u32,
    pub state: BackendState,
    pub consecutive_errors: u32,
    pub avg_latency_ms: f64,
    pub stats: Option<BackendStats>,
}

/// Aggregate router status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterReport {
    pub backends: Vec<BackendReport>,
    pub tracked_files: usize,
    pub tracked_bytes: u64,
}

/// Result of one cache-cleanup sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupStats {
    pub removed_files: u64,
    pub bytes_freed: u64,
}

/// Replicates objects across prioritized backends.
pub struct StorageRouter {
    backends: Vec<RoutedBackend>,
    redundancy: usize,
    retry_attempts: u32,
    down_after: u32,
    cache_dir: PathBuf,
    metadata_path: PathBuf,
    metadata: parking_lot::Mutex<MetadataCache>,
}

impl StorageRouter {
    /// Build adapters from the config's descriptors and load the persisted
    /// metadata cache.
    pub fn new(config: &RouterConfig, data_dir: &Path) -> Result<Self> {
        let mut pairs = Vec::new();
        for descriptor in config.backends.iter().filter(|d| d.enabled) {
            let backend = build_backend(descriptor, data_dir)?;
            pairs.push((descriptor.clone(), backend));
        }
        Self::with_backends(pairs, config, data_dir)
    }

    /// Build from pre-constructed adapters; the seam used by tests and by
    /// callers that inject custom tiers.
    pub fn with_backends(
        backends: Vec<(BackendDescriptor, Arc<dyn StorageBackend>)>,
        config: &RouterConfig,
        data_dir: &Path,
    ) -> Result<Self> {
        let mut routed: Vec<RoutedBackend> = backends
            .into_iter()
            .map(|(descriptor, backend)| RoutedBackend {
                descriptor,
                backend,
                health: BackendHealth::default(),
            })
            .collect();
        routed.sort_by_key(|rb| rb.descriptor.priority);

        let cache_dir = data_dir.join("cache");
        std::fs::create_dir_all(cache_dir.join("files"))?;
        let metadata_path = cache_dir.join("metadata_cache.json");
        let metadata = if metadata_path.exists() {
            let bytes = std::fs::read(&metadata_path)?;
            serde_json::from_slice(&bytes).map_err(|e| {
                MemoriaError::Corruption(format!("metadata cache failed to decode: {e}"))
            })?
        } else {
            MetadataCache::default()
        };

        info!(backends = routed.len(), "storage router ready");
        Ok(Self {
            backends: routed,
            redundancy: config.redundancy_factor,
            retry_attempts: config.retry_attempts.max(1),
            down_after: config.down_after_errors.max(1),
            cache_dir,
            metadata_path,
            metadata: parking_lot::Mutex::new(metadata),
        })
    }

    pub fn backends(&self) -> &[RoutedBackend] {
        &self.backends
    }

    /// Look up a tracked object's entry.
    pub fn file_entry(&self, file_id: &str) -> Option<FileEntry> {
        self.metadata.lock().files.get(file_id).cloned()
    }

    /// Store an object on the highest-priority healthy backends until the
    /// redundancy factor is met. Fails only when no backend accepts the
    /// write.
    pub async fn store(
        &self,
        file_id: &str,
        filename: &str,
        data: Bytes,
        compression: Option<CompressionInfo>,
    ) -> Result<Vec<String>> {
        let checksum = sha256_hex(&data);
        let candidates: Vec<&RoutedBackend> = self
            .backends
            .iter()
            .filter(|rb| !rb.health.is_down())
            .collect();

        let mut stored: Vec<String> = Vec::new();

        // First wave: replicate concurrently across the preferred backends.
        let first_wave: Vec<&RoutedBackend> =
            candidates.iter().copied().take(self.redundancy).collect();
        let writes = first_wave
            .iter()
            .map(|rb| self.store_on(rb, file_id, filename, data.clone()));
        for (rb, result) in first_wave.iter().zip(futures::future::join_all(writes).await) {
            match result {
                Ok(()) => stored.push(rb.descriptor.name.clone()),
                Err(e) => warn!(
                    backend = %rb.descriptor.name,
                    error = %e,
                    "replica write failed"
                ),
            }
        }

        // Shortfall: walk the remaining priority list until enough copies
        // exist or every backend has been tried.
        for rb in candidates.iter().skip(self.redundancy) {
            if stored.len() >= self.redundancy {
                break;
            }
            match self.store_on(rb, file_id, filename, data.clone()).await {
                Ok(()) => stored.push(rb.descriptor.name.clone()),
                Err(e) => warn!(
                    backend = %rb.descriptor.name,
                    error = %e,
                    "fallback replica write failed"
                ),
            }
        }

        if stored.is_empty() {
            return Err(MemoriaError::Transient(format!(
                "no backend accepted object {file_id}"
            )));
        }
        if stored.len() < self.redundancy {
            warn!(
                file_id,
                achieved = stored.len(),
                wanted = self.redundancy,
                "write under-replicated"
            );
        }

        {
            let mut cache = self.metadata.lock();
            let now = Utc::now();
            let entry = cache.files.entry(file_id.to_string()).or_insert(FileEntry {
                filename: filename.to_string(),
                size: data.len() as u64,
                checksum: checksum.clone(),
                backends: Vec::new(),
                corrupt_backends: Vec::new(),
                created_at: now,
                accessed_at: now,
                access_count: 0,
                compression: None,
            });
            entry.filename = filename.to_string();
            entry.size = data.len() as u64;
            entry.checksum = checksum;
            entry.backends = stored.clone();
            entry.corrupt_backends.clear();
            entry.compression = compression;
        }
        self.persist_metadata().await?;
        Ok(stored)
    }

    /// Retrieve an object from the fastest healthy copy, verifying its
    /// checksum and failing over on mismatch. A good read from a
    /// non-primary backend schedules a repair write to the primary.
    pub async fn retrieve(self: &Arc<Self>, file_id: &str) -> Result<Bytes> {
        let entry = self
            .file_entry(file_id)
            .ok_or_else(|| MemoriaError::NotFound(format!("object {file_id}")))?;

        let mut corruption_seen = false;
        for (position, rb) in self.backends.iter().enumerate() {
            if rb.health.is_down()
                || !entry.backends.contains(&rb.descriptor.name)
                || entry.corrupt_backends.contains(&rb.descriptor.name)
            {
                continue;
            }
            match self.retrieve_on(rb, file_id).await {
                Ok(Some(data)) => {
                    if sha256_hex(&data) != entry.checksum {
                        warn!(
                            backend = %rb.descriptor.name,
                            file_id,
                            "checksum mismatch, marking copy corrupt"
                        );
                        corruption_seen = true;
                        self.mark_corrupt(file_id, &rb.descriptor.name);
                        self.persist_metadata().await?;
                        continue;
                    }

                    self.touch_entry(file_id);
                    self.persist_metadata().await?;
                    self.write_local_cache(file_id, &data).await;
                    if position != 0 {
                        self.schedule_repair(file_id, data.clone(), entry.filename.clone());
                    }
                    return Ok(data);
                }
                Ok(None) => {
                    debug!(backend = %rb.descriptor.name, file_id, "copy missing");
                }
                Err(e) => {
                    warn!(backend = %rb.descriptor.name, file_id, error = %e, "read failed");
                }
            }
        }

        if corruption_seen {
            Err(MemoriaError::Corruption(format!(
                "every replica of object {file_id} is corrupt or unavailable"
            )))
        } else {
            Err(MemoriaError::Transient(format!(
                "object {file_id} unavailable on all backends"
            )))
        }
    }

    /// Delete an object from every backend holding it and drop its entry.
    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let entry = match self.file_entry(file_id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        for rb in &self.backends {
            if !entry.backends.contains(&rb.descriptor.name)
                && !entry.corrupt_backends.contains(&rb.descriptor.name)
            {
                continue;
            }
            if let Err(e) = self.delete_on(rb, file_id).await {
                warn!(backend = %rb.descriptor.name, file_id, error = %e, "delete failed");
            }
        }
        self.metadata.lock().files.remove(file_id);
        self.persist_metadata().await?;
        let _ = tokio::fs::remove_file(self.cache_dir.join("files").join(file_id)).await;
        Ok(())
    }

    /// Probe every backend, flipping recovered ones back up.
    pub async fn probe_all(&self) {
        for rb in &self.backends {
            let start = Instant::now();
            match rb.backend.health_check().await {
                Ok(()) => rb.health.record_success(start.elapsed()),
                Err(e) => {
                    debug!(backend = %rb.descriptor.name, error = %e, "probe failed");
                    rb.health.record_error(self.down_after);
                }
            }
        }
    }

    /// Evict local cache files older than `max_age_days`.
    pub async fn cleanup_cache(&self, max_age_days: u32) -> Result<CleanupStats> {
        let dir = self.cache_dir.join("files");
        let cutoff = std::time::SystemTime::now()
            - Duration::from_secs(u64::from(max_age_days) * 24 * 60 * 60);
        let stats = tokio::task::spawn_blocking(move || -> std::io::Result<CleanupStats> {
            let mut stats = CleanupStats::default();
            if !dir.exists() {
                return Ok(stats);
            }
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                let modified = meta.modified()?;
                if modified < cutoff {
                    stats.removed_files += 1;
                    stats.bytes_freed += meta.len();
                    std::fs::remove_file(entry.path())?;
                }
            }
            Ok(stats)
        })
        .await
        .map_err(|e| MemoriaError::Transient(format!("cleanup task failed: {e}")))??;
        if stats.removed_files > 0 {
            info!(
                removed = stats.removed_files,
                bytes = stats.bytes_freed,
                "cache cleanup complete"
            );
        }
        Ok(stats)
    }

    /// Spawn the health-probe and cache-cleanup daemons.
    pub fn start_background_tasks(
        self: &Arc<Self>,
        probe_interval: Duration,
        cleanup_interval: Duration,
        max_age_days: u32,
    ) -> RouterBackgroundTasks {
        let (shutdown, stop_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let router = Arc::clone(self);
        let mut stop = stop_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(probe_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => router.probe_all().await,
                }
            }
        }));

        let router = Arc::clone(self);
        let mut stop = stop_rx;
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {
                        if let Err(e) = router.cleanup_cache(max_age_days).await {
                            warn!(error = %e, "cache cleanup failed");
                        }
                    }
                }
            }
        }));

        RouterBackgroundTasks { shutdown, handles }
    }

    /// Aggregate status across backends and the metadata cache.
    pub async fn storage_report(&self) -> RouterReport {
        let mut backends = Vec::with_capacity(self.backends.len());
        for rb in &self.backends {
            backends.push(BackendReport {
                name: rb.descriptor.name.clone(),
                priority: rb.descriptor.priority,
                state: rb.health.state(),
                consecutive_errors: rb.health.consecutive_errors(),
                avg_latency_ms: rb.health.avg_latency_ms(),
                stats: rb.backend.stats().await.ok(),
            });
        }
        let (tracked_files, tracked_bytes) = {
            let cache = self.metadata.lock();
            (
                cache.files.len(),
                cache.files.values().map(|f| f.size).sum(),
            )
        };
        RouterReport {
            backends,
            tracked_files,
            tracked_bytes,
        }
    }

    // ---- internals -----------------------------------------------------

    async fn store_on(
        &self,
        rb: &RoutedBackend,
        file_id: &str,
        filename: &str,
        data: Bytes,
    ) -> Result<()> {
        self.with_retry(rb, || rb.backend.store(file_id, filename, data.clone()))
            .await
    }

    async fn retrieve_on(&self, rb: &RoutedBackend, file_id: &str) -> Result<Option<Bytes>> {
        self.with_retry(rb, || rb.backend.retrieve(file_id)).await
    }

    async fn delete_on(&self, rb: &RoutedBackend, file_id: &str) -> Result<()> {
        self.with_retry(rb, || rb.backend.delete(file_id)).await
    }

    /// Run one backend call with exponential backoff on transient errors,
    /// recording health either way.
    async fn with_retry<T, F, Fut>(&self, rb: &RoutedBackend, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_err = None;
        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }
            let start = Instant::now();
            match call().await {
                Ok(value) => {
                    rb.health.record_success(start.elapsed());
                    return Ok(value);
                }
                Err(e) => {
                    rb.health.record_error(self.down_after);
                    let transient = e.is_transient();
                    last_err = Some(e);
                    if !transient {
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            MemoriaError::Transient(format!(
                "backend '{}' exhausted retries",
                rb.descriptor.name
            ))
        }))
    }

    fn mark_corrupt(&self, file_id: &str, backend_name: &str) {
        let mut cache = self.metadata.lock();
        if let Some(entry) = cache.files.get_mut(file_id) {
            entry.backends.retain(|b| b != backend_name);
            if !entry.corrupt_backends.iter().any(|b| b == backend_name) {
                entry.corrupt_backends.push(backend_name.to_string());
            }
        }
        cache.updated_at = Utc::now();
    }

    fn touch_entry(&self, file_id: &str) {
        let mut cache = self.metadata.lock();
        if let Some(entry) = cache.files.get_mut(file_id) {
            entry.accessed_at = Utc::now();
            entry.access_count += 1;
        }
        cache.updated_at = Utc::now();
    }

    /// Repair runs detached: replication healing must not slow the read
    /// path down.
    fn schedule_repair(self: &Arc<Self>, file_id: &str, data: Bytes, filename: String) {
        let router = Arc::clone(self);
        let file_id = file_id.to_string();
        tokio::spawn(async move {
            let primary = match router.backends.first() {
                Some(rb) => rb,
                None => return,
            };
            if primary.health.is_down() {
                return;
            }
            let holds_copy = router
                .file_entry(&file_id)
                .map(|entry| {
                    entry.backends.contains(&primary.descriptor.name)
                        || entry.corrupt_backends.contains(&primary.descriptor.name)
                })
                .unwrap_or(true);
            if holds_copy {
                return;
            }
            match router.store_on(primary, &file_id, &filename, data).await {
                Ok(()) => {
                    {
                        let mut cache = router.metadata.lock();
                        if let Some(entry) = cache.files.get_mut(&file_id) {
                            entry.backends.insert(0, primary.descriptor.name.clone());
                        }
                    }
                    if let Err(e) = router.persist_metadata().await {
                        warn!(error = %e, "failed to persist metadata after repair");
                    }
                    info!(%file_id, backend = %primary.descriptor.name, "replica repaired");
                }
                Err(e) => {
                    warn!(%file_id, error = %e, "replica repair failed");
                }
            }
        });
    }

    async fn write_local_cache(&self, file_id: &str, data: &Bytes) {
        let path = self.cache_dir.join("files").join(file_id);
        if path.exists() {
            return;
        }
        if let Err(e) = tokio::fs::write(&path, data).await {
            debug!(file_id, error = %e, "local cache write skipped");
        }
    }

    async fn persist_metadata(&self) -> Result<()> {
        // Serialize under the lock, write outside it.
        let bytes = {
            let mut cache = self.metadata.lock();
            cache.updated_at = Utc::now();
            serde_json::to_vec_pretty(&*cache)?
        };
        let tmp = self.metadata_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.metadata_path).await?;
        Ok(())
    }
}

/// Handles for the router's two daemons.
pub struct RouterBackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl RouterBackgroundTasks {
    /// Signal both daemons and wait for them to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use memoria_core::BackendKind;
    use tempfile::tempdir;

    fn descriptor(name: &str, priority: u32) -> BackendDescriptor {
        BackendDescriptor::new(name, BackendKind::Memory, priority)
    }

    fn config(redundancy: usize) -> RouterConfig {
        RouterConfig {
            redundancy_factor: redundancy,
            retry_attempts: 1,
            down_after_errors: 2,
            ..RouterConfig::default()
        }
    }

    fn two_tier_router(
        data_dir: &Path,
        redundancy: usize,
    ) -> (Arc<StorageRouter>, Arc<MemoryBackend>, Arc<MemoryBackend>) {
        let a = Arc::new(MemoryBackend::new("a"));
        let b = Arc::new(MemoryBackend::new("b"));
        let router = StorageRouter::with_backends(
            vec![
                (descriptor("a", 0), a.clone() as Arc<dyn StorageBackend>),
                (descriptor("b", 1), b.clone() as Arc<dyn StorageBackend>),
            ],
            &config(redundancy),
            data_dir,
        )
        .unwrap();
        (Arc::new(router), a, b)
    }

    #[tokio::test]
    async fn replicates_to_redundancy_factor() {
        let dir = tempdir().unwrap();
        let (router, a, b) = two_tier_router(dir.path(), 2);

        let stored = router
            .store("f1", "hello.txt", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();
        assert_eq!(stored, vec!["a".to_string(), "b".to_string()]);
        assert!(a.retrieve("f1").await.unwrap().is_some());
        assert!(b.retrieve("f1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn survives_primary_outage() {
        let dir = tempdir().unwrap();
        let (router, a, _b) = two_tier_router(dir.path(), 2);

        router
            .store("f1", "hello.txt", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();

        a.set_healthy(false);
        let got = router.retrieve("f1").await.unwrap();
        assert_eq!(got, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn corrupt_primary_fails_over_and_is_marked() {
        let dir = tempdir().unwrap();
        let (router, a, _b) = two_tier_router(dir.path(), 2);

        router
            .store("f1", "hello.txt", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();
        assert!(a.tamper("f1", |bytes| bytes[0] ^= 0xFF));

        let got = router.retrieve("f1").await.unwrap();
        assert_eq!(got, Bytes::from_static(b"hello"));

        let entry = router.file_entry("f1").unwrap();
        assert!(entry.corrupt_backends.contains(&"a".to_string()));
        assert!(!entry.backends.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn all_replicas_corrupt_surfaces_corruption() {
        let dir = tempdir().unwrap();
        let (router, a, b) = two_tier_router(dir.path(), 2);

        router
            .store("f1", "x", Bytes::from_static(b"payload"), None)
            .await
            .unwrap();
        a.tamper("f1", |bytes| bytes[0] ^= 1);
        b.tamper("f1", |bytes| bytes[0] ^= 1);

        let err = router.retrieve("f1").await;
        assert!(matches!(err, Err(MemoriaError::Corruption(_))));
    }

    #[tokio::test]
    async fn write_falls_through_to_lower_priority() {
        let dir = tempdir().unwrap();
        let (router, a, b) = two_tier_router(dir.path(), 1);

        a.set_healthy(false);
        // The first write attempt fails on A and marks errors; the router
        // still lands the object on B.
        let stored = router
            .store("f1", "x", Bytes::from_static(b"data"), None)
            .await
            .unwrap();
        assert_eq!(stored, vec!["b".to_string()]);
        assert!(b.retrieve("f1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn no_backend_accepting_write_is_an_error() {
        let dir = tempdir().unwrap();
        let (router, a, b) = two_tier_router(dir.path(), 2);
        a.set_healthy(false);
        b.set_healthy(false);

        let err = router
            .store("f1", "x", Bytes::from_static(b"data"), None)
            .await;
        assert!(matches!(err, Err(MemoriaError::Transient(_))));
    }

    #[tokio::test]
    async fn repeated_errors_mark_backend_down_and_probe_recovers_it() {
        let dir = tempdir().unwrap();
        let (router, a, _b) = two_tier_router(dir.path(), 2);
        router
            .store("f1", "x", Bytes::from_static(b"data"), None)
            .await
            .unwrap();

        a.set_healthy(false);
        // down_after_errors = 2 in the test config.
        let _ = router.retrieve("f1").await.unwrap();
        let _ = router.retrieve("f1").await.unwrap();
        assert!(router.backends()[0].health.is_down());

        a.set_healthy(true);
        router.probe_all().await;
        assert!(!router.backends()[0].health.is_down());
    }

    #[tokio::test]
    async fn good_secondary_read_repairs_missing_primary() {
        let dir = tempdir().unwrap();
        let (router, a, b) = two_tier_router(dir.path(), 1);

        // Primary down at write time: the only copy lands on B.
        a.set_healthy(false);
        router
            .store("f1", "x", Bytes::from_static(b"data"), None)
            .await
            .unwrap();
        assert!(b.retrieve("f1").await.unwrap().is_some());

        // Primary recovers; a read served by B schedules the repair.
        a.set_healthy(true);
        router.probe_all().await;
        let _ = router.retrieve("f1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            a.retrieve("f1").await.unwrap(),
            Some(Bytes::from_static(b"data"))
        );
        let entry = router.file_entry("f1").unwrap();
        assert!(entry.backends.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn metadata_cache_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let (router, _a, _b) = two_tier_router(dir.path(), 2);
            router
                .store("f1", "keep.txt", Bytes::from_static(b"keep"), None)
                .await
                .unwrap();
        }
        let (router, _a, _b) = two_tier_router(dir.path(), 2);
        let entry = router.file_entry("f1").unwrap();
        assert_eq!(entry.filename, "keep.txt");
        assert_eq!(entry.size, 4);
    }

    #[tokio::test]
    async fn delete_removes_copies_and_entry() {
        let dir = tempdir().unwrap();
        let (router, a, b) = two_tier_router(dir.path(), 2);
        router
            .store("f1", "x", Bytes::from_static(b"data"), None)
            .await
            .unwrap();

        router.delete("f1").await.unwrap();
        assert!(router.file_entry("f1").is_none());
        assert!(a.retrieve("f1").await.unwrap().is_none());
        assert!(b.retrieve("f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn background_tasks_stop_cleanly() {
        let dir = tempdir().unwrap();
        let (router, _a, _b) = two_tier_router(dir.path(), 1);
        let tasks = router.start_background_tasks(
            Duration::from_millis(10),
            Duration::from_millis(10),
            30,
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        tasks.stop().await;
    }
}
