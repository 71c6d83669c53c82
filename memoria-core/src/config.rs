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

//! Engine configuration.
//!
//! One [`EngineConfig`] aggregates every knob. All fields have defaults so
//! an empty config file is valid; [`EngineConfig::validate`] rejects values
//! that would only fail later at first use.

use crate::error::{MemoriaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Compression algorithm selection. `Adaptive` trials the candidate codecs
/// and keeps the smallest output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Adaptive,
    Zstd,
    Gzip,
    Zlib,
    None,
}

/// Codec pipeline knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub algorithm: CompressionAlgorithm,
    /// zstd levels 0-22; gzip/zlib clamp to 0-9.
    pub level: i32,
    /// Inputs below this many bytes are never compressed.
    pub threshold_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: CompressionAlgorithm::Adaptive,
            level: 3,
            threshold_bytes: 100,
        }
    }
}

/// Chunked storage knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub enabled: bool,
    pub chunk_size: usize,
    pub max_chunks: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chunk_size: 10_000,
            max_chunks: 100,
        }
    }
}

/// Duplicate-detection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    #[default]
    ContentHash,
    Fuzzy,
    Semantic,
}

/// Hash used by the exact strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashMethod {
    #[default]
    XxHash64,
    Sha256,
    Md5,
    SeaHash,
}

/// Similarity metric used by the fuzzy strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    Jaccard,
    Levenshtein,
}

/// Deduplication knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub strategy: DedupStrategy,
    pub threshold: f64,
    /// Each candidate is compared against the next k candidates, bounding
    /// fuzzy detection at O(N*k).
    pub comparison_window: usize,
    pub hash_method: HashMethod,
    pub similarity_metric: SimilarityMetric,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            strategy: DedupStrategy::default(),
            threshold: 0.95,
            comparison_window: 100,
            hash_method: HashMethod::default(),
            similarity_metric: SimilarityMetric::default(),
        }
    }
}

/// Pack-file format for archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    #[default]
    TarGz,
    Directory,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Directory => "dir",
        }
    }
}

/// A named retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivePolicy {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Days before archived data may be cleaned up. `None` = permanent.
    pub retention_days: Option<u32>,
    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    #[serde(default = "default_archive_level")]
    pub compression_level: u32,
    #[serde(default)]
    pub format: ArchiveFormat,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
    #[serde(default = "default_true")]
    pub include_relations: bool,
    #[serde(default = "default_true")]
    pub include_contexts: bool,
    #[serde(default = "default_max_archive_mb")]
    pub max_archive_size_mb: u64,
    #[serde(default)]
    pub split_large_archives: bool,
    #[serde(default = "default_true")]
    pub checksum_verification: bool,
}

fn default_true() -> bool {
    true
}

fn default_archive_level() -> u32 {
    6
}

fn default_max_archive_mb() -> u64 {
    100
}

impl ArchivePolicy {
    pub fn named(name: impl Into<String>, retention_days: Option<u32>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            retention_days,
            compression_enabled: true,
            compression_level: default_archive_level(),
            format: ArchiveFormat::default(),
            include_metadata: true,
            include_relations: true,
            include_contexts: true,
            max_archive_size_mb: default_max_archive_mb(),
            split_large_archives: false,
            checksum_verification: true,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.retention_days.is_none()
    }
}

/// Archival engine knobs. Default policies are installed by the archival
/// manager when the map is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchivalConfig {
    pub archive_dir: PathBuf,
    pub policies: HashMap<String, ArchivePolicy>,
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("./data/archives"),
            policies: HashMap::new(),
        }
    }
}

/// Kinds of storage backend adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    S3,
    Azure,
    Gcs,
    Redis,
    Memory,
}

/// Declarative description of one storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub kind: BackendKind,
    /// Lower is preferred.
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Kind-specific settings, e.g. `path` for local, `url` for object
    /// stores.
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl BackendDescriptor {
    pub fn new(name: impl Into<String>, kind: BackendKind, priority: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            priority,
            enabled: true,
            config: HashMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// Storage router knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub backends: Vec<BackendDescriptor>,
    /// Minimum distinct successful copies per write.
    pub redundancy_factor: usize,
    /// Consecutive errors before a backend is marked down.
    pub down_after_errors: u32,
    pub probe_interval_secs: u64,
    /// Local cache entries older than this are evicted by the cleanup daemon.
    pub cache_max_age_days: u32,
    /// Retry attempts per backend for transient failures.
    pub retry_attempts: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            redundancy_factor: 1,
            down_after_errors: 5,
            probe_interval_secs: 300,
            cache_max_age_days: 30,
            retry_attempts: 3,
        }
    }
}

/// Bulk ingestion knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Concurrent workers for bulk jobs. 0 = number of cores.
    pub worker_threads: usize,
    /// Pending work above this count is refused.
    pub high_water_mark: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            high_water_mark: 10_000,
        }
    }
}

/// Redis adapter knobs. The adapter is not compiled into this build;
/// enabling it fails validation rather than at first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 6379,
        }
    }
}

/// Top-level configuration for the memory engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: DataDir,
    pub compression: CompressionConfig,
    pub lazy_loading_enabled: LazyLoading,
    pub preview_length: PreviewLength,
    pub chunked_storage: ChunkingConfig,
    pub deduplication: DedupConfig,
    pub archival: ArchivalConfig,
    pub router: RouterConfig,
    pub bulk: BulkConfig,
    pub redis: RedisConfig,
}

/// Newtype wrappers so `#[serde(default)]` picks the documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataDir(pub PathBuf);

impl Default for DataDir {
    fn default() -> Self {
        DataDir(PathBuf::from("./data"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LazyLoading(pub bool);

impl Default for LazyLoading {
    fn default() -> Self {
        LazyLoading(true)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreviewLength(pub usize);

impl Default for PreviewLength {
    fn default() -> Self {
        PreviewLength(100)
    }
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = toml::from_str(&text)
            .map_err(|e| MemoriaError::Config(format!("invalid config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later at first use.
    pub fn validate(&self) -> Result<()> {
        if !(0..=22).contains(&self.compression.level) {
            return Err(MemoriaError::Config(format!(
                "compression level {} outside 0-22",
                self.compression.level
            )));
        }
        if self.chunked_storage.chunk_size == 0 {
            return Err(MemoriaError::Config("chunk_size must be > 0".into()));
        }
        if self.chunked_storage.max_chunks == 0 {
            return Err(MemoriaError::Config("max_chunks must be > 0".into()));
        }
        if self.preview_length.0 == 0 {
            return Err(MemoriaError::Config("preview_length must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.deduplication.threshold) {
            return Err(MemoriaError::Config(format!(
                "deduplication threshold {} outside [0.0, 1.0]",
                self.deduplication.threshold
            )));
        }
        if self.deduplication.comparison_window == 0 {
            return Err(MemoriaError::Config("comparison_window must be > 0".into()));
        }
        if self.router.redundancy_factor == 0 {
            return Err(MemoriaError::Config("redundancy_factor must be >= 1".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for backend in &self.router.backends {
            if !seen.insert(backend.name.as_str()) {
                return Err(MemoriaError::Config(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
            if backend.kind == BackendKind::Redis {
                return Err(MemoriaError::Config(
                    "redis backend is not compiled into this build".into(),
                ));
            }
        }
        if self.redis.enabled {
            return Err(MemoriaError::Config(
                "redis cache is not compiled into this build".into(),
            ));
        }
        for (key, policy) in &self.archival.policies {
            if key != &policy.name {
                return Err(MemoriaError::Config(format!(
                    "policy map key '{}' does not match policy name '{}'",
                    key, policy.name
                )));
            }
            if policy.compression_level > 9 {
                return Err(MemoriaError::Config(format!(
                    "archive compression level {} outside 0-9",
                    policy.compression_level
                )));
            }
            if policy.max_archive_size_mb == 0 {
                return Err(MemoriaError::Config(
                    "max_archive_size_mb must be > 0".into(),
                ));
            }
        }
        if self.bulk.high_water_mark == 0 {
            return Err(MemoriaError::Config("high_water_mark must be > 0".into()));
        }
        Ok(())
    }

    /// Effective bulk worker count.
    pub fn bulk_workers(&self) -> usize {
        if self.bulk.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.bulk.worker_threads
        }
    }

    /// Directory for the embedded table store.
    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.0.join("db")
    }

    /// Directory for the router's local cache and metadata file.
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.0.join("cache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.compression.level, 3);
        assert_eq!(config.compression.threshold_bytes, 100);
        assert_eq!(config.chunked_storage.chunk_size, 10_000);
        assert_eq!(config.chunked_storage.max_chunks, 100);
        assert_eq!(config.preview_length.0, 100);
        assert_eq!(config.deduplication.threshold, 0.95);
        assert_eq!(config.router.redundancy_factor, 1);
        assert!(!config.redis.enabled);
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert!(config.validate().is_ok());
        assert!(config.lazy_loading_enabled.0);
    }

    #[test]
    fn invalid_level_is_rejected() {
        let mut config = EngineConfig::default();
        config.compression.level = 23;
        assert!(matches!(config.validate(), Err(MemoriaError::Config(_))));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let mut config = EngineConfig::default();
        config.chunked_storage.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn redis_enabled_fails_fast() {
        let mut config = EngineConfig::default();
        config.redis.enabled = true;
        assert!(matches!(config.validate(), Err(MemoriaError::Config(_))));
    }

    #[test]
    fn duplicate_backend_names_are_rejected() {
        let mut config = EngineConfig::default();
        config
            .router
            .backends
            .push(BackendDescriptor::new("primary", BackendKind::Memory, 0));
        config
            .router
            .backends
            .push(BackendDescriptor::new("primary", BackendKind::Local, 1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn backend_config_toml_round_trip() {
        let toml_text = r#"
            [[router.backends]]
            name = "local"
            kind = "local"
            priority = 0

            [[router.backends]]
            name = "bucket"
            kind = "s3"
            priority = 1
            config = { url = "s3://memories" }

            [compression]
            algorithm = "zstd"
            level = 9
        "#;
        let config: EngineConfig = toml::from_str(toml_text).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.router.backends.len(), 2);
        assert_eq!(config.router.backends[1].kind, BackendKind::S3);
        assert_eq!(config.compression.algorithm, CompressionAlgorithm::Zstd);
        assert_eq!(config.compression.level, 9);
    }

    #[test]
    fn permanent_policy_has_no_retention() {
        let policy = ArchivePolicy::named("permanent", None);
        assert!(policy.is_permanent());
        let policy = ArchivePolicy::named("temporary", Some(30));
        assert!(!policy.is_permanent());
    }
}
