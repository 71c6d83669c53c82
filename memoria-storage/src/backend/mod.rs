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

//! Storage backend adapters.
//!
//! Every adapter fulfills one asynchronous [`StorageBackend`] contract; the
//! router treats them uniformly and never special-cases a kind. Transient
//! failures (I/O, network) surface as `Transient` so the router can retry
//! and fail over; a missing object is `Ok(None)`, never an error.

mod local;
mod memory;
mod object;

pub use local::LocalFsBackend;
pub use memory::MemoryBackend;
pub use object::ObjectStoreBackend;

use async_trait::async_trait;
use bytes::Bytes;
use memoria_core::{BackendDescriptor, BackendKind, MemoriaError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Point-in-time statistics reported by one backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendStats {
    pub total_size: u64,
    pub file_count: u64,
    /// Free space, when the backing medium can report it.
    pub available_space: Option<u64>,
    pub error_count: u64,
    pub avg_latency_ms: f64,
}

/// One concrete storage location for router-managed objects.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// The descriptor name this adapter was built from.
    fn name(&self) -> &str;

    /// Store an object. Overwrites any previous copy with the same id.
    async fn store(&self, id: &str, filename: &str, data: Bytes) -> Result<()>;

    /// Fetch an object. `Ok(None)` when this backend has no copy.
    async fn retrieve(&self, id: &str) -> Result<Option<Bytes>>;

    /// Remove an object. Removing a missing object is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Usage statistics.
    async fn stats(&self) -> Result<BackendStats>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> Result<()>;
}

/// Build an adapter from its descriptor.
///
/// Local backends without an explicit `path` land under
/// `<data_dir>/backends/<name>`.
pub fn build_backend(
    descriptor: &BackendDescriptor,
    data_dir: &Path,
) -> Result<Arc<dyn StorageBackend>> {
    match descriptor.kind {
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new(&descriptor.name))),
        BackendKind::Local => {
            let path = descriptor
                .config
                .get("path")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|| data_dir.join("backends").join(&descriptor.name));
            Ok(Arc::new(LocalFsBackend::new(&descriptor.name, path)))
        }
        BackendKind::S3 | BackendKind::Azure | BackendKind::Gcs => {
            let url = descriptor.config.get("url").ok_or_else(|| {
                MemoriaError::Config(format!(
                    "backend '{}' needs a 'url' config entry",
                    descriptor.name
                ))
            })?;
            Ok(Arc::new(ObjectStoreBackend::from_url(
                &descriptor.name,
                url,
                &descriptor.config,
            )?))
        }
        BackendKind::Redis => Err(MemoriaError::Config(format!(
            "backend '{}': redis adapter is not compiled into this build",
            descriptor.name
        ))),
    }
}
