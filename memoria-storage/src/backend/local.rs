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

//! Local filesystem backend.
//!
//! Objects land at `<base>/<first two id chars>/<id>` so directories stay
//! small. Writes go through a temp file plus rename, so a crash never
//! leaves a half-written object visible.

use super::{BackendStats, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use memoria_core::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct LocalFsBackend {
    name: String,
    base: PathBuf,
}

impl LocalFsBackend {
    pub fn new(name: impl Into<String>, base: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base: base.into(),
        }
    }

    fn object_path(&self, id: &str) -> PathBuf {
        let shard: String = id.chars().take(2).collect();
        self.base.join(shard).join(id)
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, id: &str, filename: &str, data: Bytes) -> Result<()> {
        let path = self.object_path(id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(backend = %self.name, id, filename, bytes = data.len(), "stored object");
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.object_path(id)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.object_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stats(&self) -> Result<BackendStats> {
        let base = self.base.clone();
        let (total_size, file_count) = tokio::task::spawn_blocking(move || walk(&base))
            .await
            .map_err(|e| {
                memoria_core::MemoriaError::Transient(format!("stats task failed: {e}"))
            })??;
        Ok(BackendStats {
            total_size,
            file_count,
            available_space: None,
            ..BackendStats::default()
        })
    }

    async fn health_check(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base).await?;
        let probe = self.base.join(".health");
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }
}

fn walk(dir: &Path) -> std::io::Result<(u64, u64)> {
    let mut total_size = 0u64;
    let mut file_count = 0u64;
    if !dir.exists() {
        return Ok((0, 0));
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            let (size, count) = walk(&entry.path())?;
            total_size += size;
            file_count += count;
        } else {
            total_size += meta.len();
            file_count += 1;
        }
    }
    Ok((total_size, file_count))
}
