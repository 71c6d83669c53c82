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

//! In-memory backend: the cache tier, and the workhorse of the test suite.

use super::{BackendStats, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use memoria_core::Result;
use std::sync::atomic::{AtomicBool, Ordering};

/// Objects held in process memory. Contents are lost on restart; the router
/// treats this tier as a cache, never the only copy of anything precious.
pub struct MemoryBackend {
    name: String,
    objects: DashMap<String, Bytes>,
    healthy: AtomicBool,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: DashMap::new(),
            healthy: AtomicBool::new(true),
        }
    }

    /// Force the health probe to fail; used to exercise router failover.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Overwrite a stored object in place, bypassing the store contract.
    /// Exists so tests can simulate bit rot on one replica.
    pub fn tamper(&self, id: &str, mutate: impl FnOnce(&mut Vec<u8>)) -> bool {
        if let Some(mut entry) = self.objects.get_mut(id) {
            let mut bytes = entry.value().to_vec();
            mutate(&mut bytes);
            *entry.value_mut() = Bytes::from(bytes);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, id: &str, _filename: &str, data: Bytes) -> Result<()> {
        self.check_health()?;
        self.objects.insert(id.to_string(), data);
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Bytes>> {
        self.check_health()?;
        Ok(self.objects.get(id).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check_health()?;
        self.objects.remove(id);
        Ok(())
    }

    async fn stats(&self) -> Result<BackendStats> {
        Ok(BackendStats {
            total_size: self.objects.iter().map(|e| e.value().len() as u64).sum(),
            file_count: self.objects.len() as u64,
            available_space: None,
            ..BackendStats::default()
        })
    }

    async fn health_check(&self) -> Result<()> {
        self.check_health()
    }
}

impl MemoryBackend {
    fn check_health(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(memoria_core::MemoriaError::Transient(format!(
                "backend '{}' is offline",
                self.name
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unhealthy_backend_refuses_operations() {
        let backend = MemoryBackend::new("mem");
        backend
            .store("a", "a.bin", Bytes::from_static(b"x"))
            .await
            .unwrap();

        backend.set_healthy(false);
        assert!(backend.retrieve("a").await.is_err());
        assert!(backend.health_check().await.is_err());

        backend.set_healthy(true);
        assert!(backend.retrieve("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn tamper_flips_stored_bytes() {
        let backend = MemoryBackend::new("mem");
        backend
            .store("a", "a.bin", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert!(backend.tamper("a", |bytes| bytes[0] ^= 0xFF));
        let got = backend.retrieve("a").await.unwrap().unwrap();
        assert_ne!(got, Bytes::from_static(b"abc"));
        assert!(!backend.tamper("missing", |_| {}));
    }

    #[tokio::test]
    async fn stats_track_sizes() {
        let backend = MemoryBackend::new("mem");
        backend.store("a", "a", Bytes::from_static(b"12345")).await.unwrap();
        backend.store("b", "b", Bytes::from_static(b"123")).await.unwrap();
        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_size, 8);
    }
}
