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

//! Object-store backend over the [`object_store`] crate.
//!
//! One adapter covers S3-compatible stores, Azure Blob, GCS, and the
//! crate's in-memory scheme; the concrete implementation is selected by the
//! configured URL (`s3://bucket/prefix`, `az://…`, `gs://…`, `memory:///`).
//! Extra descriptor config entries pass through as store options
//! (credentials, region, endpoint).

use super::{BackendStats, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use memoria_core::{MemoriaError, Result};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

pub struct ObjectStoreBackend {
    name: String,
    store: Arc<dyn ObjectStore>,
    base: ObjectPath,
}

impl ObjectStoreBackend {
    /// Build from a store URL plus pass-through options.
    pub fn from_url(
        name: impl Into<String>,
        url: &str,
        options: &HashMap<String, String>,
    ) -> Result<Self> {
        let name = name.into();
        let url = Url::parse(url)
            .map_err(|e| MemoriaError::Config(format!("backend '{name}': bad url: {e}")))?;
        let opts: Vec<(String, String)> = options
            .iter()
            .filter(|(key, _)| key.as_str() != "url")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let (store, base) = object_store::parse_url_opts(&url, opts)
            .map_err(|e| MemoriaError::Config(format!("backend '{name}': {e}")))?;
        Ok(Self {
            name,
            store: Arc::from(store),
            base,
        })
    }

    fn object_path(&self, id: &str) -> ObjectPath {
        self.base.child("objects").child(id)
    }

    fn map_err(&self, e: object_store::Error) -> MemoriaError {
        MemoriaError::Transient(format!("backend '{}': {e}", self.name))
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, id: &str, _filename: &str, data: Bytes) -> Result<()> {
        self.store
            .put(&self.object_path(id), PutPayload::from(data))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Bytes>> {
        match self.store.get(&self.object_path(id)).await {
            Ok(result) => {
                let bytes = result.bytes().await.map_err(|e| self.map_err(e))?;
                Ok(Some(bytes))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(self.map_err(e)),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match self.store.delete(&self.object_path(id)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(self.map_err(e)),
        }
    }

    async fn stats(&self) -> Result<BackendStats> {
        let prefix = self.base.child("objects");
        let mut stream = self.store.list(Some(&prefix));
        let mut total_size = 0u64;
        let mut file_count = 0u64;
        while let Some(meta) = stream.try_next().await.map_err(|e| self.map_err(e))? {
            total_size += meta.size as u64;
            file_count += 1;
        }
        Ok(BackendStats {
            total_size,
            file_count,
            available_space: None,
            ..BackendStats::default()
        })
    }

    async fn health_check(&self) -> Result<()> {
        // Listing the (possibly empty) prefix exercises auth and
        // connectivity without mutating anything.
        self.store
            .list_with_delimiter(Some(&self.base))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(())
    }
}
