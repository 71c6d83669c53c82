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

//! On-disk archive registry: `registry.json`, replaced via rename-over-temp
//! so a crash mid-save never loses the previous state.

use crate::record::ArchiveRecord;
use chrono::{DateTime, Utc};
use memoria_core::{MemoriaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const REGISTRY_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: String,
    archives: BTreeMap<String, ArchiveRecord>,
    updated_at: DateTime<Utc>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION.to_string(),
            archives: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Archive-id → record map with crash-atomic persistence.
pub struct Registry {
    path: PathBuf,
    state: parking_lot::Mutex<RegistryFile>,
}

impl Registry {
    /// Load the registry at `<archive_dir>/registry.json`, starting empty
    /// when the file does not exist yet.
    pub fn open(archive_dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(archive_dir)?;
        let path = archive_dir.join("registry.json");
        let state = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes).map_err(|e| {
                MemoriaError::Corruption(format!("archive registry failed to decode: {e}"))
            })?
        } else {
            RegistryFile::default()
        };
        Ok(Self {
            path,
            state: parking_lot::Mutex::new(state),
        })
    }

    pub fn get(&self, archive_id: &str) -> Option<ArchiveRecord> {
        self.state.lock().archives.get(archive_id).cloned()
    }

    pub fn list(&self) -> Vec<ArchiveRecord> {
        self.state.lock().archives.values().cloned().collect()
    }

    /// Insert or replace a record and persist.
    pub async fn put(&self, record: ArchiveRecord) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.archives.insert(record.archive_id.clone(), record);
        }
        self.save().await
    }

    /// Remove a record and persist. Missing ids are a no-op.
    pub async fn remove(&self, archive_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.archives.remove(archive_id);
        }
        self.save().await
    }

    async fn save(&self) -> Result<()> {
        let bytes = {
            let mut state = self.state.lock();
            state.updated_at = Utc::now();
            serde_json::to_vec_pretty(&*state)?
        };
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
