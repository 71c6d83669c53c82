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

use super::AccessLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a context.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ContextId(pub i64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A named bucket grouping related memories.
///
/// Contexts weakly reference memories: memories back-link by id and are
/// never owned by the context row. Deleting a context without cascade fails
/// while memories still point at it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: ContextId,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: i64,
    pub access_level: AccessLevel,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Context {
    pub fn new(owner_id: i64, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ContextId(0),
            name: name.into(),
            description: None,
            owner_id,
            access_level: AccessLevel::default(),
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
            is_active: true,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn access_level(mut self, level: AccessLevel) -> Self {
        self.access_level = level;
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::MemoriaError::Integrity("context name is empty".into()));
        }
        Ok(())
    }
}
