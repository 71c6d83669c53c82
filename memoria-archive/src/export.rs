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

//! JSON export shapes written into archives.
//!
//! Memory exports always carry decompressed content so an archive is
//! readable without the codec pipeline.

use chrono::{DateTime, Utc};
use memoria_core::{AccessLevel, Context, Memory, Relation};
use serde::{Deserialize, Serialize};

/// `memories/memory_<id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryExport {
    pub id: i64,
    pub title: String,
    /// Decompressed content.
    pub content: String,
    pub owner_id: i64,
    pub context_id: Option<i64>,
    pub access_level: AccessLevel,
    pub memory_metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Whether the live row stored its content compressed.
    pub content_compressed: bool,
}

impl MemoryExport {
    pub fn from_memory(memory: &Memory, content: String) -> Self {
        Self {
            id: memory.id.0,
            title: memory.title.clone(),
            content,
            owner_id: memory.owner_id,
            context_id: memory.context_id.map(|c| c.0),
            access_level: memory.access_level,
            memory_metadata: memory.metadata.clone(),
            created_at: memory.created_at,
            updated_at: memory.updated_at,
            content_compressed: memory.content_compressed,
        }
    }
}

/// `contexts/context_<id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextExport {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: i64,
    pub access_level: AccessLevel,
    pub context_metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContextExport {
    pub fn from_context(context: &Context) -> Self {
        Self {
            id: context.id.0,
            name: context.name.clone(),
            description: context.description.clone(),
            owner_id: context.owner_id,
            access_level: context.access_level,
            context_metadata: context.metadata.clone(),
            created_at: context.created_at,
            updated_at: context.updated_at,
        }
    }
}

/// One edge inside `relations/relations_<source_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationExport {
    pub id: i64,
    pub name: String,
    pub source_memory_id: i64,
    pub target_memory_id: i64,
    pub strength: f64,
    pub relation_metadata: serde_json::Map<String, serde_json::Value>,
    pub owner_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RelationExport {
    pub fn from_relation(relation: &Relation) -> Self {
        Self {
            id: relation.id.0,
            name: relation.name.clone(),
            source_memory_id: relation.source_memory_id.0,
            target_memory_id: relation.target_memory_id.0,
            strength: relation.strength,
            relation_metadata: relation.metadata.clone(),
            owner_id: relation.owner_id,
            created_at: relation.created_at,
            updated_at: relation.updated_at,
        }
    }
}
