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

use super::MemoryId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a relation edge.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RelationId(pub i64);

impl std::fmt::Display for RelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A typed directed edge between two memories.
///
/// Edges are removed when either endpoint is deleted. Self-relations are
/// forbidden; strength must lie in [0.0, 1.0].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    /// Edge type, e.g. "contains", "related", "next", "duplicate_of".
    pub name: String,
    pub source_memory_id: MemoryId,
    pub target_memory_id: MemoryId,
    pub strength: f64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub owner_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relation {
    pub fn new(
        owner_id: i64,
        name: impl Into<String>,
        source: MemoryId,
        target: MemoryId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RelationId(0),
            name: name.into(),
            source_memory_id: source,
            target_memory_id: target,
            strength: 1.0,
            metadata: serde_json::Map::new(),
            owner_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    /// Whether this edge touches the given memory on either end.
    pub fn touches(&self, id: MemoryId) -> bool {
        self.source_memory_id == id || self.target_memory_id == id
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::MemoriaError::Integrity("relation name is empty".into()));
        }
        if self.source_memory_id == self.target_memory_id {
            return Err(crate::MemoriaError::Integrity(format!(
                "self-relation on memory {}",
                self.source_memory_id
            )));
        }
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(crate::MemoriaError::Integrity(format!(
                "relation strength {} outside [0.0, 1.0]",
                self.strength
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_relation_is_rejected() {
        let r = Relation::new(1, "related", MemoryId(5), MemoryId(5));
        assert!(r.validate().is_err());
    }

    #[test]
    fn strength_range_is_enforced() {
        let r = Relation::new(1, "next", MemoryId(1), MemoryId(2)).strength(1.5);
        assert!(r.validate().is_err());
        let r = Relation::new(1, "next", MemoryId(1), MemoryId(2)).strength(0.5);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn touches_checks_both_ends() {
        let r = Relation::new(1, "next", MemoryId(1), MemoryId(2));
        assert!(r.touches(MemoryId(1)));
        assert!(r.touches(MemoryId(2)));
        assert!(!r.touches(MemoryId(3)));
    }
}
