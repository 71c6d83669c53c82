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

//! Memoria Deduplication Engine
//!
//! Detects memories whose content is identical, near-identical, or
//! semantically equivalent, and merges duplicate groups down to one
//! survivor while rewriting every relation edge that pointed at the
//! others.
//!
//! Three strategies, selectable per call:
//!
//! - **Exact**: group by a fast content hash (XxHash64 by default)
//! - **Fuzzy**: TF-IDF vectors compared by cosine similarity against a
//!   bounded window of following candidates
//! - **Semantic**: cosine similarity over externally produced embedding
//!   vectors

pub mod engine;
pub mod hash;
pub mod similarity;

pub use engine::{DedupEngine, DedupReport, DedupStats, DuplicateGroup, MergeOutcome, MergeStrategy};
pub use hash::ContentHasher;
pub use similarity::{cosine_f32, decode_embedding, jaccard, normalized_levenshtein, TfIdf};
