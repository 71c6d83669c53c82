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

//! Content hashing for the exact strategy.

use memoria_core::HashMethod;
use sha2::{Digest, Sha256};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Hashes content with the configured method. XxHash64 is the default:
/// identical output grouping at a fraction of SHA-256's cost.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher {
    method: HashMethod,
}

impl ContentHasher {
    pub fn new(method: HashMethod) -> Self {
        Self { method }
    }

    pub fn method(&self) -> HashMethod {
        self.method
    }

    /// Digest as lowercase hex.
    pub fn hash(&self, content: &[u8]) -> String {
        match self.method {
            HashMethod::XxHash64 => {
                let mut hasher = XxHash64::with_seed(0);
                hasher.write(content);
                format!("{:016x}", hasher.finish())
            }
            HashMethod::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(content);
                hex::encode(hasher.finalize())
            }
            HashMethod::Md5 => format!("{:x}", md5::compute(content)),
            HashMethod::SeaHash => format!("{:016x}", seahash::hash(content)),
        }
    }
}
