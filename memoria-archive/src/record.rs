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

use chrono::{DateTime, Utc};
use memoria_core::ArchiveFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    /// Packing is underway or was interrupted.
    Partial,
    /// Packed and checksummed.
    Completed,
    /// Checksum and format test passed.
    Verified,
    /// Checksum or format test failed. Never auto-deleted.
    Corrupted,
}

/// Registry entry for one archive (or multi-part archive set, described by
/// its primary file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub archive_id: String,
    pub policy_name: String,
    pub created_at: DateTime<Utc>,
    /// `None` for the permanent policy: never eligible for cleanup.
    pub retention_until: Option<DateTime<Utc>>,
    /// Total bytes across every part.
    pub size_bytes: u64,
    pub memory_count: usize,
    /// SHA-256 of the first pack file, lowercase hex.
    pub checksum: String,
    pub pack_path: PathBuf,
    pub status: ArchiveStatus,
    /// Space saved by packing, as a fraction of the exported bytes.
    pub compression_ratio: f64,
    pub format: ArchiveFormat,
    #[serde(default = "one")]
    pub part_count: u32,
}

fn one() -> u32 {
    1
}

impl ArchiveRecord {
    /// Whether the cleanup daemon may delete this archive now.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.retention_until {
            Some(until) => until <= now && self.policy_name != "permanent",
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(policy: &str, retention_until: Option<DateTime<Utc>>) -> ArchiveRecord {
        ArchiveRecord {
            archive_id: "a".into(),
            policy_name: policy.into(),
            created_at: Utc::now(),
            retention_until,
            size_bytes: 0,
            memory_count: 0,
            checksum: String::new(),
            pack_path: PathBuf::new(),
            status: ArchiveStatus::Completed,
            compression_ratio: 0.0,
            format: ArchiveFormat::TarGz,
            part_count: 1,
        }
    }

    #[test]
    fn permanent_archives_never_expire() {
        let now = Utc::now();
        assert!(!record("permanent", None).is_expired(now));
        // Even with a stale retention timestamp, the permanent policy wins.
        assert!(!record("permanent", Some(now - Duration::days(1))).is_expired(now));
    }

    #[test]
    fn past_retention_expires() {
        let now = Utc::now();
        assert!(record("temporary", Some(now - Duration::days(1))).is_expired(now));
        assert!(!record("temporary", Some(now + Duration::days(1))).is_expired(now));
    }
}
