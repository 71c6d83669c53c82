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

//! Per-call options and the operation context.
//!
//! [`StorageOptions`] is constructed once per call from the engine
//! configuration; callers override individual decisions instead of passing
//! loose booleans through every layer.

use memoria_core::{AccessLevel, EngineConfig, MemoriaError, Result};
use std::time::{Duration, Instant};

/// How much of a memory a read materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Return a stub whose content holds only the preview.
    #[default]
    Lazy,
    /// Decompress and reassemble the full content.
    Eager,
}

/// Storage decisions for one write, defaulted from the configuration.
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Run content through the codec pipeline.
    pub compress: bool,
    /// Split content into chunk rows.
    pub chunked: bool,
    /// Store the content as a router-managed external object instead of
    /// inline.
    pub external: bool,
    /// Scan for exact duplicates after the write and log matches.
    pub dedup_check: bool,
}

impl StorageOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            compress: config.compression.enabled,
            chunked: config.chunked_storage.enabled,
            external: false,
            dedup_check: false,
        }
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn chunked(mut self, chunked: bool) -> Self {
        self.chunked = chunked;
        self
    }

    pub fn external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    pub fn dedup_check(mut self, dedup_check: bool) -> Self {
        self.dedup_check = dedup_check;
        self
    }
}

/// Who is asking. Reads succeed when the accessor's level is at or above
/// the row's.
#[derive(Debug, Clone, Copy)]
pub struct Accessor {
    pub user_id: i64,
    pub level: AccessLevel,
}

impl Accessor {
    pub fn new(user_id: i64, level: AccessLevel) -> Self {
        Self { user_id, level }
    }

    pub fn admin(user_id: i64) -> Self {
        Self::new(user_id, AccessLevel::Admin)
    }
}

/// Deadline carrier checked at every suspension point. An expired context
/// turns the operation into a `Cancelled` error after rollback.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
}

impl OpContext {
    /// No deadline.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// Error out when the deadline has passed.
    pub fn check(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(MemoriaError::Cancelled(
                "operation deadline expired".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.check().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_from_config() {
        let config = EngineConfig::default();
        let options = StorageOptions::from_config(&config);
        assert!(options.compress);
        assert!(!options.chunked);
        assert!(!options.external);
        assert!(!options.dedup_check);

        let options = options.chunked(true).compress(false);
        assert!(options.chunked);
        assert!(!options.compress);
    }

    #[test]
    fn expired_context_reports_cancelled() {
        let ctx = OpContext::with_timeout(Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(ctx.check(), Err(MemoriaError::Cancelled(_))));
        assert!(OpContext::unbounded().check().is_ok());
    }
}
