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

//! Error taxonomy shared across the workspace.
//!
//! Every public operation returns [`Result`]. The variants map to recovery
//! policies: `Transient` errors are retried with backoff and failed over to
//! another backend, `Corruption` is failed over to a replica before it
//! surfaces, everything else propagates unchanged.

use thiserror::Error;

/// Result type for all Memoria operations
pub type Result<T> = std::result::Result<T, MemoriaError>;

/// Errors that can occur anywhere in the memory store
#[derive(Debug, Error)]
pub enum MemoriaError {
    /// Entity id unknown
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique constraint or duplicate id
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invariant violated (foreign key, range, enum)
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// Checksum mismatch, decode failure, or format test failure
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Backend timeout or connection failure; safe to retry
    #[error("Transient storage error: {0}")]
    Transient(String),

    /// Deadline expired or cancellation signal fired
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Misconfigured backend, unknown policy, invalid knob value
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error from the local filesystem
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl MemoriaError {
    /// Whether a retry (possibly against another backend) can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, MemoriaError::Transient(_) | MemoriaError::Io(_))
    }

    /// Whether the stored bytes themselves are suspect. Corrupt copies are
    /// never retried in place; the caller fails over to a replica.
    pub fn is_corruption(&self) -> bool {
        matches!(self, MemoriaError::Corruption(_))
    }

    /// Short machine-readable kind for reports and audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            MemoriaError::NotFound(_) => "not_found",
            MemoriaError::Conflict(_) => "conflict",
            MemoriaError::Integrity(_) => "integrity",
            MemoriaError::Corruption(_) => "corruption",
            MemoriaError::Transient(_) => "transient",
            MemoriaError::Cancelled(_) => "cancelled",
            MemoriaError::Config(_) => "config",
            MemoriaError::Io(_) => "io",
            MemoriaError::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for MemoriaError {
    fn from(e: serde_json::Error) -> Self {
        MemoriaError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(MemoriaError::Transient("timeout".into()).is_transient());
        assert!(MemoriaError::Io(std::io::Error::other("reset")).is_transient());
        assert!(!MemoriaError::Corruption("bad checksum".into()).is_transient());
        assert!(!MemoriaError::NotFound("memory 7".into()).is_transient());
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(MemoriaError::Conflict("dup".into()).kind(), "conflict");
        assert_eq!(MemoriaError::Cancelled("deadline".into()).kind(), "cancelled");
    }
}
