//! Error taxonomy for the memory store, schema registry, and router.
//!
//! Every failure a caller can branch on has its own variant so the HTTP layer
//! can tell a 404 from a 409 without string matching.

use thiserror::Error;

/// Result alias used across the store and router.
pub type MemoryResult<T> = Result<T, MemoryError>;

#[derive(Error, Debug)]
pub enum MemoryError {
    /// Malformed input. Never retried automatically.
    #[error("validation error: {0}")]
    Validation(String),

    /// Key absent or expired.
    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    /// Operation conflicts with current state (e.g. deleting the active schema).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Stored payload failed to decode; the entry has been quarantined.
    #[error("corrupt {entity} entry {key}: {reason}")]
    CorruptEntry {
        entity: String,
        key: String,
        reason: String,
    },

    /// A bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Backing storage or infrastructure failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl MemoryError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn corrupt(
        entity: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::CorruptEntry {
            entity: entity.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(message: impl std::fmt::Display) -> Self {
        Self::Storage(message.to_string())
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::CorruptEntry { .. } => "corrupt_entry",
            Self::Timeout(_) => "timeout",
            Self::Storage(_) => "storage",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for MemoryError {
    fn from(e: r2d2::Error) -> Self {
        Self::Storage(format!("failed to get connection from pool: {}", e))
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Storage(format!("blocking task failed: {}", e))
    }
}
