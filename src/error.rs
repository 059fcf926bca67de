//! Structured error types for store operations.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    InvalidName,
    Forbidden,

    // Not found errors
    ConfigNotFound,

    // Conflict errors
    AlreadyExists,
    VersionOverflow,

    // Storage errors
    Corrupt,
    IoError,
    InternalError,
}

/// Errors raised by the config store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("config '{name}' not found")]
    NotFound { name: String },

    #[error("config '{name}' cannot be deleted")]
    Forbidden { name: String },

    #[error("invalid config name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("config '{name}' is corrupt: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config '{name}' has reached the maximum version")]
    VersionOverflow { name: String },

    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            StoreError::NotFound { .. } => ErrorCode::ConfigNotFound,
            StoreError::Forbidden { .. } => ErrorCode::Forbidden,
            StoreError::InvalidName { .. } => ErrorCode::InvalidName,
            StoreError::Corrupt { .. } => ErrorCode::Corrupt,
            StoreError::Io { .. } => ErrorCode::IoError,
            StoreError::VersionOverflow { .. } => ErrorCode::VersionOverflow,
            StoreError::Serialize(_) => ErrorCode::InternalError,
        }
    }
}

/// Serializable error body for CLI output.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&StoreError> for ErrorBody {
    fn from(err: &StoreError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Result type for store operations.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
