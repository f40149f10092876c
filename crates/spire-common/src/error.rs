//! Error types for Spire.

use thiserror::Error;

/// Result type alias using SpireError.
pub type Result<T> = std::result::Result<T, SpireError>;

/// Errors that can occur in Spire storage operations.
#[derive(Debug, Error)]
pub enum SpireError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Durable log errors
    #[error("log file {0} not found")]
    NotFound(i64),

    #[error("invalid log: {0}")]
    InvalidLog(String),

    #[error("log record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("log is closed")]
    LogClosed,

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl SpireError {
    /// Returns true for structural log corruption.
    pub fn is_invalid_log(&self) -> bool {
        matches!(self, SpireError::InvalidLog(_))
    }

    /// Returns true for the file-absent signal used during recovery.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SpireError::NotFound(_))
    }
}
