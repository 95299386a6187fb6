//! shardlog Error Types

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for shardlog operations
pub type Result<T> = std::result::Result<T, Error>;

/// shardlog error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Log format errors
    #[error("Format error: {0}")]
    Format(String),

    #[error("Log file {file} corrupted: {reason}")]
    Corrupted { file: PathBuf, reason: String },

    #[error("Directory {0} is locked by another writer")]
    DirLocked(PathBuf),

    // WAL writer errors
    #[error("WAL writer failure: {0}")]
    WriterFailure(String),

    // Recovery errors
    #[error("Out of order row: expected LSN {expected}, got {got}")]
    OutOfOrder { expected: i64, got: i64 },

    #[error("SCN gap: expected {expected}, got {got}")]
    ScnGap { expected: i64, got: i64 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Replication errors
    #[error("Handshake mismatch: {0}")]
    HandshakeMismatch(String),

    #[error("Quorum not reached: {reached}/{required}")]
    QuorumTimeout { reached: usize, required: usize },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable by the remote standby loop
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::HandshakeMismatch(_)
                | Error::Format(_)
                | Error::Cancelled
                | Error::Io(_)
        )
    }

    /// Check if this error means the WAL writer must be restarted
    pub fn is_writer_failure(&self) -> bool {
        matches!(self, Error::WriterFailure(_))
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::HandshakeMismatch("filter".into()).is_retryable());
        assert!(!Error::OutOfOrder { expected: 2, got: 4 }.is_retryable());
        assert!(!Error::DirLocked(PathBuf::from("/tmp")).is_retryable());
        assert!(Error::WriterFailure("disk full".into()).is_writer_failure());
    }
}
