//! Log error types.

use thiserror::Error;

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("record corrupted at position {position}: {reason}")]
    CorruptRecord { position: u64, reason: String },

    #[error("corrupt chunk: {reason}")]
    CorruptChunk { reason: String },

    #[error("database is corrupted: {0}")]
    CorruptDatabase(String),

    #[error("no chunk covers log position {0}")]
    ChunkNotFound(u64),

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("chunk {0} is marked for deletion")]
    ChunkMarkedForDeletion(String),

    #[error("timed out waiting for chunk {0} to be released")]
    DestroyTimeout(String),
}

impl LogError {
    /// Returns whether this error is retryable.
    ///
    /// A chunk marked for deletion has already been replaced in the chunk
    /// database; re-resolving the position yields its successor.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LogError::Io(_) | LogError::ChunkMarkedForDeletion(_)
        )
    }
}
