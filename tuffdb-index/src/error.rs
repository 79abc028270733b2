//! Index error type.

use thiserror::Error;
use tuffdb_log::LogError;

/// Errors surfaced by the read index.
///
/// Absence is not an error: lookups that find nothing report it through
/// their result types. Errors mean the request was malformed or the
/// underlying log failed.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
