#![forbid(unsafe_code)]
//! Error types for Riptide.
//!
//! Defines `RiptideError` and a `Result<T>` alias used throughout the
//! workspace. The block cache itself never fails an operation with one of
//! these; they travel inside job completions (a torn-down storage, a disk
//! write that failed in the executor) and out of configuration
//! validation.

use thiserror::Error;

/// Unified error type for all Riptide operations.
#[derive(Debug, Error)]
pub enum RiptideError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage removed before the operation completed")]
    StorageGone,

    #[error("buffer pool exhausted")]
    OutOfBuffers,

    #[error("operation aborted")]
    Aborted,

    #[error("piece {piece} failed hash verification")]
    HashFailure { piece: u32 },
}

impl RiptideError {
    /// True for failures the caller may retry after freeing resources.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::OutOfBuffers)
    }
}

/// Result alias using `RiptideError`.
pub type Result<T> = std::result::Result<T, RiptideError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings_are_stable() {
        assert_eq!(
            RiptideError::StorageGone.to_string(),
            "storage removed before the operation completed"
        );
        assert_eq!(
            RiptideError::Config("bad".to_owned()).to_string(),
            "invalid configuration: bad"
        );
    }

    #[test]
    fn only_pool_exhaustion_is_transient() {
        assert!(RiptideError::OutOfBuffers.is_transient());
        assert!(!RiptideError::StorageGone.is_transient());
        assert!(!RiptideError::Aborted.is_transient());
    }
}
