//! Crate error taxonomy, per.
//!
//! Four families: configuration errors fail fast at construction, I/O
//! errors carry the offending index/offset back to the caller, distributed
//! transport errors are always fatal, and assertion failures indicate a bug
//! in the engine itself rather than bad input.

use thiserror::Error;

/// Crate-wide result alias.
pub type FmmResult<T> = Result<T, FmmError>;

#[derive(Debug, Error)]
pub enum FmmError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error at index/offset {index}: {message}")]
    Io { index: usize, message: String },

    #[error("distributed transport error on rank {rank}: {message}")]
    Transport { rank: i32, message: String },

    #[error(
        "assertion failure at level {level:?}, group {group:?}, morton {morton:?}: {message}"
    )]
    Assertion {
        level: Option<u64>,
        group: Option<usize>,
        morton: Option<u64>,
        message: String,
    },
}

impl FmmError {
    pub fn configuration(message: impl Into<String>) -> Self {
        FmmError::Configuration(message.into())
    }

    pub fn io(index: usize, message: impl Into<String>) -> Self {
        FmmError::Io {
            index,
            message: message.into(),
        }
    }

    pub fn transport(rank: i32, message: impl Into<String>) -> Self {
        FmmError::Transport {
            rank,
            message: message.into(),
        }
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        FmmError::Assertion {
            level: None,
            group: None,
            morton: None,
            message: message.into(),
        }
    }

    pub fn assertion_at(
        level: Option<u64>,
        group: Option<usize>,
        morton: Option<u64>,
        message: impl Into<String>,
    ) -> Self {
        FmmError::Assertion {
            level,
            group,
            morton,
            message: message.into(),
        }
    }
}
