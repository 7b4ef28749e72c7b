use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TabulaError>;

/// Primary error type for tabula operations.
///
/// Errors surface at the public API boundary; the core never swallows them.
/// Mutating operations carry the strong guarantee: on error no observable
/// state has changed and the enclosing write transaction stays open.
#[derive(Debug, Error)]
pub enum TabulaError {
    /// Header mismatch or corruption detected during traversal. Fatal for
    /// the handle.
    #[error("invalid file format: {detail}")]
    InvalidFormat { detail: String },

    /// The allocator could not extend the file or heap.
    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Attempt to mutate through a read snapshot or a read-only handle.
    #[error("attempt to write through a read-only handle")]
    ReadOnly,

    /// `begin_write` waited past its deadline for the file lock.
    #[error("timed out waiting for the write lock on '{path}'")]
    LockTimeout { path: PathBuf },

    /// Precondition violation; an internal bug in the caller.
    #[error("logic error: {0}")]
    LogicError(String),

    /// Column-to-column comparison across incompatible columns.
    #[error("column mismatch: {detail}")]
    QueryMismatch { detail: String },

    /// Operation is not supported by this build or configuration.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A lock guarding shared state was poisoned by a panicking thread.
    #[error("internal lock poisoned")]
    LockPoisoned,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TabulaError {
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::InvalidFormat {
            detail: detail.into(),
        }
    }

    pub fn logic(detail: impl Into<String>) -> Self {
        Self::LogicError(detail.into())
    }

    /// Whether retrying the operation may succeed without code changes.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::OutOfMemory { .. })
    }
}
