//! Group open options.

use std::time::Duration;

use crate::column::DEFAULT_MAX_LEAF;

/// How hard commits push data to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// fsync at each commit barrier (default).
    Full,
    /// No fsync; the OS writes back at leisure. Survives process death,
    /// not power loss.
    MemOnly,
    /// Background writeback is requested instead of a blocking sync.
    Async,
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Upper bound on B+-tree leaf element count.
    pub max_leaf_size: usize,
    pub durability: Durability,
    /// Refuse `begin_write`.
    pub read_only: bool,
    /// Record per-query descriptions and timings on the group.
    pub enable_metrics: bool,
    /// Permit rewriting an older on-disk format at open.
    pub allow_file_format_upgrade: bool,
    /// Accepted for configuration compatibility; the page-translation layer
    /// is not built into this crate, so a key is rejected at open.
    pub encryption_key: Option<Vec<u8>>,
    /// Default deadline for taking the write lock; `None` blocks.
    pub write_lock_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_leaf_size: DEFAULT_MAX_LEAF,
            durability: Durability::Full,
            read_only: false,
            enable_metrics: false,
            allow_file_format_upgrade: false,
            encryption_key: None,
            write_lock_timeout: None,
        }
    }
}

impl Options {
    /// Durable defaults for production use.
    pub fn production() -> Self {
        Self::default()
    }

    /// No fsync; fastest option for tests and scratch data.
    pub fn scratch() -> Self {
        Self {
            durability: Durability::MemOnly,
            ..Self::default()
        }
    }

    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = Options::default();
        assert_eq!(opts.max_leaf_size, DEFAULT_MAX_LEAF);
        assert_eq!(opts.durability, Durability::Full);
        assert!(!opts.read_only);
        assert!(opts.encryption_key.is_none());
    }

    #[test]
    fn named_profiles() {
        assert_eq!(Options::scratch().durability, Durability::MemOnly);
        assert!(Options::read_only().read_only);
    }
}
