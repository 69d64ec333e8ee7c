//! Database configuration.

use crate::error::{CoreError, CoreResult};
use acorndb_codec::HEADER_SIZE;
use std::fmt;
use std::sync::Arc;

/// Callback invoked when a transaction closure returns an error.
pub type ErrorHandler = Arc<dyn Fn(&CoreError) + Send + Sync>;

/// How the in-memory index stores record locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// The B+Tree stores record pointers and metadata; values are read
    /// from segment files on access.
    HintKeyAndRam,
    /// Pointers plus the decoded value cached in memory.
    HintKeyValAndRam,
    /// Sparse B+Tree: only a subset of keys is indexed; misses fall back
    /// to a segment scan. Trades memory for lookup cost.
    HintBptSparse,
}

/// Configuration for opening a database.
#[derive(Clone)]
pub struct Config {
    /// How the in-memory index stores record locations.
    pub entry_idx_mode: IndexMode,

    /// Maximum bytes per segment before rollover.
    pub segment_size: u64,

    /// Descriptor cache capacity.
    pub max_fds_in_cache: usize,

    /// Fraction of the descriptor cache retained after an eviction pass.
    /// Must be in `(0, 1]`.
    pub clean_fds_cache_threshold: f64,

    /// Pre-allocated commit buffer size in bytes. Transactions whose
    /// encoded size exceeds this stream directly to the segment.
    pub commit_buffer_size: usize,

    /// Informational shard count for future use; no semantic effect.
    pub node_num: u64,

    /// Callback invoked when a transaction closure returns an error.
    pub error_handler: Option<ErrorHandler>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entry_idx_mode: IndexMode::HintKeyAndRam,
            segment_size: 64 * 1024 * 1024, // 64 MiB
            max_fds_in_cache: 1024,
            clean_fds_cache_threshold: 0.5,
            commit_buffer_size: 4 * 1024 * 1024, // 4 MiB
            node_num: 1,
            error_handler: None,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the index mode.
    #[must_use]
    pub const fn entry_idx_mode(mut self, mode: IndexMode) -> Self {
        self.entry_idx_mode = mode;
        self
    }

    /// Sets the maximum segment size.
    #[must_use]
    pub const fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets the descriptor cache capacity.
    #[must_use]
    pub const fn max_fds_in_cache(mut self, max: usize) -> Self {
        self.max_fds_in_cache = max;
        self
    }

    /// Sets the descriptor cache eviction threshold.
    #[must_use]
    pub const fn clean_fds_cache_threshold(mut self, threshold: f64) -> Self {
        self.clean_fds_cache_threshold = threshold;
        self
    }

    /// Sets the commit buffer size.
    #[must_use]
    pub const fn commit_buffer_size(mut self, size: usize) -> Self {
        self.commit_buffer_size = size;
        self
    }

    /// Sets the informational shard count.
    #[must_use]
    pub const fn node_num(mut self, n: u64) -> Self {
        self.node_num = n;
        self
    }

    /// Sets the error handler callback.
    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidArgument`] if the segment size cannot
    /// hold a single record header, the cache capacity is zero, or the
    /// eviction threshold is outside `(0, 1]`.
    pub fn validate(&self) -> CoreResult<()> {
        if self.segment_size <= HEADER_SIZE as u64 {
            return Err(CoreError::invalid_argument(format!(
                "segment_size must exceed the {HEADER_SIZE}-byte record header"
            )));
        }
        if self.max_fds_in_cache == 0 {
            return Err(CoreError::invalid_argument(
                "max_fds_in_cache must be at least 1",
            ));
        }
        if !(self.clean_fds_cache_threshold > 0.0 && self.clean_fds_cache_threshold <= 1.0) {
            return Err(CoreError::invalid_argument(
                "clean_fds_cache_threshold must be in (0, 1]",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("entry_idx_mode", &self.entry_idx_mode)
            .field("segment_size", &self.segment_size)
            .field("max_fds_in_cache", &self.max_fds_in_cache)
            .field("clean_fds_cache_threshold", &self.clean_fds_cache_threshold)
            .field("commit_buffer_size", &self.commit_buffer_size)
            .field("node_num", &self.node_num)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}
