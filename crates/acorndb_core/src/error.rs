//! Error types for the AcornDB core.

use acorndb_codec::CodecError;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in AcornDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The named bucket does not exist for the requested data structure.
    #[error("bucket not found: {bucket}")]
    BucketNotFound {
        /// Name of the bucket.
        bucket: String,
    },

    /// The key does not exist, is tombstoned, or has expired.
    #[error("key not found")]
    KeyNotFound,

    /// The set or sorted-set member does not exist.
    #[error("member not found")]
    MemberNotFound,

    /// The database has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// The transaction handle is no longer usable.
    #[error("transaction is closed")]
    TxClosed,

    /// A mutating operation was called inside a read-only transaction.
    #[error("transaction is read-only")]
    TxReadOnly,

    /// Another instance holds the data directory lock.
    #[error("directory locked: another instance has exclusive access")]
    DirLocked,

    /// The directory lock was already released before `close`.
    #[error("directory already unlocked")]
    DirUnlocked,

    /// A record referenced by a live index pointer failed to validate.
    #[error("corrupt record in segment {file_id} at offset {offset}")]
    CorruptRecord {
        /// Segment file containing the record.
        file_id: u64,
        /// Byte offset of the record start.
        offset: u64,
    },

    /// A sealed segment contains undecodable bytes; the log cannot be
    /// replayed past this point.
    #[error("corrupt log in segment {file_id} at offset {offset}: {message}")]
    CorruptLog {
        /// Segment file containing the corruption.
        file_id: u64,
        /// Byte offset where decoding failed.
        offset: u64,
        /// Description of the failure.
        message: String,
    },

    /// A single record exceeds the configured segment capacity.
    #[error("record of {size} bytes exceeds segment capacity of {max} bytes")]
    SegmentFull {
        /// Encoded record size.
        size: u64,
        /// Configured segment size.
        max: u64,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Rebuilding an in-memory index from the log failed.
    #[error("index build failed: {message}")]
    IndexBuildFailed {
        /// Description of the failure.
        message: String,
    },

    /// Invalid configuration or argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument issue.
        message: String,
    },
}

impl CoreError {
    /// Creates a bucket-not-found error from raw bucket bytes.
    pub fn bucket_not_found(bucket: &[u8]) -> Self {
        Self::BucketNotFound {
            bucket: String::from_utf8_lossy(bucket).into_owned(),
        }
    }

    /// Creates a corrupt-log error.
    pub fn corrupt_log(file_id: u64, offset: u64, message: impl Into<String>) -> Self {
        Self::CorruptLog {
            file_id,
            offset,
            message: message.into(),
        }
    }

    /// Creates an index-build-failed error.
    pub fn index_build_failed(message: impl Into<String>) -> Self {
        Self::IndexBuildFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true for the not-found family of errors.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BucketNotFound { .. } | Self::KeyNotFound | Self::MemberNotFound
        )
    }
}
