//! Error types for the record codec.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding log records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes were available than the record claims to need.
    #[error("truncated record: need {expected} bytes, have {actual}")]
    TruncatedRecord {
        /// Bytes required to decode the record.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Stored CRC32 does not match the computed checksum.
    #[error("checksum mismatch: stored {stored:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the record header.
        stored: u32,
        /// Checksum computed over the record body.
        computed: u32,
    },

    /// The flag field does not name a known mutation.
    #[error("unknown record flag: {bits:#06x}")]
    UnknownFlag {
        /// Raw flag bits from the header (terminal bit stripped).
        bits: u16,
    },

    /// The kind field does not name a known data structure.
    #[error("unknown record kind: {bits:#06x}")]
    UnknownKind {
        /// Raw kind bits from the header.
        bits: u16,
    },

    /// A bucket, key, or value exceeds the 4-byte length field.
    #[error("record field too large: {field} is {size} bytes")]
    FieldTooLarge {
        /// Which field overflowed.
        field: &'static str,
        /// Its size in bytes.
        size: usize,
    },
}

impl CodecError {
    /// Creates a truncation error.
    pub fn truncated(expected: usize, actual: usize) -> Self {
        Self::TruncatedRecord { expected, actual }
    }

    /// Returns true if this error marks an incomplete trailing record
    /// rather than corrupted bytes.
    #[must_use]
    pub fn is_truncation(&self) -> bool {
        matches!(self, Self::TruncatedRecord { .. })
    }
}
