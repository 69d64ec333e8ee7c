//! Record decoding.

use crate::entry::{crc32, Entry, Flag, Kind, Meta, HEADER_SIZE, TX_FINAL_BIT};
use crate::error::{CodecError, CodecResult};

/// A decoded fixed-size record header.
///
/// The header alone is enough to size the payload read that follows it;
/// callers fetch `payload_size()` more bytes and hand the whole record
/// to [`decode_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Stored CRC32 over the rest of the record.
    pub crc: u32,
    /// Seconds since the Unix epoch at write time.
    pub timestamp: u64,
    /// Commit identifier.
    pub tx_id: u64,
    /// Key length in bytes.
    pub key_size: u32,
    /// Value length in bytes.
    pub value_size: u32,
    /// Raw flag bits, terminal marker included.
    pub flag_bits: u16,
    /// Raw kind bits.
    pub kind_bits: u16,
    /// Bucket length in bytes.
    pub bucket_size: u32,
    /// Time-to-live in seconds.
    pub ttl: u32,
}

impl RecordHeader {
    /// Decodes a header from the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TruncatedRecord`] if `buf` is too short.
    pub fn decode(buf: &[u8]) -> CodecResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::truncated(HEADER_SIZE, buf.len()));
        }

        Ok(Self {
            crc: read_u32(buf, 0),
            timestamp: read_u64(buf, 4),
            tx_id: read_u64(buf, 12),
            key_size: read_u32(buf, 20),
            value_size: read_u32(buf, 24),
            flag_bits: read_u16(buf, 28),
            kind_bits: read_u16(buf, 30),
            bucket_size: read_u32(buf, 32),
            ttl: read_u32(buf, 36),
        })
    }

    /// Bytes of bucket, key, and value that follow the header.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.bucket_size as usize + self.key_size as usize + self.value_size as usize
    }

    /// Total size of the encoded record.
    #[must_use]
    pub fn record_size(&self) -> usize {
        HEADER_SIZE + self.payload_size()
    }
}

/// A successfully decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// The decoded entry.
    pub entry: Entry,
    /// The CRC stored in the record; indexes keep it as the pointer's
    /// header digest.
    pub crc: u32,
    /// Bytes consumed from the input.
    pub size: usize,
}

/// Decodes one record from the start of `buf`.
///
/// # Errors
///
/// - [`CodecError::TruncatedRecord`] if `buf` ends before the record does.
/// - [`CodecError::ChecksumMismatch`] if the stored CRC does not validate.
/// - [`CodecError::UnknownFlag`] / [`CodecError::UnknownKind`] for
///   unrecognized header tags.
pub fn decode_entry(buf: &[u8]) -> CodecResult<Decoded> {
    let header = RecordHeader::decode(buf)?;
    let size = header.record_size();
    if buf.len() < size {
        return Err(CodecError::truncated(size, buf.len()));
    }

    let computed = crc32(&buf[4..size]);
    if computed != header.crc {
        return Err(CodecError::ChecksumMismatch {
            stored: header.crc,
            computed,
        });
    }

    let flag = Flag::from_u16(header.flag_bits & !TX_FINAL_BIT).ok_or(CodecError::UnknownFlag {
        bits: header.flag_bits & !TX_FINAL_BIT,
    })?;
    let kind = Kind::from_u16(header.kind_bits).ok_or(CodecError::UnknownKind {
        bits: header.kind_bits,
    })?;

    let bucket_end = HEADER_SIZE + header.bucket_size as usize;
    let key_end = bucket_end + header.key_size as usize;

    let entry = Entry {
        bucket: buf[HEADER_SIZE..bucket_end].to_vec(),
        key: buf[bucket_end..key_end].to_vec(),
        value: buf[key_end..size].to_vec(),
        meta: Meta {
            timestamp: header.timestamp,
            tx_id: header.tx_id,
            flag,
            kind,
            ttl: header.ttl,
            tx_final: header.flag_bits & TX_FINAL_BIT != 0,
        },
    };

    Ok(Decoded {
        entry,
        crc: header.crc,
        size,
    })
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
