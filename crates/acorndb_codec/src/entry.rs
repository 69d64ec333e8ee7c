//! Log entry model and serialization.

use crate::error::{CodecError, CodecResult};

/// Size of the fixed record header in bytes.
///
/// crc (4) + timestamp (8) + tx_id (8) + key_size (4) + value_size (4)
/// + flag (2) + kind (2) + bucket_size (4) + ttl (4) = 40 bytes.
pub const HEADER_SIZE: usize = 40;

/// High bit of the on-disk flag field, marking the final entry of a
/// transaction. Stripped into [`Meta::tx_final`] on decode.
pub const TX_FINAL_BIT: u16 = 0x8000;

/// TTL value meaning the entry never expires.
pub const PERSISTENT: u32 = 0;

/// Which data structure a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Kind {
    /// Plain key-value pairs.
    Kv = 0,
    /// Unordered member sets.
    Set = 1,
    /// Ordered (score, member) sets.
    SortedSet = 2,
    /// Double-ended lists.
    List = 3,
}

impl Kind {
    /// Converts raw header bits to a kind.
    pub fn from_u16(bits: u16) -> Option<Self> {
        match bits {
            0 => Some(Self::Kv),
            1 => Some(Self::Set),
            2 => Some(Self::SortedSet),
            3 => Some(Self::List),
            _ => None,
        }
    }

    /// Converts the kind to its header bits.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// The mutation a record expresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Flag {
    /// Write a key-value pair.
    Put = 0,
    /// Tombstone a key.
    Delete = 1,
    /// Tombstone an entire bucket.
    DeleteBucket = 2,
    /// Add a member to a set.
    SetAdd = 10,
    /// Remove a member from a set.
    SetRemove = 11,
    /// Add or re-score a sorted-set member.
    ZAdd = 20,
    /// Remove a sorted-set member.
    ZRemove = 21,
    /// Remove a rank range from a sorted set.
    ZRemRangeByRank = 22,
    /// Push onto the head of a list.
    LPush = 30,
    /// Push onto the tail of a list.
    RPush = 31,
    /// Pop from the head of a list.
    LPop = 32,
    /// Pop from the tail of a list.
    RPop = 33,
    /// Remove occurrences of an item from a list.
    ListRemove = 34,
}

impl Flag {
    /// Converts raw header bits (terminal bit stripped) to a flag.
    pub fn from_u16(bits: u16) -> Option<Self> {
        match bits {
            0 => Some(Self::Put),
            1 => Some(Self::Delete),
            2 => Some(Self::DeleteBucket),
            10 => Some(Self::SetAdd),
            11 => Some(Self::SetRemove),
            20 => Some(Self::ZAdd),
            21 => Some(Self::ZRemove),
            22 => Some(Self::ZRemRangeByRank),
            30 => Some(Self::LPush),
            31 => Some(Self::RPush),
            32 => Some(Self::LPop),
            33 => Some(Self::RPop),
            34 => Some(Self::ListRemove),
            _ => None,
        }
    }

    /// Converts the flag to its header bits.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns true for flags that shadow a prior value.
    #[must_use]
    pub const fn is_tombstone(self) -> bool {
        matches!(self, Self::Delete | Self::DeleteBucket)
    }
}

/// Record metadata carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    /// Seconds since the Unix epoch at write time.
    pub timestamp: u64,
    /// Commit identifier; monotonically increasing, reflects commit order.
    pub tx_id: u64,
    /// The mutation this record expresses.
    pub flag: Flag,
    /// The data structure this record belongs to.
    pub kind: Kind,
    /// Time-to-live in seconds; [`PERSISTENT`] means never expires.
    pub ttl: u32,
    /// Whether this is the final record of its transaction.
    pub tx_final: bool,
}

impl Meta {
    /// Creates metadata for a pending mutation. Timestamp, tx_id, and the
    /// terminal marker are stamped at commit time.
    #[must_use]
    pub const fn new(flag: Flag, kind: Kind, ttl: u32) -> Self {
        Self {
            timestamp: 0,
            tx_id: 0,
            flag,
            kind,
            ttl,
            tx_final: false,
        }
    }

    /// Returns true if the entry's ttl has elapsed at `now` (seconds
    /// since the Unix epoch).
    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.ttl != PERSISTENT && self.timestamp.saturating_add(u64::from(self.ttl)) <= now
    }
}

/// A single log record: header metadata plus bucket, key, and value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Bucket the record belongs to.
    pub bucket: Vec<u8>,
    /// User key (set/zset/list name for structure records).
    pub key: Vec<u8>,
    /// Value payload; mutation-specific for structure records.
    pub value: Vec<u8>,
    /// Header metadata.
    pub meta: Meta,
}

impl Entry {
    /// Creates an entry for a pending mutation.
    #[must_use]
    pub fn new(bucket: Vec<u8>, key: Vec<u8>, value: Vec<u8>, meta: Meta) -> Self {
        Self {
            bucket,
            key,
            value,
            meta,
        }
    }

    /// Total encoded size of this entry in bytes.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.bucket.len() + self.key.len() + self.value.len()
    }

    /// Encodes the entry as `header || bucket || key || value`.
    ///
    /// The CRC32 field covers everything after itself. All integers are
    /// little-endian.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FieldTooLarge`] if the bucket, key, or value
    /// exceeds the 4-byte length field.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let bucket_size = field_len("bucket", self.bucket.len())?;
        let key_size = field_len("key", self.key.len())?;
        let value_size = field_len("value", self.value.len())?;

        let mut buf = Vec::with_capacity(self.encoded_size());

        // CRC placeholder, patched below.
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&self.meta.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.meta.tx_id.to_le_bytes());
        buf.extend_from_slice(&key_size.to_le_bytes());
        buf.extend_from_slice(&value_size.to_le_bytes());

        let mut flag_bits = self.meta.flag.as_u16();
        if self.meta.tx_final {
            flag_bits |= TX_FINAL_BIT;
        }
        buf.extend_from_slice(&flag_bits.to_le_bytes());
        buf.extend_from_slice(&self.meta.kind.as_u16().to_le_bytes());
        buf.extend_from_slice(&bucket_size.to_le_bytes());
        buf.extend_from_slice(&self.meta.ttl.to_le_bytes());

        buf.extend_from_slice(&self.bucket);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);

        let crc = crc32(&buf[4..]);
        buf[0..4].copy_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }
}

fn field_len(field: &'static str, len: usize) -> CodecResult<u32> {
    u32::try_from(len).map_err(|_| CodecError::FieldTooLarge { field, size: len })
}

/// Computes the CRC32 (IEEE) checksum of `data`.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        for kind in [Kind::Kv, Kind::Set, Kind::SortedSet, Kind::List] {
            assert_eq!(Kind::from_u16(kind.as_u16()), Some(kind));
        }
        assert_eq!(Kind::from_u16(99), None);
    }

    #[test]
    fn flag_roundtrip() {
        for flag in [
            Flag::Put,
            Flag::Delete,
            Flag::DeleteBucket,
            Flag::SetAdd,
            Flag::SetRemove,
            Flag::ZAdd,
            Flag::ZRemove,
            Flag::ZRemRangeByRank,
            Flag::LPush,
            Flag::RPush,
            Flag::LPop,
            Flag::RPop,
            Flag::ListRemove,
        ] {
            assert_eq!(Flag::from_u16(flag.as_u16()), Some(flag));
        }
        assert_eq!(Flag::from_u16(7), None);
    }

    #[test]
    fn encoded_size_matches_layout() {
        let entry = Entry::new(
            b"bucket".to_vec(),
            b"hello".to_vec(),
            b"world".to_vec(),
            Meta::new(Flag::Put, Kind::Kv, PERSISTENT),
        );
        assert_eq!(entry.encoded_size(), HEADER_SIZE + 6 + 5 + 5);
        assert_eq!(entry.encode().unwrap().len(), entry.encoded_size());
    }

    #[test]
    fn crc_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn expiry() {
        let mut meta = Meta::new(Flag::Put, Kind::Kv, 10);
        meta.timestamp = 100;
        assert!(!meta.is_expired_at(109));
        assert!(meta.is_expired_at(110));

        let persistent = Meta::new(Flag::Put, Kind::Kv, PERSISTENT);
        assert!(!persistent.is_expired_at(u64::MAX));
    }
}
