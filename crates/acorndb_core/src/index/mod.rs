//! In-memory indexes, keyed per bucket and per data-structure kind.
//!
//! [`Indexes::apply`] is the single dispatch point for committed
//! entries: commit step 5 and recovery replay both go through it, so the
//! in-memory state is always the semantic replay of the log.

mod bptree;

pub(crate) use bptree::{BpTree, Iter as BpTreeIter};

use crate::config::IndexMode;
use crate::error::{CoreError, CoreResult};
use crate::structures::{ListIndex, SetIndex, SortedSetIndex};
use crate::types::FileId;
use acorndb_codec::{Entry, Flag, Kind};
use std::collections::HashMap;

/// In sparse index mode, one out of this many new-key writes per bucket
/// is admitted into the B+Tree.
pub(crate) const SPARSE_ADMIT_STRIDE: u64 = 4;

/// Location of an encoded record in the segment log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPtr {
    /// Segment file holding the record.
    pub file_id: FileId,
    /// Byte offset of the record start.
    pub data_pos: u64,
    /// Encoded record size in bytes.
    pub size: u32,
    /// CRC stored in the record header; re-validated on every read.
    pub header_digest: u32,
}

/// What the B+Tree stores per key: the record location, enough metadata
/// to decide liveness without touching disk, and (in value-caching mode)
/// the decoded value.
#[derive(Debug, Clone)]
pub(crate) struct IndexRecord {
    /// Location of the backing record.
    pub ptr: RecordPtr,
    /// Write timestamp, seconds since the Unix epoch.
    pub timestamp: u64,
    /// Commit identifier.
    pub tx_id: u64,
    /// Time-to-live in seconds; 0 is persistent.
    pub ttl: u32,
    /// Mutation the backing record expresses.
    pub flag: Flag,
    /// Cached value in `HintKeyValAndRam` mode.
    pub value: Option<Vec<u8>>,
}

impl IndexRecord {
    /// Returns true if this entry shadows the key rather than defining it.
    pub fn is_tombstone(&self) -> bool {
        self.flag.is_tombstone()
    }

    /// Returns true if the entry's ttl has elapsed at `now`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.ttl != 0 && self.timestamp.saturating_add(u64::from(self.ttl)) <= now
    }
}

impl Default for IndexRecord {
    fn default() -> Self {
        Self {
            ptr: RecordPtr {
                file_id: FileId::new(0),
                data_pos: 0,
                size: 0,
                header_digest: 0,
            },
            timestamp: 0,
            tx_id: 0,
            ttl: 0,
            flag: Flag::Put,
            value: None,
        }
    }
}

/// Encoding of mutation-specific value payloads.
pub(crate) mod payload {
    use super::{CoreError, CoreResult};

    /// Encodes a ZAdd payload: `score (8, f64 LE bits) || member`.
    pub fn encode_zadd(score: f64, member: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + member.len());
        buf.extend_from_slice(&score.to_le_bytes());
        buf.extend_from_slice(member);
        buf
    }

    /// Decodes a ZAdd payload.
    pub fn decode_zadd(value: &[u8]) -> CoreResult<(f64, &[u8])> {
        let (score, member) = split_i64ish(value, "when build sorted set idx: short zadd payload")?;
        Ok((f64::from_le_bytes(score), member))
    }

    /// Encodes a rank range: `start (8, i64 LE) || end (8, i64 LE)`.
    pub fn encode_rank_range(start: i64, end: i64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&start.to_le_bytes());
        buf.extend_from_slice(&end.to_le_bytes());
        buf
    }

    /// Decodes a rank range.
    pub fn decode_rank_range(value: &[u8]) -> CoreResult<(i64, i64)> {
        if value.len() < 16 {
            return Err(CoreError::index_build_failed(
                "when build sorted set idx: short rank range payload",
            ));
        }
        let (start, rest) =
            split_i64ish(value, "when build sorted set idx: short rank range payload")?;
        let (end, _) = split_i64ish(rest, "when build sorted set idx: short rank range payload")?;
        Ok((i64::from_le_bytes(start), i64::from_le_bytes(end)))
    }

    /// Encodes a list removal: `count (8, i64 LE) || item`.
    pub fn encode_list_rem(count: i64, item: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + item.len());
        buf.extend_from_slice(&count.to_le_bytes());
        buf.extend_from_slice(item);
        buf
    }

    /// Decodes a list removal payload.
    pub fn decode_list_rem(value: &[u8]) -> CoreResult<(i64, &[u8])> {
        let (count, item) = split_i64ish(value, "when build list idx: short list-rem payload")?;
        Ok((i64::from_le_bytes(count), item))
    }

    fn split_i64ish<'a>(value: &'a [u8], context: &str) -> CoreResult<([u8; 8], &'a [u8])> {
        if value.len() < 8 {
            return Err(CoreError::index_build_failed(context));
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&value[..8]);
        Ok((word, &value[8..]))
    }
}

/// All in-memory index state for one store.
#[derive(Debug)]
pub(crate) struct Indexes {
    mode: IndexMode,
    kv: HashMap<Vec<u8>, BpTree>,
    sets: HashMap<Vec<u8>, SetIndex>,
    zsets: HashMap<Vec<u8>, SortedSetIndex>,
    lists: HashMap<Vec<u8>, ListIndex>,
    /// Per-bucket new-key admission counters for sparse mode.
    sparse_admit: HashMap<Vec<u8>, u64>,
}

impl Indexes {
    /// Creates empty indexes for the given mode.
    pub fn new(mode: IndexMode) -> Self {
        Self {
            mode,
            kv: HashMap::new(),
            sets: HashMap::new(),
            zsets: HashMap::new(),
            lists: HashMap::new(),
            sparse_admit: HashMap::new(),
        }
    }

    /// The index mode these indexes were built under.
    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    /// The KV B+Tree for `bucket`, if the bucket exists.
    pub fn kv_bucket(&self, bucket: &[u8]) -> Option<&BpTree> {
        self.kv.get(bucket)
    }

    /// The set state for `bucket`, if the bucket exists.
    pub fn set_bucket(&self, bucket: &[u8]) -> Option<&SetIndex> {
        self.sets.get(bucket)
    }

    /// The sorted-set state for `bucket`, if the bucket exists.
    pub fn zset_bucket(&self, bucket: &[u8]) -> Option<&SortedSetIndex> {
        self.zsets.get(bucket)
    }

    /// The list state for `bucket`, if the bucket exists.
    pub fn list_bucket(&self, bucket: &[u8]) -> Option<&ListIndex> {
        self.lists.get(bucket)
    }

    /// Returns true if `bucket` exists for `kind`.
    pub fn bucket_exists(&self, kind: Kind, bucket: &[u8]) -> bool {
        match kind {
            Kind::Kv => self.kv.contains_key(bucket),
            Kind::Set => self.sets.contains_key(bucket),
            Kind::SortedSet => self.zsets.contains_key(bucket),
            Kind::List => self.lists.contains_key(bucket),
        }
    }

    /// Applies one committed entry.
    ///
    /// `now` is the replay or commit time used for expiry: an expired
    /// entry is not made live, and a fresh expired put removes the key's
    /// prior index entry.
    pub fn apply(&mut self, entry: &Entry, ptr: RecordPtr, now: u64) -> CoreResult<()> {
        let meta = &entry.meta;
        if meta.is_expired_at(now) {
            if meta.kind == Kind::Kv && meta.flag == Flag::Put {
                if let Some(tree) = self.kv.get_mut(&entry.bucket) {
                    tree.remove(&entry.key);
                }
            }
            return Ok(());
        }

        match (meta.kind, meta.flag) {
            (Kind::Kv, Flag::Put) => self.apply_kv_put(entry, ptr),
            (Kind::Kv, Flag::Delete) => {
                let tree = self.kv.entry(entry.bucket.clone()).or_insert_with(BpTree::new);
                if self.mode != IndexMode::HintBptSparse || tree.contains(&entry.key) {
                    tree.insert(entry.key.clone(), record_for(entry, ptr, None));
                }
                Ok(())
            }
            (Kind::Kv, Flag::DeleteBucket) => {
                self.kv.remove(&entry.bucket);
                self.sparse_admit.remove(&entry.bucket);
                Ok(())
            }

            (Kind::Set, Flag::SetAdd) => {
                self.sets
                    .entry(entry.bucket.clone())
                    .or_default()
                    .add(&entry.key, entry.value.clone());
                Ok(())
            }
            (Kind::Set, Flag::SetRemove) => {
                if let Some(set) = self.sets.get_mut(&entry.bucket) {
                    set.remove(&entry.key, &entry.value);
                    if set.is_empty() {
                        self.sets.remove(&entry.bucket);
                    }
                }
                Ok(())
            }
            (Kind::Set, Flag::DeleteBucket) => {
                self.sets.remove(&entry.bucket);
                Ok(())
            }

            (Kind::SortedSet, Flag::ZAdd) => {
                let (score, member) = payload::decode_zadd(&entry.value)?;
                self.zsets
                    .entry(entry.bucket.clone())
                    .or_default()
                    .add(&entry.key, score, member.to_vec());
                Ok(())
            }
            (Kind::SortedSet, Flag::ZRemove) => {
                if let Some(zset) = self.zsets.get_mut(&entry.bucket) {
                    zset.remove(&entry.key, &entry.value);
                    if zset.is_empty() {
                        self.zsets.remove(&entry.bucket);
                    }
                }
                Ok(())
            }
            (Kind::SortedSet, Flag::ZRemRangeByRank) => {
                let (start, end) = payload::decode_rank_range(&entry.value)?;
                if let Some(zset) = self.zsets.get_mut(&entry.bucket) {
                    zset.rem_range_by_rank(&entry.key, start, end);
                    if zset.is_empty() {
                        self.zsets.remove(&entry.bucket);
                    }
                }
                Ok(())
            }
            (Kind::SortedSet, Flag::DeleteBucket) => {
                self.zsets.remove(&entry.bucket);
                Ok(())
            }

            (Kind::List, Flag::LPush) => {
                self.lists
                    .entry(entry.bucket.clone())
                    .or_default()
                    .push_front(&entry.key, entry.value.clone());
                Ok(())
            }
            (Kind::List, Flag::RPush) => {
                self.lists
                    .entry(entry.bucket.clone())
                    .or_default()
                    .push_back(&entry.key, entry.value.clone());
                Ok(())
            }
            (Kind::List, Flag::LPop) => {
                if let Some(list) = self.lists.get_mut(&entry.bucket) {
                    list.pop_front(&entry.key);
                    if list.is_empty() {
                        self.lists.remove(&entry.bucket);
                    }
                }
                Ok(())
            }
            (Kind::List, Flag::RPop) => {
                if let Some(list) = self.lists.get_mut(&entry.bucket) {
                    list.pop_back(&entry.key);
                    if list.is_empty() {
                        self.lists.remove(&entry.bucket);
                    }
                }
                Ok(())
            }
            (Kind::List, Flag::ListRemove) => {
                let (count, item) = payload::decode_list_rem(&entry.value)?;
                if let Some(list) = self.lists.get_mut(&entry.bucket) {
                    list.rem(&entry.key, count, item);
                    if list.is_empty() {
                        self.lists.remove(&entry.bucket);
                    }
                }
                Ok(())
            }
            (Kind::List, Flag::DeleteBucket) => {
                self.lists.remove(&entry.bucket);
                Ok(())
            }

            (kind, flag) => Err(CoreError::index_build_failed(format!(
                "when build {kind:?} idx: unexpected flag {flag:?}"
            ))),
        }
    }

    fn apply_kv_put(&mut self, entry: &Entry, ptr: RecordPtr) -> CoreResult<()> {
        let cached = match self.mode {
            IndexMode::HintKeyValAndRam => Some(entry.value.clone()),
            IndexMode::HintKeyAndRam | IndexMode::HintBptSparse => None,
        };

        if self.mode == IndexMode::HintBptSparse {
            let present = self
                .kv
                .get(&entry.bucket)
                .is_some_and(|tree| tree.contains(&entry.key));
            if !present {
                let counter = self.sparse_admit.entry(entry.bucket.clone()).or_insert(0);
                let admit = *counter % SPARSE_ADMIT_STRIDE == 0;
                *counter += 1;
                if !admit {
                    // The bucket still exists even when the key is not
                    // admitted to the tree.
                    self.kv
                        .entry(entry.bucket.clone())
                        .or_insert_with(BpTree::new);
                    return Ok(());
                }
            }
        }

        self.kv
            .entry(entry.bucket.clone())
            .or_insert_with(BpTree::new)
            .insert(entry.key.clone(), record_for(entry, ptr, cached));
        Ok(())
    }
}

fn record_for(entry: &Entry, ptr: RecordPtr, value: Option<Vec<u8>>) -> IndexRecord {
    IndexRecord {
        ptr,
        timestamp: entry.meta.timestamp,
        tx_id: entry.meta.tx_id,
        ttl: entry.meta.ttl,
        flag: entry.meta.flag,
        value,
    }
}
