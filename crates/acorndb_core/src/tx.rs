//! Transaction handles.
//!
//! A [`Tx`] is handed to the closures passed to
//! [`Database::view`](crate::Database::view) and
//! [`Database::update`](crate::Database::update). It holds a shared read
//! grip on the in-memory indexes for the closure's duration, so reads
//! observe a consistent committed snapshot; an update additionally
//! buffers its mutations as ordered pending entries and reads its own
//! writes through that overlay.

use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use crate::index::{payload, BpTree, BpTreeIter, IndexRecord, Indexes, RecordPtr};
use crate::structures::{range_of, remove_occurrences, SortedSetIndex};
use crate::types::{unix_now, TxId};
use acorndb_codec::{Entry, Flag, Kind, Meta};
use parking_lot::RwLockReadGuard;
use std::collections::{HashSet, VecDeque};

/// Net effect of a transaction's pending entries on one KV key.
enum PendingKv<'a> {
    Value(&'a [u8]),
    Deleted,
    BucketDeleted,
}

/// A transaction handle.
///
/// Obtained through `Database::view` (read-only) or `Database::update`
/// (read-write). Mutating operations inside a view fail with
/// [`CoreError::TxReadOnly`].
pub struct Tx<'db> {
    db: &'db Database,
    indexes: RwLockReadGuard<'db, Indexes>,
    writable: bool,
    closed: bool,
    snapshot_tx_id: TxId,
    pending: Vec<Entry>,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(
        db: &'db Database,
        writable: bool,
        indexes: RwLockReadGuard<'db, Indexes>,
        snapshot_tx_id: TxId,
    ) -> Self {
        Self {
            db,
            indexes,
            writable,
            closed: false,
            snapshot_tx_id,
            pending: Vec::new(),
        }
    }

    /// Closes the handle and hands the buffered mutations to the engine.
    pub(crate) fn into_pending(mut self) -> Vec<Entry> {
        self.closed = true;
        std::mem::take(&mut self.pending)
    }

    /// Whether this transaction may mutate.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// The last committed transaction ID visible to this handle.
    #[must_use]
    pub fn snapshot_tx_id(&self) -> TxId {
        self.snapshot_tx_id
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed {
            return Err(CoreError::TxClosed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        self.ensure_open()?;
        if !self.writable {
            return Err(CoreError::TxReadOnly);
        }
        Ok(())
    }

    /// Buffers one mutation, rejecting records a segment cannot hold.
    fn push_entry(
        &mut self,
        flag: Flag,
        kind: Kind,
        bucket: &[u8],
        key: &[u8],
        value: Vec<u8>,
        ttl: u32,
    ) -> CoreResult<()> {
        self.ensure_writable()?;
        let entry = Entry::new(
            bucket.to_vec(),
            key.to_vec(),
            value,
            Meta::new(flag, kind, ttl),
        );
        let size = entry.encoded_size() as u64;
        let max = self.db.config().segment_size;
        if size > max {
            return Err(CoreError::SegmentFull { size, max });
        }
        self.pending.push(entry);
        Ok(())
    }

    // === Plain KV ===

    /// Writes `value` under `key` in `bucket`. A `ttl` of
    /// [`acorndb_codec::PERSISTENT`] (0) never expires.
    pub fn put(&mut self, bucket: &str, key: &[u8], value: &[u8], ttl: u32) -> CoreResult<()> {
        self.push_entry(
            Flag::Put,
            Kind::Kv,
            bucket.as_bytes(),
            key,
            value.to_vec(),
            ttl,
        )
    }

    /// Reads the value under `key` in `bucket`.
    ///
    /// # Errors
    ///
    /// [`CoreError::BucketNotFound`] if the bucket does not exist,
    /// [`CoreError::KeyNotFound`] if the key is absent, tombstoned, or
    /// expired.
    pub fn get(&self, bucket: &str, key: &[u8]) -> CoreResult<Vec<u8>> {
        self.ensure_open()?;
        let b = bucket.as_bytes();
        match self.pending_kv(b, key) {
            Some(PendingKv::Value(v)) => return Ok(v.to_vec()),
            Some(PendingKv::Deleted) => return Err(CoreError::KeyNotFound),
            Some(PendingKv::BucketDeleted) => return Err(CoreError::bucket_not_found(b)),
            None => {}
        }

        let (ptr, cached) = self.locate_live(b, key)?;
        match cached {
            Some(value) => Ok(value),
            None => Ok(self.db.read_entry(&ptr)?.value),
        }
    }

    /// Returns the log location of the live record for `key`.
    ///
    /// Resolves committed state only; a value buffered in this
    /// transaction has no location until commit.
    pub fn get_record_ptr(&self, bucket: &str, key: &[u8]) -> CoreResult<RecordPtr> {
        self.ensure_open()?;
        let (ptr, _) = self.locate_live(bucket.as_bytes(), key)?;
        Ok(ptr)
    }

    /// Tombstones `key` in `bucket`.
    pub fn delete(&mut self, bucket: &str, key: &[u8]) -> CoreResult<()> {
        self.ensure_writable()?;
        let b = bucket.as_bytes();
        match self.pending_kv(b, key) {
            Some(PendingKv::Value(_)) => {}
            Some(PendingKv::Deleted) => return Err(CoreError::KeyNotFound),
            Some(PendingKv::BucketDeleted) => return Err(CoreError::bucket_not_found(b)),
            None => {
                self.locate_live(b, key)?;
            }
        }
        self.push_entry(Flag::Delete, Kind::Kv, b, key, Vec::new(), 0)
    }

    /// Tombstones the whole `bucket` for the given data-structure kind.
    pub fn delete_bucket(&mut self, kind: Kind, bucket: &str) -> CoreResult<()> {
        self.ensure_writable()?;
        let b = bucket.as_bytes();
        if !self.bucket_exists_staged(kind, b) {
            return Err(CoreError::bucket_not_found(b));
        }
        self.push_entry(Flag::DeleteBucket, kind, b, &[], Vec::new(), 0)
    }

    // === Sets ===

    /// Adds `member` to the set at `key`.
    pub fn s_add(&mut self, bucket: &str, key: &[u8], member: &[u8]) -> CoreResult<()> {
        self.push_entry(
            Flag::SetAdd,
            Kind::Set,
            bucket.as_bytes(),
            key,
            member.to_vec(),
            0,
        )
    }

    /// Removes `member` from the set at `key`.
    pub fn s_remove(&mut self, bucket: &str, key: &[u8], member: &[u8]) -> CoreResult<()> {
        self.ensure_writable()?;
        let b = bucket.as_bytes();
        let (exists, members) = self.staged_set(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        if !members.contains(member) {
            return Err(CoreError::MemberNotFound);
        }
        self.push_entry(Flag::SetRemove, Kind::Set, b, key, member.to_vec(), 0)
    }

    /// Returns true if `member` is in the set at `key`.
    pub fn s_is_member(&self, bucket: &str, key: &[u8], member: &[u8]) -> CoreResult<bool> {
        self.ensure_open()?;
        let b = bucket.as_bytes();
        let (exists, members) = self.staged_set(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        Ok(members.contains(member))
    }

    /// Returns the members of the set at `key`, sorted bytewise.
    pub fn s_members(&self, bucket: &str, key: &[u8]) -> CoreResult<Vec<Vec<u8>>> {
        self.ensure_open()?;
        let b = bucket.as_bytes();
        let (exists, members) = self.staged_set(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        if members.is_empty() {
            return Err(CoreError::KeyNotFound);
        }
        let mut out: Vec<Vec<u8>> = members.into_iter().collect();
        out.sort_unstable();
        Ok(out)
    }

    /// Number of members in the set at `key`.
    pub fn s_card(&self, bucket: &str, key: &[u8]) -> CoreResult<usize> {
        self.ensure_open()?;
        let b = bucket.as_bytes();
        let (exists, members) = self.staged_set(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        Ok(members.len())
    }

    // === Sorted sets ===

    /// Adds `member` with `score` to the sorted set at `key`,
    /// re-scoring it if already present.
    pub fn z_add(&mut self, bucket: &str, key: &[u8], score: f64, member: &[u8]) -> CoreResult<()> {
        self.push_entry(
            Flag::ZAdd,
            Kind::SortedSet,
            bucket.as_bytes(),
            key,
            payload::encode_zadd(score, member),
            0,
        )
    }

    /// Removes `member` from the sorted set at `key`.
    pub fn z_remove(&mut self, bucket: &str, key: &[u8], member: &[u8]) -> CoreResult<()> {
        self.ensure_writable()?;
        let b = bucket.as_bytes();
        let (exists, staged) = self.staged_zset(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        if staged.score(key, member).is_none() {
            return Err(CoreError::MemberNotFound);
        }
        self.push_entry(
            Flag::ZRemove,
            Kind::SortedSet,
            b,
            key,
            member.to_vec(),
            0,
        )
    }

    /// Returns the score of `member` in the sorted set at `key`.
    pub fn z_score(&self, bucket: &str, key: &[u8], member: &[u8]) -> CoreResult<f64> {
        self.ensure_open()?;
        let b = bucket.as_bytes();
        let (exists, staged) = self.staged_zset(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        staged.score(key, member).ok_or(CoreError::MemberNotFound)
    }

    /// Number of members in the sorted set at `key`; 0 if absent.
    pub fn z_card(&self, bucket: &str, key: &[u8]) -> CoreResult<usize> {
        self.ensure_open()?;
        let b = bucket.as_bytes();
        let (exists, staged) = self.staged_zset(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        Ok(staged.card(key))
    }

    /// Members with ranks in `[start, end]`, ascending by score. Ranks
    /// are 1-based; negative ranks count from the tail.
    pub fn z_range_by_rank(
        &self,
        bucket: &str,
        key: &[u8],
        start: i64,
        end: i64,
    ) -> CoreResult<Vec<(f64, Vec<u8>)>> {
        self.ensure_open()?;
        let b = bucket.as_bytes();
        let (exists, staged) = self.staged_zset(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        if !staged.contains_key(key) {
            return Err(CoreError::KeyNotFound);
        }
        Ok(staged.range_by_rank(key, start, end))
    }

    /// Removes members with ranks in `[start, end]`; returns the count.
    pub fn z_rem_range_by_rank(
        &mut self,
        bucket: &str,
        key: &[u8],
        start: i64,
        end: i64,
    ) -> CoreResult<usize> {
        self.ensure_writable()?;
        let b = bucket.as_bytes();
        let (exists, mut staged) = self.staged_zset(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        if !staged.contains_key(key) {
            return Err(CoreError::KeyNotFound);
        }
        let removed = staged.rem_range_by_rank(key, start, end);
        self.push_entry(
            Flag::ZRemRangeByRank,
            Kind::SortedSet,
            b,
            key,
            payload::encode_rank_range(start, end),
            0,
        )?;
        Ok(removed)
    }

    // === Lists ===

    /// Pushes `item` onto the head of the list at `key`.
    pub fn l_push(&mut self, bucket: &str, key: &[u8], item: &[u8]) -> CoreResult<()> {
        self.push_entry(
            Flag::LPush,
            Kind::List,
            bucket.as_bytes(),
            key,
            item.to_vec(),
            0,
        )
    }

    /// Pushes `item` onto the tail of the list at `key`.
    pub fn r_push(&mut self, bucket: &str, key: &[u8], item: &[u8]) -> CoreResult<()> {
        self.push_entry(
            Flag::RPush,
            Kind::List,
            bucket.as_bytes(),
            key,
            item.to_vec(),
            0,
        )
    }

    /// Pops the head item of the list at `key`.
    pub fn l_pop(&mut self, bucket: &str, key: &[u8]) -> CoreResult<Vec<u8>> {
        self.list_pop(bucket, key, Flag::LPop)
    }

    /// Pops the tail item of the list at `key`.
    pub fn r_pop(&mut self, bucket: &str, key: &[u8]) -> CoreResult<Vec<u8>> {
        self.list_pop(bucket, key, Flag::RPop)
    }

    fn list_pop(&mut self, bucket: &str, key: &[u8], flag: Flag) -> CoreResult<Vec<u8>> {
        self.ensure_writable()?;
        let b = bucket.as_bytes();
        let (exists, items) = self.staged_list(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        let item = match flag {
            Flag::LPop => items.front(),
            _ => items.back(),
        };
        let Some(item) = item.cloned() else {
            return Err(CoreError::KeyNotFound);
        };
        self.push_entry(flag, Kind::List, b, key, Vec::new(), 0)?;
        Ok(item)
    }

    /// Items of the list at `key` with indices in `[start, end]`;
    /// negative indices count from the tail.
    pub fn l_range(
        &self,
        bucket: &str,
        key: &[u8],
        start: i64,
        end: i64,
    ) -> CoreResult<Vec<Vec<u8>>> {
        self.ensure_open()?;
        let b = bucket.as_bytes();
        let (exists, items) = self.staged_list(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        if items.is_empty() {
            return Err(CoreError::KeyNotFound);
        }
        Ok(range_of(&items, start, end))
    }

    /// Removes occurrences of `item` from the list at `key`; `count`
    /// follows the usual head/tail/all convention. Returns the count
    /// actually removed.
    pub fn l_rem(&mut self, bucket: &str, key: &[u8], count: i64, item: &[u8]) -> CoreResult<usize> {
        self.ensure_writable()?;
        let b = bucket.as_bytes();
        let (exists, mut items) = self.staged_list(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        if items.is_empty() {
            return Err(CoreError::KeyNotFound);
        }
        let removed = remove_occurrences(&mut items, count, item);
        self.push_entry(
            Flag::ListRemove,
            Kind::List,
            b,
            key,
            payload::encode_list_rem(count, item),
            0,
        )?;
        Ok(removed)
    }

    /// Length of the list at `key`; 0 if absent.
    pub fn l_size(&self, bucket: &str, key: &[u8]) -> CoreResult<usize> {
        self.ensure_open()?;
        let b = bucket.as_bytes();
        let (exists, items) = self.staged_list(b, key);
        if !exists {
            return Err(CoreError::bucket_not_found(b));
        }
        Ok(items.len())
    }

    // === Iteration ===

    /// Returns a forward cursor over the bucket's keys in ascending
    /// order, skipping tombstoned and expired entries.
    ///
    /// The cursor observes committed state only; in sparse index mode it
    /// visits indexed keys only.
    pub fn iter<'tx>(&'tx self, bucket: &str) -> BucketIter<'tx, 'db> {
        BucketIter {
            tx: self,
            tree: self.indexes.kv_bucket(bucket.as_bytes()),
            inner: None,
            current: None,
        }
    }

    // === Resolution helpers ===

    pub(crate) fn read_index_value(&self, rec: &IndexRecord) -> CoreResult<Vec<u8>> {
        match &rec.value {
            Some(value) => Ok(value.clone()),
            None => Ok(self.db.read_entry(&rec.ptr)?.value),
        }
    }

    /// Finds the live committed record for a KV key.
    fn locate_live(&self, bucket: &[u8], key: &[u8]) -> CoreResult<(RecordPtr, Option<Vec<u8>>)> {
        let now = unix_now();
        let Some(tree) = self.indexes.kv_bucket(bucket) else {
            if self.bucket_exists_staged(Kind::Kv, bucket) {
                return Err(CoreError::KeyNotFound);
            }
            return Err(CoreError::bucket_not_found(bucket));
        };

        match tree.get(key) {
            Some(rec) => {
                if rec.is_tombstone() || rec.is_expired_at(now) {
                    Err(CoreError::KeyNotFound)
                } else {
                    Ok((rec.ptr, rec.value.clone()))
                }
            }
            None if self.indexes.mode() == crate::config::IndexMode::HintBptSparse => {
                match self
                    .db
                    .scan_latest(bucket, key, self.snapshot_tx_id.as_u64())?
                {
                    Some((entry, ptr))
                        if entry.meta.flag == Flag::Put && !entry.meta.is_expired_at(now) =>
                    {
                        Ok((ptr, Some(entry.value)))
                    }
                    _ => Err(CoreError::KeyNotFound),
                }
            }
            None => Err(CoreError::KeyNotFound),
        }
    }

    /// Net effect of the pending buffer on one KV key, newest first.
    fn pending_kv<'a>(&'a self, bucket: &[u8], key: &[u8]) -> Option<PendingKv<'a>> {
        if !self.writable {
            return None;
        }
        for entry in self.pending.iter().rev() {
            if entry.meta.kind != Kind::Kv || entry.bucket != bucket {
                continue;
            }
            match entry.meta.flag {
                Flag::DeleteBucket => return Some(PendingKv::BucketDeleted),
                Flag::Put if entry.key == key => return Some(PendingKv::Value(&entry.value)),
                Flag::Delete if entry.key == key => return Some(PendingKv::Deleted),
                _ => {}
            }
        }
        None
    }

    /// Whether `bucket` exists for `kind`, with pending mutations
    /// applied over committed state.
    fn bucket_exists_staged(&self, kind: Kind, bucket: &[u8]) -> bool {
        let mut exists = self.indexes.bucket_exists(kind, bucket);
        for entry in &self.pending {
            if entry.meta.kind != kind || entry.bucket != bucket {
                continue;
            }
            exists = match entry.meta.flag {
                Flag::DeleteBucket => false,
                Flag::Put | Flag::SetAdd | Flag::ZAdd | Flag::LPush | Flag::RPush => true,
                _ => exists,
            };
        }
        exists
    }

    /// The set at `(bucket, key)` with pending mutations replayed onto
    /// a copy of the committed members.
    fn staged_set(&self, bucket: &[u8], key: &[u8]) -> (bool, HashSet<Vec<u8>>) {
        let committed = self.indexes.set_bucket(bucket);
        let mut exists = committed.is_some();
        let mut members: HashSet<Vec<u8>> = committed
            .and_then(|set| set.members(key))
            .cloned()
            .unwrap_or_default();

        for entry in &self.pending {
            if entry.meta.kind != Kind::Set || entry.bucket != bucket {
                continue;
            }
            match entry.meta.flag {
                Flag::DeleteBucket => {
                    exists = false;
                    members.clear();
                }
                Flag::SetAdd if entry.key == key => {
                    exists = true;
                    members.insert(entry.value.clone());
                }
                Flag::SetRemove if entry.key == key => {
                    members.remove(&entry.value);
                }
                Flag::SetAdd => exists = true,
                _ => {}
            }
        }
        (exists, members)
    }

    /// The sorted set at `(bucket, key)` with pending mutations replayed
    /// onto a copy of the committed members.
    fn staged_zset(&self, bucket: &[u8], key: &[u8]) -> (bool, SortedSetIndex) {
        let committed = self.indexes.zset_bucket(bucket);
        let mut exists = committed.is_some();
        let mut staged = SortedSetIndex::default();
        if let Some(zset) = committed {
            for (score, member) in zset.range_by_rank(key, 1, -1) {
                staged.add(key, score, member);
            }
        }

        for entry in &self.pending {
            if entry.meta.kind != Kind::SortedSet || entry.bucket != bucket {
                continue;
            }
            match entry.meta.flag {
                Flag::DeleteBucket => {
                    exists = false;
                    staged = SortedSetIndex::default();
                }
                Flag::ZAdd if entry.key == key => {
                    exists = true;
                    if let Ok((score, member)) = payload::decode_zadd(&entry.value) {
                        staged.add(key, score, member.to_vec());
                    }
                }
                Flag::ZRemove if entry.key == key => {
                    staged.remove(key, &entry.value);
                }
                Flag::ZRemRangeByRank if entry.key == key => {
                    if let Ok((start, end)) = payload::decode_rank_range(&entry.value) {
                        staged.rem_range_by_rank(key, start, end);
                    }
                }
                Flag::ZAdd => exists = true,
                _ => {}
            }
        }
        (exists, staged)
    }

    /// The list at `(bucket, key)` with pending mutations replayed onto
    /// a copy of the committed items.
    fn staged_list(&self, bucket: &[u8], key: &[u8]) -> (bool, VecDeque<Vec<u8>>) {
        let committed = self.indexes.list_bucket(bucket);
        let mut exists = committed.is_some();
        let mut items: VecDeque<Vec<u8>> = committed
            .map(|list| list.range(key, 0, -1).into())
            .unwrap_or_default();

        for entry in &self.pending {
            if entry.meta.kind != Kind::List || entry.bucket != bucket {
                continue;
            }
            match entry.meta.flag {
                Flag::DeleteBucket => {
                    exists = false;
                    items.clear();
                }
                Flag::LPush if entry.key == key => {
                    exists = true;
                    items.push_front(entry.value.clone());
                }
                Flag::RPush if entry.key == key => {
                    exists = true;
                    items.push_back(entry.value.clone());
                }
                Flag::LPop if entry.key == key => {
                    items.pop_front();
                }
                Flag::RPop if entry.key == key => {
                    items.pop_back();
                }
                Flag::ListRemove if entry.key == key => {
                    if let Ok((count, item)) = payload::decode_list_rem(&entry.value) {
                        remove_occurrences(&mut items, count, item);
                    }
                }
                Flag::LPush | Flag::RPush => exists = true,
                _ => {}
            }
        }
        (exists, items)
    }
}

impl std::fmt::Debug for Tx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("writable", &self.writable)
            .field("snapshot_tx_id", &self.snapshot_tx_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// A forward cursor over one bucket's keys.
///
/// `set_next` advances the cursor and resolves the entry's value
/// (reading the segment file in pointer-only index modes); `entry`
/// returns the current key and value.
pub struct BucketIter<'tx, 'db> {
    tx: &'tx Tx<'db>,
    tree: Option<&'tx BpTree>,
    inner: Option<BpTreeIter<'tx>>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl<'tx, 'db> BucketIter<'tx, 'db> {
    /// Repositions the cursor at the smallest key ≥ `key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.current = None;
        self.inner = self.tree.map(|tree| tree.seek(key));
    }

    /// Advances to the next live entry. Returns `Ok(false)` once the
    /// bucket is exhausted.
    pub fn set_next(&mut self) -> CoreResult<bool> {
        let now = unix_now();
        let Some(tree) = self.tree else {
            self.current = None;
            return Ok(false);
        };
        let inner = self.inner.get_or_insert_with(|| tree.iter());

        for (key, rec) in inner.by_ref() {
            if rec.is_tombstone() || rec.is_expired_at(now) {
                continue;
            }
            let value = self.tx.read_index_value(rec)?;
            self.current = Some((key.to_vec(), value));
            return Ok(true);
        }
        self.current = None;
        Ok(false)
    }

    /// The current entry as `(key, value)`, if positioned on one.
    #[must_use]
    pub fn entry(&self) -> Option<(&[u8], &[u8])> {
        self.current
            .as_ref()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}
