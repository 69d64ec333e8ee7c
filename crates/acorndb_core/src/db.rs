//! The database facade: open, transactions, commit, close.

use crate::config::Config;
use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::index::{Indexes, RecordPtr};
use crate::recovery;
use crate::segment::FileManager;
use crate::tx::Tx;
use crate::types::{unix_now, TxId};
use acorndb_codec::{Entry, Flag, Kind};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

/// An embedded, persistent key-value store with typed data structures
/// over an append-only segmented log.
///
/// All access goes through closure-scoped transactions:
///
/// ```ignore
/// let db = Database::open("my_store", Config::default())?;
/// db.update(|tx| tx.put("bucket", b"key", b"value", PERSISTENT))?;
/// db.view(|tx| {
///     let value = tx.get("bucket", b"key")?;
///     Ok(())
/// })?;
/// db.close()?;
/// ```
///
/// # Concurrency
///
/// Any number of views run in parallel; updates serialize on a single
/// writer seat. A committing writer blocks readers only while applying
/// the transaction to the in-memory indexes; during the log append and
/// fsync, readers proceed against the pre-commit state.
pub struct Database {
    config: Config,
    dir: StoreDir,
    files: FileManager,
    indexes: RwLock<Indexes>,
    /// The writer seat: at most one update transaction at a time.
    writer: Mutex<()>,
    /// Reusable commit buffer; transactions larger than its configured
    /// capacity stream directly to the segment.
    commit_buf: Mutex<Vec<u8>>,
    last_tx_id: AtomicU64,
    closed: AtomicBool,
}

impl Database {
    /// Opens (or creates) the store at `path`.
    ///
    /// Acquires the directory lock, replays all segments into fresh
    /// in-memory indexes, and positions the active segment for appends.
    ///
    /// # Errors
    ///
    /// - [`CoreError::DirLocked`] if another instance owns the directory.
    /// - [`CoreError::CorruptLog`] if a sealed segment fails to decode.
    /// - [`CoreError::InvalidArgument`] for an invalid configuration.
    pub fn open(path: impl AsRef<Path>, config: Config) -> CoreResult<Self> {
        config.validate()?;
        let dir = StoreDir::open(path.as_ref())?;
        let recovered = recovery::replay(&dir, &config)?;
        let files = FileManager::open(
            dir.path().to_path_buf(),
            config.segment_size,
            config.max_fds_in_cache,
            config.clean_fds_cache_threshold,
            recovered.active_file_id,
            recovered.active_offset,
        )?;
        dir.sync_directory()?;

        info!(
            path = %dir.path().display(),
            last_tx_id = recovered.last_tx_id,
            "opened store"
        );

        let commit_buf = Vec::with_capacity(config.commit_buffer_size);
        Ok(Self {
            config,
            dir,
            files,
            indexes: RwLock::new(recovered.indexes),
            writer: Mutex::new(()),
            commit_buf: Mutex::new(commit_buf),
            last_tx_id: AtomicU64::new(recovered.last_tx_id),
            closed: AtomicBool::new(false),
        })
    }

    /// Runs a read-only transaction.
    ///
    /// The closure's error aborts nothing (views have no effects) but is
    /// reported to the configured error handler and returned.
    pub fn view<F>(&self, f: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Tx<'_>) -> CoreResult<()>,
    {
        self.ensure_open()?;
        let snapshot = TxId::new(self.last_tx_id.load(Ordering::SeqCst));
        let mut tx = Tx::new(self, false, self.indexes.read(), snapshot);
        let result = f(&mut tx);
        drop(tx);

        if let Err(err) = &result {
            self.report(err);
        }
        result
    }

    /// Runs a read-write transaction.
    ///
    /// On `Ok`, the buffered mutations commit: they are appended to the
    /// active segment, fsynced, and applied to the in-memory indexes; on
    /// `Err`, they are discarded, the error handler is invoked, and the
    /// error is returned.
    pub fn update<F>(&self, f: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Tx<'_>) -> CoreResult<()>,
    {
        self.ensure_open()?;
        let seat = self.writer.lock();
        let snapshot = TxId::new(self.last_tx_id.load(Ordering::SeqCst));
        let mut tx = Tx::new(self, true, self.indexes.read(), snapshot);

        let result = match f(&mut tx) {
            Ok(()) => {
                let pending = tx.into_pending();
                self.commit(pending)
            }
            Err(err) => {
                drop(tx);
                self.report(&err);
                Err(err)
            }
        };
        drop(seat);
        result
    }

    /// Closes the store: syncs the active segment and releases the
    /// directory lock.
    ///
    /// # Errors
    ///
    /// [`CoreError::DatabaseClosed`] if already closed,
    /// [`CoreError::DirUnlocked`] if the lock was manually released
    /// beforehand.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(CoreError::DatabaseClosed);
        }
        self.files.sync()?;
        self.dir.unlock()
    }

    /// Returns true once the store has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Releases the directory lock without closing the store.
    ///
    /// A subsequent [`Database::close`] then fails with
    /// [`CoreError::DirUnlocked`].
    pub fn unlock(&self) -> CoreResult<()> {
        self.dir.unlock()
    }

    /// The ID of the most recently committed transaction.
    #[must_use]
    pub fn last_tx_id(&self) -> TxId {
        TxId::new(self.last_tx_id.load(Ordering::SeqCst))
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::DatabaseClosed);
        }
        Ok(())
    }

    fn report(&self, err: &CoreError) {
        if let Some(handler) = &self.config.error_handler {
            handler(err);
        }
    }

    /// Commit steps, in order: stamp ids, roll the segment if the batch
    /// would cross it, append, fsync, apply to indexes, publish.
    fn commit(&self, mut pending: Vec<Entry>) -> CoreResult<()> {
        if pending.is_empty() {
            return Ok(());
        }

        let tx_id = self.last_tx_id.load(Ordering::SeqCst) + 1;
        let now = unix_now();
        let last = pending.len() - 1;
        for (i, entry) in pending.iter_mut().enumerate() {
            entry.meta.tx_id = tx_id;
            entry.meta.timestamp = now;
            entry.meta.tx_final = i == last;
        }

        let total: u64 = pending.iter().map(|e| e.encoded_size() as u64).sum();
        self.files.ensure_capacity(total)?;
        let (_, pre_offset) = self.files.active_position();

        let ptrs = match self.append_batch(&pending, total) {
            Ok(ptrs) => ptrs,
            Err(err) => {
                // Nothing of this transaction may survive: rewind the
                // segment to the pre-batch offset.
                let _ = self.files.truncate_active(pre_offset);
                return Err(err);
            }
        };

        if let Err(err) = self.files.sync() {
            self.report(&err);
            return Err(err);
        }

        {
            let mut indexes = self.indexes.write();
            for (entry, ptr) in pending.iter().zip(ptrs) {
                if let Err(err) = indexes.apply(entry, ptr, now) {
                    self.report(&err);
                    return Err(err);
                }
            }
        }
        self.last_tx_id.store(tx_id, Ordering::SeqCst);
        Ok(())
    }

    /// Appends all records of one transaction, through the commit buffer
    /// when they fit and streaming record-by-record when they do not.
    fn append_batch(&self, pending: &[Entry], total: u64) -> CoreResult<Vec<RecordPtr>> {
        if total as usize <= self.config.commit_buffer_size {
            let mut buf = self.commit_buf.lock();
            let result = self.append_buffered(pending, &mut buf);
            buf.clear();
            result
        } else {
            self.append_streaming(pending)
        }
    }

    fn append_buffered(&self, pending: &[Entry], buf: &mut Vec<u8>) -> CoreResult<Vec<RecordPtr>> {
        let mut sizes = Vec::with_capacity(pending.len());
        for entry in pending {
            let bytes = entry.encode()?;
            sizes.push(bytes.len());
            buf.extend_from_slice(&bytes);
        }

        let (file_id, start) = self.files.append(buf)?;
        let mut ptrs = Vec::with_capacity(pending.len());
        let mut offset = start;
        let mut cursor = 0usize;
        for size in sizes {
            let crc = u32::from_le_bytes([
                buf[cursor],
                buf[cursor + 1],
                buf[cursor + 2],
                buf[cursor + 3],
            ]);
            ptrs.push(RecordPtr {
                file_id,
                data_pos: offset,
                size: size as u32,
                header_digest: crc,
            });
            offset += size as u64;
            cursor += size;
        }
        Ok(ptrs)
    }

    fn append_streaming(&self, pending: &[Entry]) -> CoreResult<Vec<RecordPtr>> {
        let mut ptrs = Vec::with_capacity(pending.len());
        for entry in pending {
            let bytes = entry.encode()?;
            let crc = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let (file_id, data_pos) = self.files.append(&bytes)?;
            ptrs.push(RecordPtr {
                file_id,
                data_pos,
                size: bytes.len() as u32,
                header_digest: crc,
            });
        }
        Ok(ptrs)
    }

    // === Internal access for transaction handles ===

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn read_entry(&self, ptr: &RecordPtr) -> CoreResult<Entry> {
        self.files.read_record(ptr)
    }

    /// Sparse-index fallback: finds the newest committed KV record for
    /// `(bucket, key)` by scanning segments from the highest file ID
    /// downward. Within a file the last match wins; the first file
    /// containing the key ends the scan. A record older than the
    /// bucket's most recent `DeleteBucket` is dead and filtered out.
    pub(crate) fn scan_latest(
        &self,
        bucket: &[u8],
        key: &[u8],
        max_tx_id: u64,
    ) -> CoreResult<Option<(Entry, RecordPtr)>> {
        let ids = self.dir.list_segment_ids()?;
        let (active_id, active_len) = self.files.active_position();

        let mut best: Option<(Entry, RecordPtr)> = None;
        let mut bucket_del_tx = 0u64;

        for &file_id in ids.iter().rev() {
            if file_id > active_id {
                continue;
            }
            let file = self.files.data_file(file_id)?;
            let limit = if file_id == active_id {
                active_len
            } else {
                file.size()?
            };

            let mut offset = 0u64;
            while offset < limit {
                let decoded = match file.read_record(offset) {
                    Ok(decoded) => decoded,
                    // The active tail may hold an in-flight append.
                    Err(CoreError::Codec(_)) if file_id == active_id => break,
                    Err(err) => return Err(err),
                };
                let size = decoded.size as u64;
                let entry = decoded.entry;

                if entry.meta.kind == Kind::Kv
                    && entry.meta.tx_id <= max_tx_id
                    && entry.bucket == bucket
                {
                    if entry.meta.flag == Flag::DeleteBucket {
                        bucket_del_tx = bucket_del_tx.max(entry.meta.tx_id);
                    } else if entry.key == key {
                        let ptr = RecordPtr {
                            file_id,
                            data_pos: offset,
                            size: decoded.size as u32,
                            header_digest: decoded.crc,
                        };
                        best = Some((entry, ptr));
                    }
                }
                offset += size;
            }

            if best.is_some() {
                break;
            }
        }

        Ok(best.filter(|(entry, _)| entry.meta.tx_id > bucket_del_tx))
    }

    #[cfg(test)]
    pub(crate) fn commit_buffer_stats(&self) -> (usize, usize) {
        let buf = self.commit_buf.lock();
        (buf.len(), buf.capacity())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.files.sync();
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.dir.path())
            .field("last_tx_id", &self.last_tx_id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path, config: Config) -> Database {
        Database::open(dir.join("store"), config).unwrap()
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let temp = tempdir().unwrap();
        let db = open(temp.path(), Config::default());

        db.update(|tx| tx.put("bucket", b"k0", b"v0", 0)).unwrap();
        db.view(|tx| {
            assert_eq!(tx.get("bucket", b"k0").unwrap(), b"v0");
            Ok(())
        })
        .unwrap();

        db.update(|tx| tx.put("bucket", b"k0", b"v1", 0)).unwrap();
        db.view(|tx| {
            assert_eq!(tx.get("bucket", b"k0").unwrap(), b"v1");
            Ok(())
        })
        .unwrap();

        db.update(|tx| tx.delete("bucket", b"k0")).unwrap();
        db.view(|tx| {
            assert!(matches!(
                tx.get("bucket", b"k0"),
                Err(CoreError::KeyNotFound)
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn empty_update_commits_nothing() {
        let temp = tempdir().unwrap();
        let db = open(temp.path(), Config::default());

        db.update(|_| Ok(())).unwrap();
        assert_eq!(db.last_tx_id().as_u64(), 0);
    }

    #[test]
    fn mutation_in_view_is_read_only_error() {
        let temp = tempdir().unwrap();
        let db = open(temp.path(), Config::default());

        let result = db.view(|tx| tx.put("b", b"k", b"v", 0));
        assert!(matches!(result, Err(CoreError::TxReadOnly)));
    }

    #[test]
    fn closure_error_aborts_and_invokes_handler_once() {
        let temp = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let config = Config::default().error_handler(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let db = open(temp.path(), config);

        let result = db.update(|tx| {
            tx.put("bucket", b"k", b"v", 0)?;
            Err(CoreError::invalid_argument("caller bailed"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // No mutations observable after the abort.
        db.view(|tx| {
            assert!(matches!(
                tx.get("bucket", b"k"),
                Err(CoreError::BucketNotFound { .. })
            ));
            Ok(())
        })
        .unwrap();
        assert_eq!(db.last_tx_id().as_u64(), 0);
    }

    #[test]
    fn small_transactions_reuse_commit_buffer() {
        let temp = tempdir().unwrap();
        let db = open(temp.path(), Config::default().commit_buffer_size(1024));

        db.update(|tx| tx.put("b", b"k", b"v", 0)).unwrap();
        let (len, capacity) = db.commit_buffer_stats();
        assert_eq!(len, 0);
        assert_eq!(capacity, 1024);
    }

    #[test]
    fn oversized_transaction_bypasses_commit_buffer() {
        let temp = tempdir().unwrap();
        let db = open(temp.path(), Config::default().commit_buffer_size(1024));

        db.update(|tx| {
            for i in 0..1000u32 {
                tx.put("big", &i.to_le_bytes(), &vec![0xAB; 1024], 0)?;
            }
            Ok(())
        })
        .unwrap();

        let (len, capacity) = db.commit_buffer_stats();
        assert_eq!(len, 0);
        assert_eq!(capacity, 1024);

        db.view(|tx| {
            assert_eq!(tx.get("big", &999u32.to_le_bytes()).unwrap(), vec![0xAB; 1024]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn operations_after_close_fail() {
        let temp = tempdir().unwrap();
        let db = open(temp.path(), Config::default());

        db.close().unwrap();
        assert!(db.is_closed());
        assert!(matches!(db.view(|_| Ok(())), Err(CoreError::DatabaseClosed)));
        assert!(matches!(
            db.update(|_| Ok(())),
            Err(CoreError::DatabaseClosed)
        ));
        assert!(matches!(db.close(), Err(CoreError::DatabaseClosed)));
    }

    #[test]
    fn manual_unlock_makes_close_fail() {
        let temp = tempdir().unwrap();
        let db = open(temp.path(), Config::default());

        db.unlock().unwrap();
        assert!(matches!(db.close(), Err(CoreError::DirUnlocked)));
    }
}
