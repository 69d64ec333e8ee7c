//! Active-segment management and record access across all segments.

use crate::dir::segment_file_name;
use crate::error::{CoreError, CoreResult};
use crate::index::RecordPtr;
use crate::segment::data_file::DataFile;
use crate::segment::fd_cache::FdCache;
use crate::types::FileId;
use acorndb_codec::{Decoded, Entry};
use parking_lot::Mutex;
use std::path::PathBuf;
use tracing::debug;

struct ActiveSegment {
    id: FileId,
    file: DataFile,
    offset: u64,
}

/// Owns every open descriptor for segment files.
///
/// Appends go to the single active segment; reads resolve any segment
/// (the active one included) through the descriptor cache. Rollover
/// follows the atomic-per-transaction policy: [`FileManager::ensure_capacity`]
/// seals the active segment *before* a batch that would cross
/// `segment_size`, so no transaction ever spans two segments.
pub(crate) struct FileManager {
    dir_path: PathBuf,
    segment_size: u64,
    active: Mutex<ActiveSegment>,
    cache: Mutex<FdCache>,
}

impl FileManager {
    /// Opens the manager positioned at the recovered active segment.
    ///
    /// If the active file is longer than `active_offset` (recovery
    /// rewound past a corrupt tail), it is truncated so the segment
    /// stays a dense sequence of valid records.
    pub fn open(
        dir_path: PathBuf,
        segment_size: u64,
        max_fds: usize,
        clean_threshold: f64,
        active_id: FileId,
        active_offset: u64,
    ) -> CoreResult<Self> {
        let file = DataFile::open_rw(&dir_path.join(segment_file_name(active_id)))?;
        if file.size()? > active_offset {
            file.truncate(active_offset)?;
            file.sync()?;
        }

        Ok(Self {
            dir_path,
            segment_size,
            active: Mutex::new(ActiveSegment {
                id: active_id,
                file,
                offset: active_offset,
            }),
            cache: Mutex::new(FdCache::new(max_fds, clean_threshold)),
        })
    }

    /// Rolls the active segment if appending `total` more bytes would
    /// cross the segment size. A batch larger than a whole segment lands
    /// alone in a fresh (oversized) segment.
    pub fn ensure_capacity(&self, total: u64) -> CoreResult<()> {
        let mut active = self.active.lock();
        if active.offset > 0 && active.offset + total > self.segment_size {
            self.roll(&mut active)?;
        }
        Ok(())
    }

    /// Appends `bytes` to the active segment, returning the segment ID
    /// and start offset. Callers run [`Self::ensure_capacity`] first;
    /// `append` itself never rolls, so one transaction's records stay in
    /// one segment.
    pub fn append(&self, bytes: &[u8]) -> CoreResult<(FileId, u64)> {
        let mut active = self.active.lock();
        let start = active.offset;
        active.file.write_at(bytes, start)?;
        active.offset += bytes.len() as u64;
        Ok((active.id, start))
    }

    /// Current active segment ID and write offset.
    pub fn active_position(&self) -> (FileId, u64) {
        let active = self.active.lock();
        (active.id, active.offset)
    }

    /// Flushes the active segment to durable storage.
    pub fn sync(&self) -> CoreResult<()> {
        self.active.lock().file.sync()
    }

    /// Rewinds the active segment to `offset`, discarding an aborted
    /// batch.
    pub fn truncate_active(&self, offset: u64) -> CoreResult<()> {
        let mut active = self.active.lock();
        active.file.truncate(offset)?;
        active.offset = offset;
        Ok(())
    }

    /// Reads and validates the record a live index pointer refers to.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] if the bytes no longer
    /// decode or their checksum differs from the pointer's digest.
    pub fn read_record(&self, ptr: &RecordPtr) -> CoreResult<Entry> {
        let decoded = self
            .read_decoded(ptr.file_id, ptr.data_pos)
            .map_err(|err| match err {
                CoreError::Codec(_) => CoreError::CorruptRecord {
                    file_id: ptr.file_id.as_u64(),
                    offset: ptr.data_pos,
                },
                other => other,
            })?;

        if decoded.crc != ptr.header_digest || decoded.size as u32 != ptr.size {
            return Err(CoreError::CorruptRecord {
                file_id: ptr.file_id.as_u64(),
                offset: ptr.data_pos,
            });
        }
        Ok(decoded.entry)
    }

    /// Decodes one record at an arbitrary segment offset, without
    /// digest validation. Used by segment scans.
    pub fn read_decoded(&self, file_id: FileId, offset: u64) -> CoreResult<Decoded> {
        self.data_file(file_id)?.read_record(offset)
    }

    /// Resolves a segment to a readable handle through the cache.
    pub fn data_file(&self, file_id: FileId) -> CoreResult<DataFile> {
        {
            let active = self.active.lock();
            if active.id == file_id {
                return Ok(active.file.clone());
            }
        }

        let path = self.dir_path.join(segment_file_name(file_id));
        let file = self
            .cache
            .lock()
            .get(file_id.as_u64(), || Ok(DataFile::open_ro(&path)?.shared()))?;
        Ok(DataFile::from_shared(file))
    }

    /// Seals the active segment and opens its successor.
    fn roll(&self, active: &mut ActiveSegment) -> CoreResult<()> {
        active.file.sync()?;
        self.cache
            .lock()
            .insert(active.id.as_u64(), active.file.shared());

        let next = active.id.next();
        let file = DataFile::open_rw(&self.dir_path.join(segment_file_name(next)))?;
        debug!(
            sealed = active.id.as_u64(),
            opened = next.as_u64(),
            size = active.offset,
            "segment rollover"
        );

        active.id = next;
        active.file = file;
        active.offset = 0;
        Ok(())
    }
}
