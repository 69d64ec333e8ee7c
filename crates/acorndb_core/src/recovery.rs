//! Startup scan: replay all segments into fresh in-memory indexes.
//!
//! Segments are read in ascending `file_id` order and records are
//! grouped by `tx_id`; a group is applied only once its terminal-flagged
//! record arrives, so a transaction is all-or-nothing across restarts.
//!
//! Corruption policy: an undecodable record in the *last* segment
//! truncates recovery at that offset and the segment stays active with
//! its write position rewound there. An undecodable record in any
//! earlier (sealed) segment is fatal.

use crate::config::Config;
use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::index::{Indexes, RecordPtr};
use crate::segment::DataFile;
use crate::types::{unix_now, FileId};
use acorndb_codec::Entry;
use tracing::{debug, warn};

/// Everything `open` needs after the log has been replayed.
#[derive(Debug)]
pub(crate) struct RecoveredState {
    /// Rebuilt in-memory indexes.
    pub indexes: Indexes,
    /// Segment that stays active.
    pub active_file_id: FileId,
    /// Write offset within the active segment.
    pub active_offset: u64,
    /// Highest fully-applied transaction ID.
    pub last_tx_id: u64,
}

/// Replays every segment in the directory.
pub(crate) fn replay(dir: &StoreDir, config: &Config) -> CoreResult<RecoveredState> {
    let now = unix_now();
    let mut indexes = Indexes::new(config.entry_idx_mode);
    let ids = dir.list_segment_ids()?;

    let mut active_file_id = FileId::new(0);
    let mut active_offset = 0u64;
    let mut last_tx_id = 0u64;

    if ids.is_empty() {
        return Ok(RecoveredState {
            indexes,
            active_file_id,
            active_offset,
            last_tx_id,
        });
    }

    let mut group: Vec<(Entry, RecordPtr)> = Vec::new();
    let mut group_tx = 0u64;
    let mut group_start: Option<(FileId, u64)> = None;

    let last_file = ids[ids.len() - 1];
    'files: for &file_id in &ids {
        let file = DataFile::open_ro(&dir.segment_path(file_id))?;
        let len = file.size()?;
        let is_last = file_id == last_file;
        if is_last {
            active_file_id = file_id;
            active_offset = len;
        }

        let mut offset = 0u64;
        while offset < len {
            let decoded = match file.read_record(offset) {
                Ok(decoded) => decoded,
                Err(CoreError::Codec(codec_err)) => {
                    if !is_last {
                        return Err(CoreError::corrupt_log(
                            file_id.as_u64(),
                            offset,
                            codec_err.to_string(),
                        ));
                    }
                    warn!(
                        file_id = file_id.as_u64(),
                        offset,
                        error = %codec_err,
                        "truncating recovery at corrupt tail"
                    );
                    group.clear();
                    group_start = None;
                    active_offset = offset;
                    break 'files;
                }
                Err(other) => return Err(other),
            };

            let ptr = RecordPtr {
                file_id,
                data_pos: offset,
                size: decoded.size as u32,
                header_digest: decoded.crc,
            };
            let entry = decoded.entry;

            if !group.is_empty() && entry.meta.tx_id != group_tx {
                warn!(tx_id = group_tx, "discarding incomplete transaction group");
                group.clear();
                group_start = None;
            }
            if group.is_empty() {
                group_start = Some((file_id, offset));
            }
            group_tx = entry.meta.tx_id;
            let is_terminal = entry.meta.tx_final;
            group.push((entry, ptr));

            if is_terminal {
                for (entry, ptr) in group.drain(..) {
                    indexes.apply(&entry, ptr, now)?;
                }
                group_start = None;
                last_tx_id = group_tx;
            }

            offset += decoded.size as u64;
        }
    }

    // A trailing group without its terminal record is a crash artifact:
    // drop it and let the next append overwrite it.
    if !group.is_empty() {
        warn!(
            tx_id = group_tx,
            records = group.len(),
            "discarding trailing incomplete transaction group"
        );
        if let Some((file_id, offset)) = group_start {
            if file_id == active_file_id {
                active_offset = offset;
            }
        }
    }

    debug!(
        segments = ids.len(),
        last_tx_id,
        active = active_file_id.as_u64(),
        "log replay complete"
    );

    Ok(RecoveredState {
        indexes,
        active_file_id,
        active_offset,
        last_tx_id,
    })
}
