//! Data directory management.
//!
//! The on-disk layout of a store directory:
//!
//! ```text
//! <dir>/
//! ├─ LOCK             # advisory lock for single-instance access
//! ├─ 000000000.dat    # segment files, named by file_id
//! ├─ 000000001.dat
//! └─ …
//! ```
//!
//! The LOCK file ensures at most one store instance owns a directory at
//! a time. Segment files hold dense sequences of encoded entries; only
//! the highest-numbered segment accepts appends.

use crate::error::{CoreError, CoreResult};
use crate::types::FileId;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const SEGMENT_SUFFIX: &str = ".dat";

/// Returns the file name for a segment ID, e.g. `000000004.dat`.
pub(crate) fn segment_file_name(file_id: FileId) -> String {
    format!("{:09}{SEGMENT_SUFFIX}", file_id.as_u64())
}

/// Owns the data directory and its exclusive lock.
///
/// Only one `StoreDir` instance can exist per directory at a time; a
/// second open fails with [`CoreError::DirLocked`]. The lock is released
/// on [`StoreDir::unlock`] or when the instance is dropped.
pub(crate) struct StoreDir {
    /// Root directory path.
    path: PathBuf,
    /// Lock file handle; `None` once manually unlocked.
    lock_file: Mutex<Option<File>>,
}

impl StoreDir {
    /// Opens or creates a data directory and acquires its lock.
    ///
    /// # Errors
    ///
    /// - [`CoreError::DirLocked`] if another instance holds the lock.
    /// - [`CoreError::InvalidArgument`] if the path exists but is not a
    ///   directory.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_argument(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_path = path.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DirLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            lock_file: Mutex::new(Some(lock_file)),
        })
    }

    /// Returns the directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the segment file for `file_id`.
    pub fn segment_path(&self, file_id: FileId) -> PathBuf {
        self.path.join(segment_file_name(file_id))
    }

    /// Lists existing segment file IDs in ascending order.
    pub fn list_segment_ids(&self) -> CoreResult<Vec<FileId>> {
        let mut ids = Vec::new();
        for dirent in fs::read_dir(&self.path)? {
            let name = dirent?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(SEGMENT_SUFFIX) {
                if let Ok(id) = stem.parse::<u64>() {
                    ids.push(FileId::new(id));
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Releases the directory lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DirUnlocked`] if the lock was already
    /// released.
    pub fn unlock(&self) -> CoreResult<()> {
        let mut guard = self.lock_file.lock();
        match guard.take() {
            Some(file) => {
                FileExt::unlock(&file)?;
                Ok(())
            }
            None => Err(CoreError::DirUnlocked),
        }
    }

    /// Returns true while this instance still holds the lock.
    pub fn is_locked(&self) -> bool {
        self.lock_file.lock().is_some()
    }

    /// Fsyncs the directory so file creations are durable.
    ///
    /// On non-Unix platforms directory fsync is unsupported; the
    /// journaling metadata guarantees of those filesystems stand in.
    #[cfg(unix)]
    pub fn sync_directory(&self) -> CoreResult<()> {
        let dir = File::open(&self.path)?;
        dir.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for StoreDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreDir")
            .field("path", &self.path)
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("new_store");
        assert!(!path.exists());

        let dir = StoreDir::open(&path).unwrap();
        assert!(path.is_dir());
        assert!(dir.is_locked());
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("locked");

        let _dir1 = StoreDir::open(&path).unwrap();
        let result = StoreDir::open(&path);
        assert!(matches!(result, Err(CoreError::DirLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("reopen");

        {
            let _dir = StoreDir::open(&path).unwrap();
        }
        let _dir2 = StoreDir::open(&path).unwrap();
    }

    #[test]
    fn double_unlock_fails() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(temp.path()).unwrap();

        dir.unlock().unwrap();
        assert!(!dir.is_locked());
        assert!(matches!(dir.unlock(), Err(CoreError::DirUnlocked)));
    }

    #[test]
    fn segment_names_are_zero_padded() {
        assert_eq!(segment_file_name(FileId::new(0)), "000000000.dat");
        assert_eq!(segment_file_name(FileId::new(42)), "000000042.dat");
    }

    #[test]
    fn lists_segment_ids_in_order() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(temp.path()).unwrap();

        for id in [2u64, 0, 1] {
            std::fs::write(dir.segment_path(FileId::new(id)), b"").unwrap();
        }
        // Non-segment files are ignored.
        std::fs::write(temp.path().join("notes.txt"), b"").unwrap();

        let ids = dir.list_segment_ids().unwrap();
        assert_eq!(
            ids,
            vec![FileId::new(0), FileId::new(1), FileId::new(2)]
        );
    }
}
