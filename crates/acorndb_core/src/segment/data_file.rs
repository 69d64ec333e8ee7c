//! Positional record I/O over one segment file.

use crate::error::CoreResult;
use acorndb_codec::{decode_entry, CodecError, Decoded, RecordHeader, HEADER_SIZE};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Reads exactly `buf.len()` bytes at `offset` without moving a cursor,
/// so concurrent readers can share one descriptor.
#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    let mut buf = buf;
    let mut offset = offset;
    while !buf.is_empty() {
        match std::os::windows::fs::FileExt::seek_read(file, buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Writes all of `buf` at `offset`.
#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut buf = buf;
    let mut offset = offset;
    while !buf.is_empty() {
        let n = std::os::windows::fs::FileExt::seek_write(file, buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// A handle onto one segment file.
///
/// Cheap to clone; clones share the underlying descriptor. All access is
/// positional, so a single descriptor serves concurrent readers.
#[derive(Clone)]
pub(crate) struct DataFile {
    file: Arc<File>,
}

impl DataFile {
    /// Opens a segment for reading and appending, creating it if needed.
    pub fn open_rw(path: &Path) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Opens a sealed segment read-only.
    pub fn open_ro(path: &Path) -> CoreResult<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Wraps an already-open descriptor.
    pub fn from_shared(file: Arc<File>) -> Self {
        Self { file }
    }

    /// Returns the shared descriptor.
    pub fn shared(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }

    /// Returns the file size in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Decodes one record starting at `offset`.
    ///
    /// # Errors
    ///
    /// Propagates [`CodecError::TruncatedRecord`] when the file ends
    /// before the record does (the caller decides whether that is a
    /// clean end or corruption), and the codec's checksum/tag errors for
    /// undecodable bytes.
    pub fn read_record(&self, offset: u64) -> CoreResult<Decoded> {
        let len = self.size()?;
        let available = len.saturating_sub(offset) as usize;
        if available < HEADER_SIZE {
            return Err(CodecError::truncated(HEADER_SIZE, available).into());
        }

        let mut header_buf = [0u8; HEADER_SIZE];
        read_exact_at(&self.file, &mut header_buf, offset)?;
        let header = RecordHeader::decode(&header_buf)?;

        // Size the payload read before allocating; a corrupt length field
        // must not trigger a huge allocation.
        let record_size = header.record_size();
        if available < record_size {
            return Err(CodecError::truncated(record_size, available).into());
        }

        let mut record_buf = vec![0u8; record_size];
        record_buf[..HEADER_SIZE].copy_from_slice(&header_buf);
        read_exact_at(
            &self.file,
            &mut record_buf[HEADER_SIZE..],
            offset + HEADER_SIZE as u64,
        )?;

        Ok(decode_entry(&record_buf)?)
    }

    /// Writes `buf` at `offset`.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> CoreResult<()> {
        write_all_at(&self.file, buf, offset)?;
        Ok(())
    }

    /// Truncates the file to `len` bytes.
    pub fn truncate(&self, len: u64) -> CoreResult<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Flushes file contents to durable storage.
    pub fn sync(&self) -> CoreResult<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acorndb_codec::{Entry, Flag, Kind, Meta, PERSISTENT};
    use tempfile::tempdir;

    fn sample(key: &[u8], value: &[u8]) -> Entry {
        let mut meta = Meta::new(Flag::Put, Kind::Kv, PERSISTENT);
        meta.timestamp = 1;
        meta.tx_id = 1;
        Entry::new(b"b".to_vec(), key.to_vec(), value.to_vec(), meta)
    }

    #[test]
    fn write_and_read_records() {
        let temp = tempdir().unwrap();
        let file = DataFile::open_rw(&temp.path().join("0.dat")).unwrap();

        let first = sample(b"k1", b"v1");
        let second = sample(b"k2", b"second value");
        let first_bytes = first.encode().unwrap();
        let second_bytes = second.encode().unwrap();

        file.write_at(&first_bytes, 0).unwrap();
        file.write_at(&second_bytes, first_bytes.len() as u64)
            .unwrap();

        let decoded = file.read_record(0).unwrap();
        assert_eq!(decoded.entry, first);
        assert_eq!(decoded.size, first_bytes.len());

        let decoded = file.read_record(first_bytes.len() as u64).unwrap();
        assert_eq!(decoded.entry, second);
    }

    #[test]
    fn read_past_end_is_truncation() {
        let temp = tempdir().unwrap();
        let file = DataFile::open_rw(&temp.path().join("0.dat")).unwrap();
        let bytes = sample(b"k", b"v").encode().unwrap();
        file.write_at(&bytes, 0).unwrap();

        let err = file.read_record(bytes.len() as u64).unwrap_err();
        match err {
            crate::error::CoreError::Codec(e) => assert!(e.is_truncation()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn partial_record_is_truncation() {
        let temp = tempdir().unwrap();
        let file = DataFile::open_rw(&temp.path().join("0.dat")).unwrap();
        let bytes = sample(b"k", b"a longer value").encode().unwrap();
        file.write_at(&bytes[..bytes.len() - 3], 0).unwrap();

        let err = file.read_record(0).unwrap_err();
        match err {
            crate::error::CoreError::Codec(e) => assert!(e.is_truncation()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
