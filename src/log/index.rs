use byteorder::{BigEndian, ByteOrder};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

const OFFSET_WIDTH: u64 = 4;
const POSITION_WIDTH: u64 = 8;

/// Width in bytes of one index entry: a u32 relative offset followed by a
/// u64 store position, both big-endian.
pub const ENTRY_WIDTH: u64 = OFFSET_WIDTH + POSITION_WIDTH;

#[derive(Error, Debug)]
pub enum IndexError {
    /// The mapped region has no room for another entry.
    #[error("index is full")]
    Full,

    #[error("no index entry at relative offset {0}")]
    OutOfRange(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub relative_offset: u32,
    pub position: u64,
}

/// Memory-mapped table mapping a segment's n-th record to its store position.
///
/// The file is grown to its configured maximum before mapping, since the map
/// cannot be resized afterwards; the logical end is tracked separately in
/// `size`. On close the file is truncated back to `size` so a reopen can
/// recover the entry count from the file length alone.
pub struct Index {
    file: File,
    mmap: MmapMut,
    size: u64,
    path: PathBuf,
    closed: bool,
}

impl Index {
    pub fn open(path: impl AsRef<Path>, max_index_bytes: u64) -> Result<Index, IndexError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let size = file.metadata()?.len();
        file.set_len(max_index_bytes)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Index {
            file,
            mmap,
            size,
            path,
            closed: false,
        })
    }

    /// Number of entries in the index.
    pub fn len(&self) -> u64 {
        self.size / ENTRY_WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Logical size in bytes, not the pre-allocated file length.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when another entry would not fit in the mapped region.
    pub fn is_full(&self) -> bool {
        self.size + ENTRY_WIDTH > self.mmap.len() as u64
    }

    pub fn read(&self, relative_offset: u64) -> Result<Entry, IndexError> {
        if self.size == 0 || relative_offset * ENTRY_WIDTH >= self.size {
            return Err(IndexError::OutOfRange(relative_offset));
        }

        let start = (relative_offset * ENTRY_WIDTH) as usize;
        let offset_end = start + OFFSET_WIDTH as usize;
        let position_end = offset_end + POSITION_WIDTH as usize;

        Ok(Entry {
            relative_offset: BigEndian::read_u32(&self.mmap[start..offset_end]),
            position: BigEndian::read_u64(&self.mmap[offset_end..position_end]),
        })
    }

    /// Reads the most recently written entry, if any.
    pub fn read_last(&self) -> Option<Entry> {
        if self.size == 0 {
            return None;
        }
        self.read(self.len() - 1).ok()
    }

    pub fn write(&mut self, relative_offset: u32, position: u64) -> Result<(), IndexError> {
        if self.is_full() {
            return Err(IndexError::Full);
        }

        let start = self.size as usize;
        let offset_end = start + OFFSET_WIDTH as usize;
        let position_end = offset_end + POSITION_WIDTH as usize;

        BigEndian::write_u32(&mut self.mmap[start..offset_end], relative_offset);
        BigEndian::write_u64(&mut self.mmap[offset_end..position_end], position);

        self.size += ENTRY_WIDTH;
        Ok(())
    }

    /// Shrinks the index to the first `entries` entries.
    pub fn truncate(&mut self, entries: u64) {
        let size = entries * ENTRY_WIDTH;
        if size < self.size {
            self.size = size;
        }
    }

    /// Flushes the mapping and truncates the file to the logical size.
    ///
    /// Must be the last operation on the index: reopening takes the entry
    /// count from the file length, so the pre-allocated tail has to go.
    pub fn close(&mut self) -> Result<(), IndexError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.mmap.flush()?;
        self.file.set_len(self.size)?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_read() {
        let dir = tempdir().unwrap();
        let mut index = Index::open(dir.path().join("0.index"), 1024).unwrap();

        let entries = [(0u32, 0u64), (1, 10), (2, 1000)];
        for (offset, position) in entries {
            index.write(offset, position).unwrap();
        }

        for (i, (offset, position)) in entries.iter().enumerate() {
            let entry = index.read(i as u64).unwrap();
            assert_eq!(entry.relative_offset, *offset);
            assert_eq!(entry.position, *position);
        }

        assert_eq!(index.read_last().unwrap().position, 1000);
    }

    #[test]
    fn read_out_of_range() {
        let dir = tempdir().unwrap();
        let mut index = Index::open(dir.path().join("0.index"), 1024).unwrap();

        assert!(matches!(index.read(0), Err(IndexError::OutOfRange(0))));

        index.write(0, 11).unwrap();
        assert!(matches!(index.read(1), Err(IndexError::OutOfRange(1))));
    }

    #[test]
    fn write_fails_when_full() {
        let dir = tempdir().unwrap();
        let mut index = Index::open(dir.path().join("0.index"), 3 * ENTRY_WIDTH).unwrap();

        for i in 0..3 {
            index.write(i, i as u64 * 10).unwrap();
        }
        assert!(index.is_full());
        assert!(matches!(index.write(3, 30), Err(IndexError::Full)));
    }

    #[test]
    fn rebuilds_state_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.index");

        let mut index = Index::open(&path, 1024).unwrap();
        index.write(0, 0).unwrap();
        index.write(1, 10).unwrap();
        index.close().unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * ENTRY_WIDTH);

        let index = Index::open(&path, 1024).unwrap();
        assert_eq!(index.len(), 2);
        let entry = index.read_last().unwrap();
        assert_eq!(entry.relative_offset, 1);
        assert_eq!(entry.position, 10);
    }

    #[test]
    fn truncate_drops_tail_entries() {
        let dir = tempdir().unwrap();
        let mut index = Index::open(dir.path().join("0.index"), 1024).unwrap();

        for i in 0..4 {
            index.write(i, i as u64).unwrap();
        }
        index.truncate(2);

        assert_eq!(index.len(), 2);
        assert!(index.read(2).is_err());
        assert_eq!(index.read_last().unwrap().relative_offset, 1);
    }
}
