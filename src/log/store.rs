use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Number of bytes used for the length prefix of each record.
pub const LEN_WIDTH: u64 = 8;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("read past end of store at position {0}")]
    OutOfBounds(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Append-only file of length-prefixed records.
///
/// Writes go through a buffered writer; every read flushes the buffer first
/// so readers always observe completed appends. The owning segment
/// serializes mutation, the inner mutex only exists so reads can flush
/// through a shared reference.
pub struct Store {
    inner: Mutex<Inner>,
    path: PathBuf,
}

struct Inner {
    writer: BufWriter<File>,
    size: u64,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Store, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Store {
            inner: Mutex::new(Inner {
                writer: BufWriter::new(file),
                size,
            }),
            path,
        })
    }

    /// Appends `value` prefixed with its length as a big-endian u64.
    ///
    /// Returns the number of bytes written and the position the record
    /// starts at, which the index records for later reads.
    pub fn append(&self, value: &[u8]) -> Result<(u64, u64), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let position = inner.size;

        inner.writer.write_u64::<BigEndian>(value.len() as u64)?;
        inner.writer.write_all(value)?;

        let written = LEN_WIDTH + value.len() as u64;
        inner.size += written;
        Ok((written, position))
    }

    /// Reads the record stored at `position`.
    pub fn read(&self, position: u64) -> Result<Vec<u8>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.writer.flush()?;

        if position + LEN_WIDTH > inner.size {
            return Err(StoreError::OutOfBounds(position));
        }

        let file = inner.writer.get_ref();
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        file.read_exact_at(&mut len_buf, position)?;
        let len = BigEndian::read_u64(&len_buf);

        let mut record = vec![0u8; len as usize];
        file.read_exact_at(&mut record, position + LEN_WIDTH)?;
        Ok(record)
    }

    /// Positional read of raw store bytes.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.writer.flush()?;
        Ok(inner.writer.get_ref().read_at(buf, offset)?)
    }

    /// Shrinks the store to `size` bytes, discarding any later records.
    pub fn truncate(&self, size: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.writer.flush()?;
        inner.writer.get_ref().set_len(size)?;
        inner.size = size;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.writer.flush()?;
        Ok(())
    }

    /// Flushes buffered writes and reopens the file read-only at its current
    /// size, for snapshot streaming.
    pub fn snapshot(&self) -> Result<(File, u64), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.writer.flush()?;
        let file = File::open(&self.path)?;
        Ok((file, inner.size))
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            let _ = inner.writer.flush();
        }
    }
}
