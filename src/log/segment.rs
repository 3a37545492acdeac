use prost::Message;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::config::Config;
use super::index::{Index, IndexError, ENTRY_WIDTH};
use super::store::{Store, StoreError};
use crate::api::v1::Record;

#[derive(Error, Debug)]
pub enum SegmentError {
    /// The segment hit one of its size caps; the log rolls a new one.
    #[error("segment is maxed")]
    Maxed,

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Decode(#[from] prost::DecodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A store/index pair covering the contiguous offset range
/// `[base_offset, next_offset)`.
pub struct Segment {
    store: Store,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    config: Arc<Config>,
}

impl Segment {
    pub fn new(
        dir: impl AsRef<Path>,
        base_offset: u64,
        config: Arc<Config>,
    ) -> Result<Segment, SegmentError> {
        let dir = dir.as_ref();
        let store = Store::open(Self::store_path(dir, base_offset))?;
        let index = Index::open(
            Self::index_path(dir, base_offset),
            config.segment.max_index_bytes,
        )?;

        let next_offset = index
            .read_last()
            .map(|entry| base_offset + entry.relative_offset as u64 + 1)
            .unwrap_or(base_offset);

        debug!(base_offset, next_offset, "opened segment");

        Ok(Segment {
            store,
            index,
            base_offset,
            next_offset,
            config,
        })
    }

    pub fn store_path(dir: &Path, base_offset: u64) -> PathBuf {
        dir.join(format!("{:020}.store", base_offset))
    }

    pub fn index_path(dir: &Path, base_offset: u64) -> PathBuf {
        dir.join(format!("{:020}.index", base_offset))
    }

    /// Assigns the next offset to `record`, persists it, and indexes it.
    pub fn append(&mut self, mut record: Record) -> Result<u64, SegmentError> {
        if self.is_maxed() || self.index.is_full() {
            return Err(SegmentError::Maxed);
        }

        let offset = self.next_offset;
        record.offset = offset;

        let buf = record.encode_to_vec();
        let (_, position) = self.store.append(&buf)?;
        self.index
            .write((offset - self.base_offset) as u32, position)?;

        self.next_offset += 1;
        Ok(offset)
    }

    pub fn read(&self, offset: u64) -> Result<Record, SegmentError> {
        let entry = self.index.read(offset - self.base_offset)?;
        let buf = self.store.read(entry.position)?;
        Ok(Record::decode(buf.as_slice())?)
    }

    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.segment.max_store_bytes
            || self.index.size() >= self.config.segment.max_index_bytes
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Drops every record at `next` and beyond, leaving the segment ending
    /// just before it.
    pub fn truncate_to(&mut self, next: u64) -> Result<(), SegmentError> {
        if next >= self.next_offset || next < self.base_offset {
            return Ok(());
        }

        let cut = self.index.read(next - self.base_offset)?;
        self.index.truncate(next - self.base_offset);
        self.store.truncate(cut.position)?;
        self.next_offset = next;
        Ok(())
    }

    /// Flushed read-only view of the store file, for snapshot streaming.
    pub fn store_snapshot(&self) -> Result<(File, u64), SegmentError> {
        Ok(self.store.snapshot()?)
    }

    pub fn close(&mut self) -> Result<(), SegmentError> {
        self.index.close()?;
        self.store.flush()?;
        Ok(())
    }

    pub fn remove(&mut self) -> Result<(), SegmentError> {
        self.close()?;
        std::fs::remove_file(self.index.path())?;
        std::fs::remove_file(self.store.path())?;
        Ok(())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("base_offset", &self.base_offset)
            .field("next_offset", &self.next_offset)
            .field("entries", &(self.index.size() / ENTRY_WIDTH))
            .finish()
    }
}
