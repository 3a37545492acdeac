use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::config::Config;
use super::segment::{Segment, SegmentError};
use crate::api::v1::Record;

#[derive(Error, Debug)]
pub enum LogError {
    /// The offset is below the lowest or above the highest offset held.
    #[error("offset out of range: {0}")]
    OffsetOutOfRange(u64),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Ordered collection of segments over one directory.
///
/// Appends go to the last (active) segment, rolling a fresh one whenever a
/// size cap is crossed. A single reader-writer lock serializes access; the
/// segments need no locking of their own.
pub struct Log {
    dir: PathBuf,
    inner: RwLock<Inner>,
    appended: Arc<Notify>,
}

struct Inner {
    config: Arc<Config>,
    segments: Vec<Segment>,
}

impl Log {
    pub fn new(dir: impl AsRef<Path>, config: Config) -> Result<Log, LogError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let config = Arc::new(config);
        let segments = Self::setup(&dir, &config)?;

        Ok(Log {
            dir,
            inner: RwLock::new(Inner { config, segments }),
            appended: Arc::new(Notify::new()),
        })
    }

    /// Scans the directory for segment files and opens them in base-offset
    /// order, creating the initial segment when none exist.
    fn setup(dir: &Path, config: &Arc<Config>) -> Result<Vec<Segment>, LogError> {
        let mut base_offsets = BTreeSet::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let stem = path.file_stem().and_then(|s| s.to_str());
            if let Some(base_offset) = stem.and_then(|s| s.parse::<u64>().ok()) {
                base_offsets.insert(base_offset);
            }
        }

        let mut segments = Vec::with_capacity(base_offsets.len().max(1));
        for base_offset in base_offsets {
            segments.push(Segment::new(dir, base_offset, config.clone())?);
        }
        if segments.is_empty() {
            segments.push(Segment::new(
                dir,
                config.segment.initial_offset,
                config.clone(),
            )?);
        }

        info!(dir = %dir.display(), segments = segments.len(), "log opened");
        Ok(segments)
    }

    fn roll(dir: &Path, inner: &mut Inner, base_offset: u64) -> Result<(), LogError> {
        debug!(base_offset, "rolling new segment");
        let segment = Segment::new(dir, base_offset, inner.config.clone())?;
        inner.segments.push(segment);
        Ok(())
    }

    /// Appends `record`, assigning and returning the next offset.
    pub fn append(&self, record: Record) -> Result<u64, LogError> {
        let mut inner = self.inner.write().unwrap();

        // a segment reopened at its cap never takes another record
        let next = Self::active(&inner).next_offset();
        if Self::active(&inner).is_maxed() {
            Self::roll(&self.dir, &mut inner, next)?;
        }

        let offset = match Self::active_mut(&mut inner).append(record.clone()) {
            Ok(offset) => offset,
            Err(SegmentError::Maxed) => {
                // caps that are not entry-aligned surface here instead
                let next = Self::active(&inner).next_offset();
                Self::roll(&self.dir, &mut inner, next)?;
                Self::active_mut(&mut inner).append(record)?
            }
            Err(e) => return Err(e.into()),
        };

        if Self::active(&inner).is_maxed() {
            Self::roll(&self.dir, &mut inner, offset + 1)?;
        }

        drop(inner);
        self.appended.notify_waiters();
        Ok(offset)
    }

    /// Reads the record at `offset` from whichever segment covers it.
    pub fn read(&self, offset: u64) -> Result<Record, LogError> {
        let inner = self.inner.read().unwrap();

        let idx = inner
            .segments
            .partition_point(|s| s.base_offset() <= offset);
        let segment = idx
            .checked_sub(1)
            .map(|i| &inner.segments[i])
            .filter(|s| offset < s.next_offset())
            .ok_or(LogError::OffsetOutOfRange(offset))?;

        Ok(segment.read(offset)?)
    }

    pub fn lowest_offset(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.segments[0].base_offset()
    }

    pub fn highest_offset(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        match Self::active(&inner).next_offset() {
            0 => 0,
            next => next - 1,
        }
    }

    /// Removes every segment whose records all fall at or below `lowest`.
    pub fn truncate(&self, lowest: u64) -> Result<(), LogError> {
        let mut inner = self.inner.write().unwrap();

        let mut kept = Vec::with_capacity(inner.segments.len());
        for mut segment in inner.segments.drain(..) {
            if segment.next_offset() <= lowest + 1 {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        inner.segments = kept;

        if inner.segments.is_empty() {
            Self::roll(&self.dir, &mut inner, lowest + 1)?;
        }
        Ok(())
    }

    /// Deletes every record at `since` and beyond, so the log ends just
    /// before it. Used when the consensus layer resolves conflicting tails.
    pub fn truncate_from(&self, since: u64) -> Result<(), LogError> {
        let mut inner = self.inner.write().unwrap();

        let mut kept = Vec::with_capacity(inner.segments.len());
        for mut segment in inner.segments.drain(..) {
            if segment.base_offset() >= since {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        inner.segments = kept;

        if let Some(last) = inner.segments.last_mut() {
            last.truncate_to(since)?;
        } else {
            Self::roll(&self.dir, &mut inner, since)?;
        }
        Ok(())
    }

    /// Byte stream over every segment's store file in order, in the store
    /// wire format. The segment list and sizes are captured under the read
    /// lock; the bytes are read lazily from the returned reader.
    pub fn reader(&self) -> Result<LogReader, LogError> {
        let inner = self.inner.read().unwrap();

        let mut parts = Vec::with_capacity(inner.segments.len());
        for segment in &inner.segments {
            let (file, size) = segment.store_snapshot()?;
            parts.push(file.take(size));
        }
        Ok(LogReader { parts, current: 0 })
    }

    /// Signal fired after every append, for tailing readers.
    pub fn subscribe(&self) -> Arc<Notify> {
        self.appended.clone()
    }

    pub fn close(&self) -> Result<(), LogError> {
        let mut inner = self.inner.write().unwrap();
        for segment in inner.segments.iter_mut() {
            segment.close()?;
        }
        Ok(())
    }

    /// Closes the log and deletes its directory tree.
    pub fn remove(&self) -> Result<(), LogError> {
        self.close()?;
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Wipes the log and reinitializes it empty at the configured initial
    /// offset.
    pub fn reset(&self) -> Result<(), LogError> {
        let mut inner = self.inner.write().unwrap();
        let config = inner.config.clone();
        Self::wipe_and_init(&self.dir, &mut inner, config)
    }

    /// Wipes the log and reinitializes it empty, starting at
    /// `initial_offset`. Snapshot restores land records at their original
    /// offsets this way.
    pub fn reset_from(&self, initial_offset: u64) -> Result<(), LogError> {
        let mut inner = self.inner.write().unwrap();
        let mut config = (*inner.config).clone();
        config.segment.initial_offset = initial_offset;
        Self::wipe_and_init(&self.dir, &mut inner, Arc::new(config))
    }

    fn wipe_and_init(
        dir: &Path,
        inner: &mut Inner,
        config: Arc<Config>,
    ) -> Result<(), LogError> {
        for segment in inner.segments.iter_mut() {
            segment.close()?;
        }
        inner.segments.clear();

        std::fs::remove_dir_all(dir)?;
        std::fs::create_dir_all(dir)?;

        inner.config = config;
        inner.segments = Self::setup(dir, &inner.config)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn active(inner: &Inner) -> &Segment {
        inner.segments.last().unwrap()
    }

    fn active_mut(inner: &mut Inner) -> &mut Segment {
        inner.segments.last_mut().unwrap()
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Read-only concatenation of store files captured by [`Log::reader`].
pub struct LogReader {
    parts: Vec<std::io::Take<File>>,
    current: usize,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current < self.parts.len() {
            let n = self.parts[self.current].read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.current += 1;
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::config::SegmentConfig;
    use crate::log::store::LEN_WIDTH;
    use byteorder::{BigEndian, ByteOrder};
    use prost::Message;
    use tempfile::tempdir;

    fn record(value: &str) -> Record {
        Record {
            value: value.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn small_segment_config() -> Config {
        Config {
            segment: SegmentConfig {
                max_store_bytes: 64,
                max_index_bytes: 1024,
                initial_offset: 0,
            },
        }
    }

    #[test]
    fn append_read() {
        let dir = tempdir().unwrap();
        let log = Log::new(dir.path(), Config::default()).unwrap();

        let offset = log.append(record("hello world")).unwrap();
        assert_eq!(offset, 0);

        let got = log.read(offset).unwrap();
        assert_eq!(got.value, b"hello world");
        assert_eq!(got.offset, offset);
    }

    #[test]
    fn offset_out_of_range() {
        let dir = tempdir().unwrap();
        let log = Log::new(dir.path(), Config::default()).unwrap();
        log.append(record("hello")).unwrap();

        assert!(matches!(log.read(1), Err(LogError::OffsetOutOfRange(1))));
    }

    #[test]
    fn init_existing() {
        let dir = tempdir().unwrap();

        let log = Log::new(dir.path(), small_segment_config()).unwrap();
        for i in 0..3 {
            log.append(record(&format!("hello world {i}"))).unwrap();
        }
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        log.close().unwrap();
        drop(log);

        let log = Log::new(dir.path(), small_segment_config()).unwrap();
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        for i in 0..3 {
            let got = log.read(i).unwrap();
            assert_eq!(got.value, format!("hello world {i}").into_bytes());
        }
    }

    #[test_log::test]
    fn rollover_keeps_offsets_contiguous() {
        let dir = tempdir().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        for i in 0..30u64 {
            let offset = log.append(record(&format!("value-{i}"))).unwrap();
            assert_eq!(offset, i);
        }

        // multiple segment files on disk, all offsets readable
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(files > 2, "expected several segment files, got {files}");
        for i in 0..30u64 {
            assert_eq!(log.read(i).unwrap().value, format!("value-{i}").into_bytes());
        }
        assert_eq!(log.highest_offset(), 29);
    }

    #[test]
    fn initial_offset_respected() {
        let dir = tempdir().unwrap();
        let log = Log::new(
            dir.path(),
            Config {
                segment: SegmentConfig {
                    initial_offset: 1,
                    ..Config::default().segment
                },
            },
        )
        .unwrap();

        assert_eq!(log.highest_offset(), 0);
        let offset = log.append(record("first")).unwrap();
        assert_eq!(offset, 1);
        assert_eq!(log.lowest_offset(), 1);
        assert_eq!(log.highest_offset(), 1);
    }

    #[test_log::test]
    fn truncate_removes_old_segments() {
        let dir = tempdir().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        for i in 0..20u64 {
            log.append(record(&format!("value-{i}"))).unwrap();
        }

        log.truncate(10).unwrap();
        assert!(log.lowest_offset() > 0);
        assert!(log.read(0).is_err());
        assert_eq!(log.read(15).unwrap().value, b"value-15".to_vec());
        assert_eq!(log.highest_offset(), 19);
    }

    #[test]
    fn truncate_from_cuts_tail() {
        let dir = tempdir().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        for i in 0..20u64 {
            log.append(record(&format!("value-{i}"))).unwrap();
        }

        log.truncate_from(7).unwrap();
        assert_eq!(log.highest_offset(), 6);
        assert_eq!(log.read(6).unwrap().value, b"value-6".to_vec());
        assert!(log.read(7).is_err());

        let offset = log.append(record("replacement")).unwrap();
        assert_eq!(offset, 7);
        assert_eq!(log.read(7).unwrap().value, b"replacement".to_vec());
    }

    #[test]
    fn reader_streams_store_format() {
        let dir = tempdir().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        let values = ["first", "second", "third"];
        for value in values {
            log.append(record(value)).unwrap();
        }

        let mut bytes = Vec::new();
        log.reader().unwrap().read_to_end(&mut bytes).unwrap();

        let mut cursor = 0;
        for (i, value) in values.iter().enumerate() {
            let len = BigEndian::read_u64(&bytes[cursor..cursor + LEN_WIDTH as usize]) as usize;
            cursor += LEN_WIDTH as usize;
            let got = Record::decode(&bytes[cursor..cursor + len]).unwrap();
            cursor += len;
            assert_eq!(got.value, value.as_bytes());
            assert_eq!(got.offset, i as u64);
        }
        assert_eq!(cursor, bytes.len());
    }

    #[test]
    fn reset_from_starts_at_new_offset() {
        let dir = tempdir().unwrap();
        let log = Log::new(dir.path(), Config::default()).unwrap();
        log.append(record("old")).unwrap();

        log.reset_from(42).unwrap();
        assert_eq!(log.lowest_offset(), 42);
        assert!(log.read(0).is_err());

        let offset = log.append(record("new")).unwrap();
        assert_eq!(offset, 42);
    }
}
