/// Tuning knobs for the log's segments.
#[derive(Debug, Clone)]
pub struct Config {
    pub segment: SegmentConfig,
}

#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Cap on a segment's store file; crossing it retires the segment.
    pub max_store_bytes: u64,
    /// Cap on a segment's index file; sized up-front for the mmap.
    pub max_index_bytes: u64,
    /// Offset the first segment starts at in a fresh directory.
    pub initial_offset: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            segment: SegmentConfig {
                max_store_bytes: 1024,
                max_index_bytes: 1024,
                initial_offset: 0,
            },
        }
    }
}
