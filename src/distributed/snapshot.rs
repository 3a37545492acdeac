use async_raft::raft::MembershipConfig;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

const META_FILE: &str = "snapshot.meta";
const DATA_FILE: &str = "snapshot.data";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    pub index: u64,
    pub term: u64,
    pub membership: MembershipConfig,
}

/// File-backed snapshot store retaining only the most recent snapshot.
///
/// The data file holds the user log in store wire format. Promotion goes
/// through a scratch file and a rename so a crash mid-write never clobbers
/// the previous snapshot.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>) -> std::io::Result<SnapshotStore> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(SnapshotStore { dir })
    }

    /// Fresh id for a snapshot being produced or received.
    pub fn new_id(term: u64, index: u64) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("{term}-{index}-{millis}")
    }

    /// Scratch path an in-flight snapshot with this id is written to.
    pub fn scratch_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.partial"))
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    pub fn current_meta(&self) -> std::io::Result<Option<SnapshotMeta>> {
        match std::fs::read(self.meta_path()) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        }
    }

    /// Writes a snapshot by draining `reader` into a scratch file, then
    /// promotes it. Blocking; call from a blocking-capable context.
    pub fn write(&self, meta: &SnapshotMeta, mut reader: impl Read) -> std::io::Result<()> {
        let scratch = self.scratch_path(&meta.id);
        let mut file = std::fs::File::create(&scratch)?;
        std::io::copy(&mut reader, &mut file)?;
        file.sync_all()?;
        drop(file);

        self.promote(meta, &scratch)
    }

    /// Promotes an already-written scratch file to be the current snapshot.
    pub fn promote(&self, meta: &SnapshotMeta, scratch: &Path) -> std::io::Result<()> {
        std::fs::rename(scratch, self.data_path())?;

        let meta_scratch = self.dir.join(format!("{}.meta.partial", meta.id));
        std::fs::write(
            &meta_scratch,
            serde_json::to_vec(meta)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
        )?;
        std::fs::rename(meta_scratch, self.meta_path())?;

        info!(
            id = %meta.id,
            index = meta.index,
            term = meta.term,
            "snapshot promoted"
        );
        Ok(())
    }

    /// Opens the current snapshot's data for async streaming.
    pub async fn open_data(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(self.data_path()).await
    }

    /// Opens the current snapshot's data for blocking reads (restore path).
    pub fn open_data_blocking(&self) -> std::io::Result<std::fs::File> {
        std::fs::File::open(self.data_path())
    }
}
