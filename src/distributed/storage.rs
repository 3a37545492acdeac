use anyhow::{bail, Result};
use async_raft::raft::{Entry, EntryPayload, EntrySnapshotPointer, MembershipConfig};
use async_raft::storage::{CurrentSnapshotData, HardState, InitialState};
use async_raft::{NodeId, RaftStorage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::fsm::Fsm;
use super::snapshot::{SnapshotMeta, SnapshotStore};
use super::stable::StableStore;
use super::{ApplyResult, CommandBytes};
use crate::api::v1::Record;
use crate::log::Log;

const RECORD_TYPE_BLANK: u32 = 0;
const RECORD_TYPE_NORMAL: u32 = 1;
const RECORD_TYPE_CONFIG_CHANGE: u32 = 2;
const RECORD_TYPE_SNAPSHOT_POINTER: u32 = 3;

/// Raft persistence over the segmented log.
///
/// Consensus entries are stored as records in a dedicated log whose offsets
/// start at 1 so raft indices map to offsets one-to-one: the serialized
/// entry payload becomes the record value, the entry's term and index the
/// record's term and offset. Hard state, the applied watermark, and the peer
/// registry live in the stable store; the latest snapshot in the snapshot
/// store.
pub struct RaftStore {
    id: NodeId,
    raft_log: Arc<Log>,
    fsm: Fsm,
    stable: Arc<StableStore>,
    snapshots: Arc<SnapshotStore>,
}

impl RaftStore {
    pub fn new(
        id: NodeId,
        raft_log: Arc<Log>,
        fsm: Fsm,
        stable: Arc<StableStore>,
        snapshots: Arc<SnapshotStore>,
    ) -> RaftStore {
        RaftStore {
            id,
            raft_log,
            fsm,
            stable,
            snapshots,
        }
    }

    /// Whether any consensus state was persisted by a previous run. Checked
    /// before bootstrap so an established node never re-forms a cluster.
    pub fn has_existing_state(&self) -> Result<bool> {
        Ok(self.stable.hard_state()?.is_some()
            || self.raft_log.highest_offset() != 0
            || self.snapshots.current_meta()?.is_some())
    }

    fn entry_to_record(entry: &Entry<CommandBytes>) -> Result<Record> {
        let record_type = match &entry.payload {
            EntryPayload::Blank => RECORD_TYPE_BLANK,
            EntryPayload::Normal(_) => RECORD_TYPE_NORMAL,
            EntryPayload::ConfigChange(_) => RECORD_TYPE_CONFIG_CHANGE,
            EntryPayload::SnapshotPointer(_) => RECORD_TYPE_SNAPSHOT_POINTER,
        };
        Ok(Record {
            value: serde_json::to_vec(&entry.payload)?,
            offset: entry.index,
            term: entry.term,
            record_type,
        })
    }

    fn record_to_entry(record: &Record) -> Result<Entry<CommandBytes>> {
        Ok(Entry {
            term: record.term,
            index: record.offset,
            payload: serde_json::from_slice(&record.value)?,
        })
    }

    fn store_entry(&self, entry: &Entry<CommandBytes>) -> Result<()> {
        if let EntryPayload::ConfigChange(change) = &entry.payload {
            self.stable.set_membership(&change.membership)?;
        }

        let record = Self::entry_to_record(entry)?;
        let assigned = self.raft_log.append(record)?;
        if assigned != entry.index {
            bail!(
                "raft log index mismatch: entry {} landed at offset {assigned}",
                entry.index
            );
        }
        Ok(())
    }
}

#[async_trait]
impl RaftStorage<CommandBytes, ApplyResult> for RaftStore {
    type Snapshot = tokio::fs::File;
    type ShutdownError = std::io::Error;

    async fn get_membership_config(&self) -> Result<MembershipConfig> {
        let lowest = self.raft_log.lowest_offset();
        let mut index = self.raft_log.highest_offset();

        while index >= lowest && index > 0 {
            if let Ok(record) = self.raft_log.read(index) {
                if record.record_type == RECORD_TYPE_CONFIG_CHANGE
                    || record.record_type == RECORD_TYPE_SNAPSHOT_POINTER
                {
                    match Self::record_to_entry(&record)?.payload {
                        EntryPayload::ConfigChange(change) => return Ok(change.membership),
                        EntryPayload::SnapshotPointer(pointer) => return Ok(pointer.membership),
                        _ => {}
                    }
                }
            }
            index -= 1;
        }

        if let Some(membership) = self.stable.membership()? {
            return Ok(membership);
        }
        if let Some(meta) = self.snapshots.current_meta()? {
            return Ok(meta.membership);
        }
        Ok(MembershipConfig::new_initial(self.id))
    }

    async fn get_initial_state(&self) -> Result<InitialState> {
        let hard_state = match self.stable.hard_state()? {
            Some(hs) => hs,
            None => {
                let initial = InitialState::new_initial(self.id);
                self.stable.set_hard_state(&initial.hard_state)?;
                return Ok(initial);
            }
        };

        let membership = self.get_membership_config().await?;
        let snapshot_meta = self.snapshots.current_meta()?;

        let highest = self.raft_log.highest_offset();
        let (last_log_index, last_log_term) = match self.raft_log.read(highest) {
            Ok(record) => (highest, record.term),
            // empty or fully compacted log: the snapshot carries the tail
            Err(_) => snapshot_meta
                .as_ref()
                .map(|meta| (meta.index, meta.term))
                .unwrap_or((0, 0)),
        };

        Ok(InitialState {
            last_log_index,
            last_log_term,
            last_applied_log: self.stable.last_applied()?,
            hard_state,
            membership,
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        self.stable.set_hard_state(hs)?;
        Ok(())
    }

    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<CommandBytes>>> {
        let start = start.max(self.raft_log.lowest_offset()).max(1);
        let stop = stop.min(self.raft_log.highest_offset() + 1);

        let mut entries = Vec::new();
        let mut index = start;
        while index < stop {
            let record = self.raft_log.read(index)?;
            entries.push(Self::record_to_entry(&record)?);
            index += 1;
        }
        Ok(entries)
    }

    async fn delete_logs_from(&self, start: u64, stop: Option<u64>) -> Result<()> {
        match stop {
            // conflict resolution: drop the tail from `start` on
            None => self.raft_log.truncate_from(start.max(1))?,
            Some(stop) => {
                if start <= self.raft_log.lowest_offset() {
                    // prefix compaction, segment-granular
                    self.raft_log.truncate(stop.saturating_sub(1))?;
                } else if stop > self.raft_log.highest_offset() {
                    self.raft_log.truncate_from(start)?;
                } else {
                    bail!("unsupported mid-log deletion range [{start}, {stop})");
                }
            }
        }
        Ok(())
    }

    async fn append_entry_to_log(&self, entry: &Entry<CommandBytes>) -> Result<()> {
        self.store_entry(entry)
    }

    async fn replicate_to_log(&self, entries: &[Entry<CommandBytes>]) -> Result<()> {
        for entry in entries {
            self.store_entry(entry)?;
        }
        Ok(())
    }

    async fn apply_entry_to_state_machine(
        &self,
        index: &u64,
        data: &CommandBytes,
    ) -> Result<ApplyResult> {
        Ok(self.fsm.apply(*index, &data.0)?)
    }

    async fn replicate_to_state_machine(&self, entries: &[(&u64, &CommandBytes)]) -> Result<()> {
        for (index, data) in entries {
            self.fsm.apply(**index, &data.0)?;
        }
        Ok(())
    }

    async fn do_log_compaction(&self) -> Result<CurrentSnapshotData<Self::Snapshot>> {
        let through = self.stable.last_applied()?;
        if through == 0 {
            bail!("nothing applied yet, refusing to snapshot");
        }

        let term = match self.raft_log.read(through) {
            Ok(record) => record.term,
            Err(_) => self
                .snapshots
                .current_meta()?
                .map(|meta| meta.term)
                .unwrap_or(0),
        };
        let membership = self.get_membership_config().await?;

        let meta = SnapshotMeta {
            id: SnapshotStore::new_id(term, through),
            index: through,
            term,
            membership: membership.clone(),
        };

        let reader = self.fsm.snapshot()?;
        let snapshots = self.snapshots.clone();
        let write_meta = meta.clone();
        tokio::task::spawn_blocking(move || snapshots.write(&write_meta, reader)).await??;

        self.raft_log.truncate(through)?;
        info!(index = through, term, "compacted raft log into snapshot");

        let file = self.snapshots.open_data().await?;
        Ok(CurrentSnapshotData {
            term,
            index: through,
            membership,
            snapshot: Box::new(file),
        })
    }

    async fn create_snapshot(&self) -> Result<(String, Box<Self::Snapshot>)> {
        let id = SnapshotStore::new_id(0, 0);
        let file = tokio::fs::File::create(self.snapshots.scratch_path(&id)).await?;
        Ok((id, Box::new(file)))
    }

    async fn finalize_snapshot_installation(
        &self,
        index: u64,
        term: u64,
        delete_through: Option<u64>,
        id: String,
        snapshot: Box<Self::Snapshot>,
    ) -> Result<()> {
        let mut file = *snapshot;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let scratch = self.snapshots.scratch_path(&id);

        let fsm = self.fsm.clone();
        let restore_path = scratch.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::open(&restore_path)?;
            fsm.restore(std::io::BufReader::new(file))?;
            Ok(())
        })
        .await??;

        let membership = match self.stable.membership()? {
            Some(membership) => membership,
            None => MembershipConfig::new_initial(self.id),
        };

        self.snapshots.promote(
            &SnapshotMeta {
                id: id.clone(),
                index,
                term,
                membership: membership.clone(),
            },
            &scratch,
        )?;

        match delete_through {
            Some(through) => self.raft_log.truncate(through)?,
            None => {
                // the whole log is superseded; restart it at the snapshot
                // index with a pointer entry so restarts see the right tail
                self.raft_log.reset_from(index)?;
                self.store_entry(&Entry {
                    term,
                    index,
                    payload: EntryPayload::SnapshotPointer(EntrySnapshotPointer {
                        id,
                        membership: membership.clone(),
                    }),
                })?;
            }
        }

        self.stable.set_last_applied(index)?;
        self.stable.set_membership(&membership)?;
        info!(index, term, "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(
        &self,
    ) -> Result<Option<CurrentSnapshotData<Self::Snapshot>>> {
        match self.snapshots.current_meta()? {
            None => Ok(None),
            Some(meta) => {
                let file = self.snapshots.open_data().await?;
                Ok(Some(CurrentSnapshotData {
                    term: meta.term,
                    index: meta.index,
                    membership: meta.membership,
                    snapshot: Box::new(file),
                }))
            }
        }
    }
}
