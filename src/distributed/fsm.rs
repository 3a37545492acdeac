use byteorder::{BigEndian, ByteOrder};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use tracing::warn;

use super::stable::{Peer, StableStore};
use super::{ApplyResult, DistributedError};
use crate::api::v1::CreateRecordRequest;
use crate::log::{Log, LogError, LogReader, LEN_WIDTH};

/// Command tag: append one record to the user log.
pub const APPEND_REQUEST_TYPE: u8 = 0x00;

/// Command tag: record a cluster member's name and address so every node
/// can dial every other for elections and replication.
pub const REGISTER_PEER_REQUEST_TYPE: u8 = 0x01;

/// Replicated peer-registry upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRegistration {
    pub id: u64,
    pub name: String,
    pub addr: String,
}

/// Deterministic state machine over the user-facing log.
///
/// Committed entries are opaque bytes starting with a one-byte request tag.
/// Unknown tags apply to nothing so newer nodes can ship new commands past
/// older ones.
#[derive(Clone)]
pub struct Fsm {
    log: Arc<Log>,
    stable: Arc<StableStore>,
}

impl Fsm {
    pub fn new(log: Arc<Log>, stable: Arc<StableStore>) -> Fsm {
        Fsm { log, stable }
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    /// Applies one committed command. Decode and append failures become the
    /// apply result rather than an error: the caller that proposed the
    /// command sees them, the consensus engine does not.
    pub fn apply(&self, index: u64, command: &[u8]) -> Result<ApplyResult, DistributedError> {
        let result = match command.first() {
            Some(&APPEND_REQUEST_TYPE) => self.apply_append(&command[1..]),
            Some(&REGISTER_PEER_REQUEST_TYPE) => self.apply_register_peer(&command[1..]),
            Some(tag) => {
                warn!(tag, index, "ignoring command with unknown request type");
                ApplyResult::Ignored
            }
            None => ApplyResult::Rejected {
                message: "empty command".to_string(),
            },
        };

        self.stable.set_last_applied(index)?;
        Ok(result)
    }

    fn apply_append(&self, body: &[u8]) -> ApplyResult {
        let request = match CreateRecordRequest::decode(body) {
            Ok(request) => request,
            Err(e) => {
                return ApplyResult::Rejected {
                    message: format!("malformed append request: {e}"),
                }
            }
        };

        match self.log.append(request.record.unwrap_or_default()) {
            Ok(offset) => ApplyResult::Appended { offset },
            Err(e) => ApplyResult::Rejected {
                message: e.to_string(),
            },
        }
    }

    fn apply_register_peer(&self, body: &[u8]) -> ApplyResult {
        let registration: PeerRegistration = match serde_json::from_slice(body) {
            Ok(registration) => registration,
            Err(e) => {
                return ApplyResult::Rejected {
                    message: format!("malformed peer registration: {e}"),
                }
            }
        };

        let result = self.stable.set_peer(
            registration.id,
            &Peer {
                name: registration.name,
                addr: registration.addr,
            },
        );
        match result {
            Ok(()) => ApplyResult::Done,
            Err(e) => ApplyResult::Rejected {
                message: e.to_string(),
            },
        }
    }

    /// Serialized view of the state machine: the log's store files in wire
    /// format, captured under the log's shared lock.
    pub fn snapshot(&self) -> Result<LogReader, LogError> {
        self.log.reader()
    }

    /// Rebuilds the log from a snapshot stream of `[len: u64 BE][record]`
    /// frames. The first record's offset becomes the log's new initial
    /// offset so every record lands back where it was.
    pub fn restore(&self, mut reader: impl Read) -> Result<(), DistributedError> {
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        let mut first = true;

        loop {
            match reader.read_exact(&mut len_buf) {
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                other => other?,
            }
            let len = BigEndian::read_u64(&len_buf) as usize;

            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;
            let record = crate::api::v1::Record::decode(buf.as_slice())
                .map_err(|e| DistributedError::Malformed(format!("snapshot record: {e}")))?;

            if first {
                self.log.reset_from(record.offset)?;
                first = false;
            }
            self.log.append(record)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::Record;
    use crate::log::Config;
    use tempfile::tempdir;

    fn fsm_fixture(dir: &std::path::Path) -> Fsm {
        let log = Arc::new(Log::new(dir.join("log"), Config::default()).unwrap());
        let stable = Arc::new(StableStore::open(dir.join("stable")).unwrap());
        Fsm::new(log, stable)
    }

    fn append_command(value: &str) -> Vec<u8> {
        let request = CreateRecordRequest {
            record: Some(Record {
                value: value.as_bytes().to_vec(),
                ..Default::default()
            }),
        };
        let mut command = vec![APPEND_REQUEST_TYPE];
        request.encode(&mut command).unwrap();
        command
    }

    #[test]
    fn apply_append_assigns_offsets() {
        let dir = tempdir().unwrap();
        let fsm = fsm_fixture(dir.path());

        for (i, value) in ["first", "second"].iter().enumerate() {
            let result = fsm.apply(i as u64 + 1, &append_command(value)).unwrap();
            match result {
                ApplyResult::Appended { offset } => assert_eq!(offset, i as u64),
                other => panic!("unexpected apply result: {other:?}"),
            }
        }

        assert_eq!(fsm.log().read(1).unwrap().value, b"second");
        assert_eq!(fsm.stable.last_applied().unwrap(), 2);
    }

    #[test]
    fn apply_rejects_malformed_body() {
        let dir = tempdir().unwrap();
        let fsm = fsm_fixture(dir.path());

        let mut command = vec![APPEND_REQUEST_TYPE];
        command.extend_from_slice(&[0xff, 0xff, 0xff]);

        match fsm.apply(1, &command).unwrap() {
            ApplyResult::Rejected { .. } => {}
            other => panic!("unexpected apply result: {other:?}"),
        }
    }

    #[test]
    fn apply_ignores_unknown_tag() {
        let dir = tempdir().unwrap();
        let fsm = fsm_fixture(dir.path());

        match fsm.apply(1, &[0x7f, 1, 2, 3]).unwrap() {
            ApplyResult::Ignored => {}
            other => panic!("unexpected apply result: {other:?}"),
        }
    }

    #[test]
    fn apply_registers_peers() {
        let dir = tempdir().unwrap();
        let fsm = fsm_fixture(dir.path());

        let registration = PeerRegistration {
            id: 2,
            name: "2".to_string(),
            addr: "127.0.0.1:9002".to_string(),
        };
        let mut command = vec![REGISTER_PEER_REQUEST_TYPE];
        command.extend_from_slice(&serde_json::to_vec(&registration).unwrap());

        match fsm.apply(1, &command).unwrap() {
            ApplyResult::Done => {}
            other => panic!("unexpected apply result: {other:?}"),
        }

        let peer = fsm.stable.peer(2).unwrap().unwrap();
        assert_eq!(peer.addr, "127.0.0.1:9002");
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let source_dir = tempdir().unwrap();
        let source = fsm_fixture(source_dir.path());

        // populate at a non-zero initial offset to prove it survives
        source.log().reset_from(10).unwrap();
        for value in ["a", "b", "c"] {
            source
                .apply(1, &append_command(value))
                .unwrap();
        }

        let mut snapshot = Vec::new();
        source.snapshot().unwrap().read_to_end(&mut snapshot).unwrap();

        let restored_dir = tempdir().unwrap();
        let restored = fsm_fixture(restored_dir.path());
        restored.restore(snapshot.as_slice()).unwrap();

        assert_eq!(restored.log().lowest_offset(), 10);
        assert_eq!(restored.log().highest_offset(), 12);
        for (i, value) in ["a", "b", "c"].iter().enumerate() {
            let record = restored.log().read(10 + i as u64).unwrap();
            assert_eq!(record.value, value.as_bytes());
            assert_eq!(record.offset, 10 + i as u64);
        }
    }

    #[test]
    fn restore_empty_snapshot_is_noop() {
        let dir = tempdir().unwrap();
        let fsm = fsm_fixture(dir.path());
        fsm.restore(std::io::empty()).unwrap();
        assert_eq!(fsm.log().highest_offset(), 0);
    }
}
