use async_raft::raft::MembershipConfig;
use async_raft::storage::HardState;
use async_raft::NodeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const HARD_STATE_KEY: &str = "hard_state";
const LAST_APPLIED_KEY: &str = "last_applied";
const MEMBERSHIP_KEY: &str = "membership";
const PEER_PREFIX: &str = "peer:";

#[derive(Error, Debug)]
pub enum StableError {
    #[error(transparent)]
    Db(#[from] sled::Error),

    #[error("corrupt stable store entry {key:?}: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
}

/// A known cluster member, addressable over the shared raft/RPC port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub addr: String,
}

/// Durable key-value store for consensus metadata: hard state, the applied
/// watermark, the latest membership, and the peer registry that maps raft
/// node ids back to names and addresses.
pub struct StableStore {
    db: sled::Db,
}

impl StableStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<StableStore, StableError> {
        Ok(StableStore {
            db: sled::open(dir)?,
        })
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StableError> {
        match self.db.get(key)? {
            None => Ok(None),
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|source| StableError::Corrupt {
                    key: key.to_string(),
                    source,
                }),
        }
    }

    fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StableError> {
        let raw = serde_json::to_vec(value).map_err(|source| StableError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        self.db.insert(key, raw)?;
        Ok(())
    }

    pub fn hard_state(&self) -> Result<Option<HardState>, StableError> {
        self.get(HARD_STATE_KEY)
    }

    pub fn set_hard_state(&self, hs: &HardState) -> Result<(), StableError> {
        self.set(HARD_STATE_KEY, hs)?;
        self.db.flush()?;
        Ok(())
    }

    /// Index of the last log entry applied to the state machine. The user
    /// log is durable, so this watermark keeps restarts from re-applying
    /// committed entries.
    pub fn last_applied(&self) -> Result<u64, StableError> {
        Ok(self.get(LAST_APPLIED_KEY)?.unwrap_or(0))
    }

    pub fn set_last_applied(&self, index: u64) -> Result<(), StableError> {
        self.set(LAST_APPLIED_KEY, &index)
    }

    pub fn membership(&self) -> Result<Option<MembershipConfig>, StableError> {
        self.get(MEMBERSHIP_KEY)
    }

    pub fn set_membership(&self, membership: &MembershipConfig) -> Result<(), StableError> {
        self.set(MEMBERSHIP_KEY, membership)
    }

    pub fn peer(&self, id: NodeId) -> Result<Option<Peer>, StableError> {
        self.get(&format!("{PEER_PREFIX}{id}"))
    }

    pub fn set_peer(&self, id: NodeId, peer: &Peer) -> Result<(), StableError> {
        self.set(&format!("{PEER_PREFIX}{id}"), peer)
    }

    pub fn remove_peer(&self, id: NodeId) -> Result<(), StableError> {
        self.db.remove(format!("{PEER_PREFIX}{id}"))?;
        Ok(())
    }

    pub fn peers(&self) -> Result<Vec<(NodeId, Peer)>, StableError> {
        let mut peers = Vec::new();
        for item in self.db.scan_prefix(PEER_PREFIX) {
            let (key, raw) = item?;
            let key = String::from_utf8_lossy(&key).to_string();
            let id = match key[PEER_PREFIX.len()..].parse::<NodeId>() {
                Ok(id) => id,
                Err(_) => continue,
            };
            let peer = serde_json::from_slice(&raw)
                .map_err(|source| StableError::Corrupt { key, source })?;
            peers.push((id, peer));
        }
        Ok(peers)
    }

    pub fn flush(&self) -> Result<(), StableError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hard_state_round_trip() {
        let dir = tempdir().unwrap();
        let stable = StableStore::open(dir.path()).unwrap();

        assert!(stable.hard_state().unwrap().is_none());

        let hs = HardState {
            current_term: 3,
            voted_for: Some(7),
        };
        stable.set_hard_state(&hs).unwrap();

        let got = stable.hard_state().unwrap().unwrap();
        assert_eq!(got.current_term, 3);
        assert_eq!(got.voted_for, Some(7));
    }

    #[test]
    fn last_applied_defaults_to_zero() {
        let dir = tempdir().unwrap();
        let stable = StableStore::open(dir.path()).unwrap();

        assert_eq!(stable.last_applied().unwrap(), 0);
        stable.set_last_applied(12).unwrap();
        assert_eq!(stable.last_applied().unwrap(), 12);
    }

    #[test]
    fn peer_registry() {
        let dir = tempdir().unwrap();
        let stable = StableStore::open(dir.path()).unwrap();

        let peer = Peer {
            name: "1".to_string(),
            addr: "127.0.0.1:9001".to_string(),
        };
        stable.set_peer(1, &peer).unwrap();
        stable
            .set_peer(
                2,
                &Peer {
                    name: "2".to_string(),
                    addr: "127.0.0.1:9002".to_string(),
                },
            )
            .unwrap();

        assert_eq!(stable.peer(1).unwrap().unwrap(), peer);
        assert_eq!(stable.peers().unwrap().len(), 2);

        stable.remove_peer(1).unwrap();
        assert!(stable.peer(1).unwrap().is_none());
        assert_eq!(stable.peers().unwrap().len(), 1);
    }
}
