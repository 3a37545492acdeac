mod fsm;
mod network;
mod snapshot;
mod stable;
mod storage;
mod stream;

pub use fsm::{Fsm, PeerRegistration, APPEND_REQUEST_TYPE, REGISTER_PEER_REQUEST_TYPE};
pub use network::RaftClient;
pub use snapshot::{SnapshotMeta, SnapshotStore};
pub use stable::{Peer, StableError, StableStore};
pub use storage::RaftStore;
pub use stream::{
    AppIncoming, BoxedConn, Mux, MuxStream, RaftLane, StreamError, StreamLayer, RAFT_RPC_TAG,
};

use async_raft::config::SnapshotPolicy;
use async_raft::error::{ChangeConfigError, ClientWriteError, InitializeError};
use async_raft::raft::ClientWriteRequest;
use async_raft::{AppData, AppDataResponse, NodeId, Raft};
use async_trait::async_trait;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::v1::{CreateRecordRequest, Record, Server};
use crate::log::{Config as LogConfig, Log, LogError};

/// How long a proposed command may take to commit before the caller gets a
/// timeout.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque command replicated through consensus: a one-byte request tag
/// followed by the tag's schema-encoded body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandBytes(pub Vec<u8>);

impl AppData for CommandBytes {}

/// Outcome of applying a committed command to the state machine. Failures
/// ride back to the proposing client as values so the consensus engine
/// never sees them as storage faults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApplyResult {
    Appended { offset: u64 },
    Done,
    Rejected { message: String },
    Ignored,
}

impl AppDataResponse for ApplyResult {}

pub(crate) type RaftHandle = Raft<CommandBytes, ApplyResult, RaftClient, RaftStore>;

#[derive(Error, Debug)]
pub enum DistributedError {
    #[error("not the cluster leader")]
    NotLeader,

    #[error("timed out")]
    Timeout,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Stable(#[from] StableError),

    #[error("consensus error: {0}")]
    Raft(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encode(#[from] prost::EncodeError),
}

/// Maps a node name to its raft id: numeric names map to their value,
/// anything else is FNV-1a hashed.
pub fn node_id_for(name: &str) -> NodeId {
    if let Ok(id) = name.parse::<NodeId>() {
        return id;
    }
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_name: String,
    /// Address peers dial to reach this node's shared port.
    pub advertise_addr: String,
    /// Form a single-voter cluster on first start.
    pub bootstrap: bool,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub snapshot_logs_since_last: u64,
    pub dial_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            node_name: String::new(),
            advertise_addr: String::new(),
            bootstrap: false,
            heartbeat_interval_ms: 50,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            snapshot_logs_since_last: 8192,
            dial_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DistributedConfig {
    pub log: LogConfig,
    pub raft: RaftConfig,
}

/// A log replicated across a consensus group.
///
/// Writes are proposed to the raft leader and applied by every node's state
/// machine; reads are served from the local user log, so followers may lag
/// the leader by the replication delay.
pub struct DistributedLog {
    log: Arc<Log>,
    raft: RaftHandle,
    stable: Arc<StableStore>,
    local_id: NodeId,
    server_task: JoinHandle<()>,
}

impl DistributedLog {
    pub async fn new(
        data_dir: impl AsRef<Path>,
        config: DistributedConfig,
        stream_layer: StreamLayer,
    ) -> Result<DistributedLog, DistributedError> {
        let data_dir = data_dir.as_ref();
        let stream_layer = Arc::new(stream_layer);

        let log = Arc::new(Log::new(data_dir.join("log"), config.log.clone())?);

        // the consensus engine's first index is 1
        let mut raft_log_config = config.log.clone();
        raft_log_config.segment.initial_offset = 1;
        let raft_log = Arc::new(Log::new(
            data_dir.join("raft").join("log"),
            raft_log_config,
        )?);

        let stable = Arc::new(StableStore::open(data_dir.join("raft").join("stable"))?);
        let snapshots = Arc::new(SnapshotStore::open(
            data_dir.join("raft").join("snapshots"),
        )?);

        let local_id = node_id_for(&config.raft.node_name);
        stable.set_peer(
            local_id,
            &Peer {
                name: config.raft.node_name.clone(),
                addr: config.raft.advertise_addr.clone(),
            },
        )?;

        let fsm = Fsm::new(log.clone(), stable.clone());
        let store = Arc::new(RaftStore::new(
            local_id,
            raft_log,
            fsm,
            stable.clone(),
            snapshots,
        ));
        let has_state = store
            .has_existing_state()
            .map_err(|e| DistributedError::Raft(e.to_string()))?;

        let network = Arc::new(RaftClient::new(
            stream_layer.clone(),
            stable.clone(),
            config.raft.dial_timeout,
        ));

        let raft_config = async_raft::Config::build("replog".into())
            .heartbeat_interval(config.raft.heartbeat_interval_ms)
            .election_timeout_min(config.raft.election_timeout_min_ms)
            .election_timeout_max(config.raft.election_timeout_max_ms)
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(
                config.raft.snapshot_logs_since_last,
            ))
            .validate()
            .map_err(|e| DistributedError::Raft(e.to_string()))?;

        let raft: RaftHandle = Raft::new(local_id, Arc::new(raft_config), network, store);
        let server_task = tokio::spawn(network::serve(stream_layer, raft.clone()));

        if config.raft.bootstrap && !has_state {
            let mut members = HashSet::new();
            members.insert(local_id);
            match raft.initialize(members).await {
                Ok(()) | Err(InitializeError::NotAllowed) => {}
                Err(e) => return Err(DistributedError::Raft(e.to_string())),
            }
            info!(node = %config.raft.node_name, "bootstrapped single-node cluster");
        }

        Ok(DistributedLog {
            log,
            raft,
            stable,
            local_id,
            server_task,
        })
    }

    /// Proposes an append through consensus and returns the offset the
    /// state machine assigned.
    pub async fn append(&self, record: Record) -> Result<u64, DistributedError> {
        let request = CreateRecordRequest {
            record: Some(record),
        };
        let mut command = vec![APPEND_REQUEST_TYPE];
        request.encode(&mut command)?;

        match self.apply(command).await? {
            ApplyResult::Appended { offset } => Ok(offset),
            ApplyResult::Rejected { message } => Err(DistributedError::Malformed(message)),
            other => Err(DistributedError::Raft(format!(
                "unexpected apply result: {other:?}"
            ))),
        }
    }

    async fn apply(&self, command: Vec<u8>) -> Result<ApplyResult, DistributedError> {
        let write = self
            .raft
            .client_write(ClientWriteRequest::new(CommandBytes(command)));

        let response = tokio::time::timeout(APPLY_TIMEOUT, write)
            .await
            .map_err(|_| DistributedError::Timeout)?
            .map_err(|e| match e {
                ClientWriteError::ForwardToLeader(_, _) => DistributedError::NotLeader,
                other => DistributedError::Raft(other.to_string()),
            })?;

        Ok(response.data)
    }

    /// Reads from the local log; followers may not have caught up yet.
    pub fn read(&self, offset: u64) -> Result<Record, DistributedError> {
        Ok(self.log.read(offset)?)
    }

    pub fn lowest_offset(&self) -> u64 {
        self.log.lowest_offset()
    }

    pub fn highest_offset(&self) -> u64 {
        self.log.highest_offset()
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    fn current_members(&self) -> HashSet<NodeId> {
        self.raft.metrics().borrow().membership_config.members.clone()
    }

    /// Replicates the locally-known peer registry so every member can dial
    /// every other.
    async fn replicate_peer_registry(&self) -> Result<(), DistributedError> {
        for (id, peer) in self.stable.peers()? {
            let registration = PeerRegistration {
                id,
                name: peer.name,
                addr: peer.addr,
            };
            let body = serde_json::to_vec(&registration)
                .map_err(|e| DistributedError::Malformed(e.to_string()))?;
            let mut command = vec![REGISTER_PEER_REQUEST_TYPE];
            command.extend_from_slice(&body);
            self.apply(command).await?;
        }
        Ok(())
    }

    /// Adds a server to the cluster. Idempotent for a server that already
    /// joined with the same id and address; a conflicting entry under
    /// either key is removed first.
    pub async fn join(&self, name: &str, addr: &str) -> Result<(), DistributedError> {
        let id = node_id_for(name);
        let mut members = self.current_members();

        if members.contains(&id) {
            match self.stable.peer(id)? {
                Some(existing) if existing.addr == addr => {
                    debug!(name, addr, "server has already joined");
                    return Ok(());
                }
                _ => {
                    // same id under a different address: drop the stale
                    // server before re-adding it
                    members.remove(&id);
                    self.change_membership(members.clone()).await?;
                }
            }
        }

        for (other, peer) in self.stable.peers()? {
            if other != id && peer.addr == addr {
                if members.remove(&other) {
                    self.change_membership(members.clone()).await?;
                }
                self.stable.remove_peer(other)?;
            }
        }

        self.stable.set_peer(
            id,
            &Peer {
                name: name.to_string(),
                addr: addr.to_string(),
            },
        )?;
        self.replicate_peer_registry().await?;

        self.raft
            .add_non_voter(id)
            .await
            .map_err(map_change_error)?;

        members.insert(id);
        self.change_membership(members).await?;
        info!(name, addr, "server joined");
        Ok(())
    }

    /// Removes a server from the cluster.
    pub async fn leave(&self, name: &str) -> Result<(), DistributedError> {
        let id = node_id_for(name);
        let mut members = self.current_members();

        self.stable.remove_peer(id)?;
        if !members.remove(&id) {
            return Ok(());
        }

        self.change_membership(members).await?;
        info!(name, "server left");
        Ok(())
    }

    async fn change_membership(
        &self,
        members: HashSet<NodeId>,
    ) -> Result<(), DistributedError> {
        self.raft
            .change_membership(members)
            .await
            .map_err(map_change_error)
    }

    /// Blocks until the cluster has a leader or the timeout passes.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<(), DistributedError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut metrics = self.raft.metrics();

        loop {
            if metrics.borrow().current_leader.is_some() {
                return Ok(());
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(DistributedError::Timeout)?;
            match tokio::time::timeout(remaining, metrics.changed()).await {
                Err(_) => return Err(DistributedError::Timeout),
                Ok(Err(e)) => return Err(DistributedError::Raft(e.to_string())),
                Ok(Ok(())) => {}
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.local_id)
    }

    /// Every member of the cluster, with the current leader flagged.
    pub fn get_servers(&self) -> Result<Vec<Server>, DistributedError> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader;

        let mut servers = Vec::new();
        for id in metrics.membership_config.members.iter().copied() {
            let (name, addr) = match self.stable.peer(id)? {
                Some(peer) => (peer.name, peer.addr),
                None => (id.to_string(), String::new()),
            };
            servers.push(Server {
                id: name,
                rpc_addr: addr,
                is_leader: leader == Some(id),
            });
        }
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(servers)
    }

    /// Shuts the consensus engine down and closes the logs.
    pub async fn close(&self) -> Result<(), DistributedError> {
        self.server_task.abort();
        self.raft
            .clone()
            .shutdown()
            .await
            .map_err(|e| DistributedError::Raft(e.to_string()))?;
        self.stable.flush()?;
        self.log.close()?;
        Ok(())
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }
}

fn map_change_error(e: ChangeConfigError) -> DistributedError {
    match e {
        ChangeConfigError::NodeNotLeader(_) => DistributedError::NotLeader,
        other => DistributedError::Raft(other.to_string()),
    }
}

#[async_trait]
impl crate::discovery::Handler for DistributedLog {
    async fn join(&self, name: &str, addr: &str) -> Result<(), DistributedError> {
        DistributedLog::join(self, name, addr).await
    }

    async fn leave(&self, name: &str) -> Result<(), DistributedError> {
        DistributedLog::leave(self, name).await
    }
}
