use anyhow::{anyhow, bail, Result};
use async_raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use async_raft::{NodeId, RaftNetwork};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::stable::StableStore;
use super::stream::{BoxedConn, StreamError, StreamLayer};
use super::{CommandBytes, RaftHandle};

const RPC_APPEND_ENTRIES: u8 = 1;
const RPC_VOTE: u8 = 2;
const RPC_INSTALL_SNAPSHOT: u8 = 3;

const STATUS_OK: u8 = 0;

/// Outbound raft RPCs, framed as `[tag: u8][len: u32 BE][json body]` over
/// stream-layer connections. One pooled connection per peer, replaced on
/// the first failed round trip.
pub struct RaftClient {
    stream_layer: Arc<StreamLayer>,
    stable: Arc<StableStore>,
    pool: Mutex<HashMap<NodeId, Arc<Mutex<Option<BoxedConn>>>>>,
    dial_timeout: Duration,
}

impl RaftClient {
    pub fn new(
        stream_layer: Arc<StreamLayer>,
        stable: Arc<StableStore>,
        dial_timeout: Duration,
    ) -> RaftClient {
        RaftClient {
            stream_layer,
            stable,
            pool: Mutex::new(HashMap::new()),
            dial_timeout,
        }
    }

    async fn call<Req, Resp>(&self, target: NodeId, tag: u8, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let slot = {
            let mut pool = self.pool.lock().await;
            pool.entry(target).or_default().clone()
        };
        let mut slot = slot.lock().await;

        let body = serde_json::to_vec(request)?;

        if let Some(mut conn) = slot.take() {
            match roundtrip(&mut conn, tag, &body).await {
                Ok(response) => {
                    *slot = Some(conn);
                    return Ok(serde_json::from_slice(&response)?);
                }
                Err(e) => debug!(target, error = %e, "pooled connection failed, redialing"),
            }
        }

        let peer = self
            .stable
            .peer(target)?
            .ok_or_else(|| anyhow!("no known address for node {target}"))?;
        let mut conn = self.stream_layer.dial(&peer.addr, self.dial_timeout).await?;
        let response = roundtrip(&mut conn, tag, &body).await?;
        *slot = Some(conn);
        Ok(serde_json::from_slice(&response)?)
    }
}

async fn roundtrip(conn: &mut BoxedConn, tag: u8, body: &[u8]) -> Result<Vec<u8>> {
    conn.write_u8(tag).await?;
    conn.write_u32(body.len() as u32).await?;
    conn.write_all(body).await?;
    conn.flush().await?;

    let status = conn.read_u8().await?;
    let len = conn.read_u32().await?;
    let mut response = vec![0u8; len as usize];
    conn.read_exact(&mut response).await?;

    if status != STATUS_OK {
        bail!(
            "remote raft error: {}",
            String::from_utf8_lossy(&response)
        );
    }
    Ok(response)
}

#[async_trait]
impl RaftNetwork<CommandBytes> for RaftClient {
    async fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<CommandBytes>,
    ) -> Result<AppendEntriesResponse> {
        self.call(target, RPC_APPEND_ENTRIES, &rpc).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.call(target, RPC_INSTALL_SNAPSHOT, &rpc).await
    }

    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.call(target, RPC_VOTE, &rpc).await
    }
}

/// Serves inbound raft RPCs from the stream layer until it closes.
pub async fn serve(stream_layer: Arc<StreamLayer>, raft: RaftHandle) {
    loop {
        match stream_layer.accept().await {
            Ok(conn) => {
                let raft = raft.clone();
                tokio::spawn(handle_conn(conn, raft));
            }
            Err(StreamError::Closed) => break,
            Err(e) => warn!(error = %e, "raft accept failed"),
        }
    }
}

async fn handle_conn(mut conn: BoxedConn, raft: RaftHandle) {
    loop {
        let tag = match conn.read_u8().await {
            Ok(tag) => tag,
            Err(_) => break,
        };
        let len = match conn.read_u32().await {
            Ok(len) => len,
            Err(_) => break,
        };
        let mut body = vec![0u8; len as usize];
        if conn.read_exact(&mut body).await.is_err() {
            break;
        }

        let (status, payload) = match dispatch(&raft, tag, &body).await {
            Ok(payload) => (STATUS_OK, payload),
            Err(e) => (1, e.to_string().into_bytes()),
        };

        let ok = async {
            conn.write_u8(status).await?;
            conn.write_u32(payload.len() as u32).await?;
            conn.write_all(&payload).await?;
            conn.flush().await
        }
        .await
        .is_ok();
        if !ok {
            break;
        }
    }
}

async fn dispatch(raft: &RaftHandle, tag: u8, body: &[u8]) -> Result<Vec<u8>> {
    match tag {
        RPC_APPEND_ENTRIES => {
            let rpc: AppendEntriesRequest<CommandBytes> = serde_json::from_slice(body)?;
            let response = raft.append_entries(rpc).await?;
            Ok(serde_json::to_vec(&response)?)
        }
        RPC_VOTE => {
            let rpc: VoteRequest = serde_json::from_slice(body)?;
            let response = raft.vote(rpc).await?;
            Ok(serde_json::to_vec(&response)?)
        }
        RPC_INSTALL_SNAPSHOT => {
            let rpc: InstallSnapshotRequest = serde_json::from_slice(body)?;
            let response = raft.install_snapshot(rpc).await?;
            Ok(serde_json::to_vec(&response)?)
        }
        other => bail!("unknown raft rpc tag {other}"),
    }
}
