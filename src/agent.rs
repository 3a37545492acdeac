use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tracing::{error, info};

use crate::auth::Authorizer;
use crate::discovery::Handler;
use crate::distributed::{
    DistributedConfig, DistributedError, DistributedLog, Mux, RaftConfig, StreamLayer,
};
use crate::log::Config as LogConfig;
use crate::server::{GrpcConfig, LogService};

pub struct AgentConfig {
    pub data_dir: PathBuf,
    /// Single address serving both consensus and application RPC; port 0
    /// picks one.
    pub bind_addr: String,
    pub node_name: String,
    pub bootstrap: bool,
    pub log: LogConfig,
    /// Consensus tuning; the identity fields are filled in from the agent
    /// config and the bound address.
    pub raft: RaftConfig,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    /// TLS for every inbound connection on the shared port: the raft lane
    /// wraps after the preamble, the application lane terminates here and
    /// derives each client's subject from its certificate.
    pub server_tls: Option<Arc<ServerConfig>>,
    /// TLS for outbound consensus connections to peers.
    pub peer_tls: Option<Arc<ClientConfig>>,
}

impl AgentConfig {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        bind_addr: impl Into<String>,
        node_name: impl Into<String>,
    ) -> AgentConfig {
        AgentConfig {
            data_dir: data_dir.into(),
            bind_addr: bind_addr.into(),
            node_name: node_name.into(),
            bootstrap: false,
            log: LogConfig::default(),
            raft: RaftConfig::default(),
            authorizer: None,
            server_tls: None,
            peer_tls: None,
        }
    }
}

/// One node of the cluster: the shared-port mux, the distributed log with
/// its consensus engine, and the gRPC server, wired together and torn down
/// in reverse order.
pub struct Agent {
    dlog: Arc<DistributedLog>,
    mux: Mux,
    grpc_task: JoinHandle<()>,
    grpc_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    closed: Mutex<bool>,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> Result<Agent, DistributedError> {
        let (mux, raft_lane, app_incoming) =
            Mux::bind(&config.bind_addr, config.server_tls.clone()).await?;
        let local_addr = mux.local_addr();

        let stream_layer = StreamLayer::new(
            raft_lane,
            local_addr,
            config.server_tls.clone(),
            config.peer_tls.clone(),
        );

        let mut raft = config.raft.clone();
        raft.node_name = config.node_name.clone();
        raft.advertise_addr = local_addr.to_string();
        raft.bootstrap = config.bootstrap;

        let dlog = Arc::new(
            DistributedLog::new(
                &config.data_dir,
                DistributedConfig {
                    log: config.log.clone(),
                    raft,
                },
                stream_layer,
            )
            .await?,
        );

        let service = LogService::new(GrpcConfig {
            commit_log: dlog.clone(),
            authorizer: config.authorizer.clone(),
            server_provider: Some(dlog.clone()),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let grpc_task = tokio::spawn(async move {
            let served = tonic::transport::Server::builder()
                .add_service(service.into_server())
                .serve_with_incoming_shutdown(app_incoming, async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "rpc server stopped");
            }
        });

        info!(node = %config.node_name, addr = %local_addr, "agent started");

        Ok(Agent {
            dlog,
            mux,
            grpc_task,
            grpc_shutdown: Mutex::new(Some(shutdown_tx)),
            closed: Mutex::new(false),
        })
    }

    /// Address clients and peers dial; consensus and RPC share it.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.mux.local_addr()
    }

    pub fn distributed_log(&self) -> &Arc<DistributedLog> {
        &self.dlog
    }

    /// Membership handler for the discovery event source.
    pub fn handler(&self) -> Arc<dyn Handler> {
        self.dlog.clone()
    }

    /// Stops accepting connections, drains the RPC server, and closes the
    /// distributed log. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), DistributedError> {
        {
            let mut closed = self.closed.lock().unwrap();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        self.mux.shutdown();
        if let Some(tx) = self.grpc_shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.dlog.close().await?;
        self.grpc_task.abort();
        Ok(())
    }
}
