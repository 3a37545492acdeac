//! Replicated append-only commit log.
//!
//! Records live in a segmented on-disk log (`log`); a Raft consensus layer
//! (`distributed`) replicates it across a cluster, multiplexing consensus
//! and application RPC over one port (`distributed::StreamLayer`); `agent`
//! wires a full node together behind the gRPC surface in `server`.

pub mod agent;
pub mod api;
pub mod auth;
pub mod discovery;
pub mod distributed;
pub mod log;
pub mod server;
