//! Pluggable RPC plumbing.
//!
//! Two layers share one wire contract. [`Transport`] moves opaque framed
//! bodies between peers (TCP in production, [`memory::MemTransport`] for
//! deterministic tests). [`RaftNetwork`] is the typed interface the node
//! core replicates through; [`NetworkClient`] implements it on top of any
//! transport via the codec in [`crate::wire`].

pub mod memory;
pub mod tcp;

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::error::RaftError;
use crate::error::TransportError;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::wire::MsgType;
use crate::NodeId;

pub use memory::MemHub;
pub use memory::MemTransport;
pub use tcp::TcpTransport;

/// A synchronous request/reply exchange of framed bodies with a peer.
///
/// Implementations may cache one connection per peer and pipeline
/// sequential requests over it, but must drop a cached connection on any
/// I/O error so the next call reconnects. After `close`, every `send`
/// fails with [`TransportError::Closed`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        target: NodeId,
        msg: MsgType,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError>;

    /// Start serving incoming frames, dispatching each to `handler` and
    /// writing the returned bytes back as the reply, in order per
    /// connection.
    async fn listen(&self, addr: &str, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError>;

    /// Tear down the listener and all cached connections.
    async fn close(&self);
}

/// The server side of the transport: one incoming framed message in, one
/// reply body out.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, msg: MsgType, body: &[u8]) -> Result<Vec<u8>, RaftError>;
}

/// The typed RPC interface used for replication and elections.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse>;

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse>;

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse>;
}

/// [`RaftNetwork`] over any [`Transport`], speaking the fixed wire layout.
pub struct NetworkClient<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> NetworkClient<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

#[async_trait]
impl<T: Transport> RaftNetwork for NetworkClient<T> {
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let reply = self.transport.send(target, MsgType::AppendEntries, rpc.encode()).await?;
        AppendEntriesResponse::decode(&reply).map_err(|e| anyhow!(e))
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse> {
        let reply = self.transport.send(target, MsgType::RequestVote, rpc.encode()).await?;
        VoteResponse::decode(&reply).map_err(|e| anyhow!(e))
    }

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse> {
        let reply = self.transport.send(target, MsgType::InstallSnapshot, rpc.encode()).await?;
        InstallSnapshotResponse::decode(&reply).map_err(|e| anyhow!(e))
    }
}
