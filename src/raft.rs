//! Public Raft interface and RPC data types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::command::Command;
use crate::config::Config;
use crate::core::RaftCore;
use crate::entry::LogEntry;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::network::RaftNetwork;
use crate::network::RpcHandler;
use crate::sm::StateMachine;
use crate::storage::RaftStore;
use crate::wire::MsgType;
use crate::MessageSummary;
use crate::NodeId;

struct RaftInner<N: RaftNetwork, M: StateMachine> {
    tx_api: mpsc::UnboundedSender<(RaftMsg, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_m: std::marker::PhantomData<M>,
}

/// A running Raft node.
///
/// This is a cheaply cloneable handle to the node's actor task. RPCs
/// received from peers, client proposals and shutdown all flow through it;
/// the task owns every piece of mutable Raft state and serializes all of
/// them.
pub struct Raft<N: RaftNetwork, M: StateMachine> {
    inner: Arc<RaftInner<N, M>>,
}

impl<N: RaftNetwork, M: StateMachine> Raft<N, M> {
    /// Create and spawn a new Raft node task.
    ///
    /// `store` must already be open on this node's data dir; `network` is
    /// how this node reaches its peers; `state_machine` receives committed
    /// commands.
    #[tracing::instrument(level = "debug", skip_all, fields(id = config.node_id))]
    pub fn new(
        config: Arc<Config>,
        network: Arc<N>,
        store: Arc<RaftStore>,
        state_machine: Arc<M>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(config.node_id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle =
            RaftCore::spawn(config, network, store, state_machine, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_m: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this node, as a peer's leader would.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn append_entries(
        &self,
        rpc: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::AppendEntries { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a RequestVote RPC to this node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::RequestVote { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit an InstallSnapshot RPC to this node.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn install_snapshot(
        &self,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::InstallSnapshot { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Propose a command.
    ///
    /// Fails fast with `NotLeader` on a non-leader. On the leader this
    /// appends a log entry and resolves once that entry is committed and
    /// applied locally, returning its log index; state-machine rejections
    /// surface as [`ClientWriteError::Apply`].
    #[tracing::instrument(level = "debug", skip(self, cmd))]
    pub async fn propose(&self, cmd: Command) -> Result<u64, ClientWriteError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClientWrite { cmd, tx }, span))
            .map_err(|_| ClientWriteError::Raft(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| ClientWriteError::Raft(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// The cluster leader this node currently observes, if any.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.rx_metrics.borrow().current_leader
    }

    /// A handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// A handle for awaiting metric conditions.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or(Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut this node down and wait for its task to finish. Outstanding
    /// proposals are released with a shutdown error. A second call is a
    /// no-op.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<N: RaftNetwork, M: StateMachine> Clone for Raft<N, M> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

/// The node's listener side: decode an incoming frame, run the matching
/// handler, encode the reply.
#[async_trait]
impl<N: RaftNetwork, M: StateMachine> RpcHandler for Raft<N, M> {
    async fn handle(&self, msg: MsgType, body: &[u8]) -> Result<Vec<u8>, RaftError> {
        match msg {
            MsgType::AppendEntries => {
                let rpc = AppendEntriesRequest::decode(body)
                    .map_err(|e| RaftError::Network(e.into()))?;
                Ok(self.append_entries(rpc).await?.encode())
            }
            MsgType::RequestVote => {
                let rpc =
                    VoteRequest::decode(body).map_err(|e| RaftError::Network(e.into()))?;
                Ok(self.vote(rpc).await?.encode())
            }
            MsgType::InstallSnapshot => {
                let rpc = InstallSnapshotRequest::decode(body)
                    .map_err(|e| RaftError::Network(e.into()))?;
                Ok(self.install_snapshot(rpc).await?.encode())
            }
            other => Err(RaftError::Network(anyhow::anyhow!(
                "unexpected request message type {:?}",
                other
            ))),
        }
    }
}

pub(crate) type ClientWriteResponseTx = oneshot::Sender<Result<u64, ClientWriteError>>;

/// A message coming into the core task from the Raft API.
pub(crate) enum RaftMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse, RaftError>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<Result<InstallSnapshotResponse, RaftError>>,
    },
    ClientWrite {
        cmd: Command,
        tx: ClientWriteResponseTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the leader to replicate log entries, and as a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID, so followers can redirect clients.
    pub leader_id: NodeId,
    /// Index of the log entry immediately preceding the new ones; 0 when
    /// the entries start at the head of the log.
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    /// May be empty for heartbeats.
    pub entries: Vec<LogEntry>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev={}-{}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
///
/// On rejection the conflict fields let the leader jump `nextIndex` back in
/// one step instead of probing entry by entry: `conflict_term` is the
/// follower's term at `prevLogIndex` (0 when the follower's log is simply
/// too short) and `conflict_index` the first index holding that term (or
/// one past the follower's last entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub conflict_term: u64,
    pub conflict_index: u64,
}

/// An RPC sent by candidates to gather votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// The response to a `VoteRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// An RPC carrying a complete snapshot to a follower that is too far behind
/// for log replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    /// The snapshot replaces all entries up to and including this index.
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// The serialized state machine.
    pub data: Vec<u8>,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, last_included={}-{}, len={}",
            self.term,
            self.leader_id,
            self.last_included_term,
            self.last_included_index,
            self.data.len()
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}
