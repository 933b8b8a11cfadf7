//! The core logic of a Raft node.

mod append_entries;
mod client;
mod install_snapshot;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::command::Command;
use crate::config::Config;
use crate::core::client::Proposal;
use crate::entry::EntryKind;
use crate::error::ApplyError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::network::RaftNetwork;
use crate::raft::ClientWriteResponseTx;
use crate::raft::RaftMsg;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::sm::StateMachine;
use crate::storage::HardState;
use crate::storage::RaftStore;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// The core type implementing the Raft protocol.
///
/// One task owns this value for the node's whole lifetime; every mutation
/// of term, vote, role, commit index and apply progress happens inside it,
/// and term/vote changes are persisted before any reply that depends on
/// them is sent.
pub struct RaftCore<N: RaftNetwork, M: StateMachine> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The IDs of every other cluster member. The peer set is static.
    peers: Vec<NodeId>,
    network: Arc<N>,
    store: Arc<RaftStore>,
    state_machine: Arc<M>,

    /// The target state of the system.
    target_state: State,

    /// The index of the highest log entry known to be committed
    /// cluster-wide. Never persisted; re-learned from the leader (or from
    /// our own majority accounting) after a restart.
    commit_index: u64,
    /// The index of the highest log entry applied to the state machine.
    last_applied: u64,

    /// The current term. Increases monotonically.
    current_term: u64,
    /// The ID of the current cluster leader, if known.
    current_leader: Option<NodeId>,
    /// The candidate this node voted for in `current_term`.
    voted_for: Option<NodeId>,

    /// The id of the last entry appended to the log.
    last_log_id: LogId,
    /// The log id covered by the latest snapshot.
    snapshot_last_log_id: LogId,

    /// The instant at which the current election timeout expires.
    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: RaftNetwork, M: StateMachine> RaftCore<N, M> {
    pub(crate) fn spawn(
        config: Arc<Config>,
        network: Arc<N>,
        store: Arc<RaftStore>,
        state_machine: Arc<M>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let this = Self {
            id: config.node_id,
            peers: config.remote_peers(),
            config,
            network,
            store,
            state_machine,
            target_state: State::Follower,
            commit_index: 0,
            last_applied: 0,
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            snapshot_last_log_id: LogId::default(),
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let state = self.store.initial_state();
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.last_log_id = state.last_log_id;
        self.last_applied = state.last_applied;
        self.snapshot_last_log_id =
            state.snapshot.map(|meta| meta.last_included).unwrap_or_default();

        // A fresh or wiped node whose data dir still carries a snapshot
        // (or one just seeded by InstallSnapshot) rebuilds the state
        // machine from it. The engine is otherwise kept intact:
        // `last_applied` alone prevents double-apply on replay.
        if self.last_applied < self.snapshot_last_log_id.index {
            let snapshot = self
                .store
                .load_snapshot()
                .map_err(|err| self.map_fatal_storage_error(err))?;
            if let Some(snapshot) = snapshot {
                tracing::info!(snapshot=%snapshot.last_included, "restoring state machine from snapshot");
                self.state_machine
                    .restore(&snapshot.data)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(anyhow!(err)))?;
                self.store
                    .save_last_applied(snapshot.last_included.index)
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                self.last_applied = snapshot.last_included.index;
            }
        }

        // Committed-but-unapplied entries are replayed once commitment is
        // re-established; starting at `last_applied` keeps the
        // `lastApplied <= commitIndex` invariant from the first report.
        self.commit_index = self.last_applied;

        self.next_election_timeout =
            Some(Instant::now() + self.config.new_rand_election_timeout());
        self.report_metrics();

        tracing::debug!(id = self.id, term = self.current_term, last_log = %self.last_log_id, "node initialized");

        // The core assumes one of three roles; each role's controller runs
        // until a state change is required.
        loop {
            match self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!(id = self.id, "node has shut down");
                    return Ok(());
                }
            }
        }
    }

    /// Publish the current state of the node on the metrics channel.
    fn report_metrics(&self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
            snapshot: self.snapshot_last_log_id,
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id = self.id, "error reporting metrics");
        }
    }

    /// Save term and vote to disk; must complete before any dependent reply.
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState { current_term: self.current_term, voted_for: self.voted_for };
        let res = self.store.save_hard_state(&hs);
        res.map_err(|err| self.map_fatal_storage_error(err))
    }

    fn set_target_state(&mut self, target_state: State) {
        if self.target_state != State::Shutdown {
            self.target_state = target_state;
        }
    }

    /// The next election deadline, generating a fresh one if unset.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let inst = Instant::now() + self.config.new_rand_election_timeout();
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    fn update_next_election_timeout(&mut self) {
        self.next_election_timeout =
            Some(Instant::now() + self.config.new_rand_election_timeout());
    }

    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => self.current_leader = Some(self.id),
            UpdateCurrentLeader::OtherNode(target) => self.current_leader = Some(target),
            UpdateCurrentLeader::Unknown => self.current_leader = None,
        }
    }

    /// Raise the current term, resetting the vote alongside it.
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// A storage error here is non-recoverable; instruct the node to stop.
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(error=?err, id = self.id, "fatal storage error, shutting down");
        self.target_state = State::Shutdown;
        RaftError::Storage(err)
    }

    /// Reject a client write on a node that is not the leader.
    fn reject_client_write(&self, tx: ClientWriteResponseTx) {
        let _ = tx.send(Err(ClientWriteError::NotLeader { leader_id: self.current_leader }));
    }

    /// Apply every committed-but-unapplied entry, in order, persisting
    /// `last_applied` after each one. Returns the per-index apply outcomes
    /// so the leader can release pending proposals; application-level
    /// rejections are recorded but never stop the loop.
    async fn replicate_to_state_machine_if_needed(
        &mut self,
    ) -> RaftResult<Vec<(u64, Result<(), ApplyError>)>> {
        let mut results = Vec::new();
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = match self.store.entry(index) {
                Some(entry) => entry,
                None => {
                    return Err(self.map_fatal_storage_error(anyhow!(
                        "committed entry {} missing from log",
                        index
                    )))
                }
            };
            let res = match entry.kind {
                EntryKind::Command => match Command::decode(&entry.payload) {
                    Ok(cmd) => self.state_machine.apply(cmd).await,
                    Err(err) => Err(ApplyError::Codec(err.to_string())),
                },
                EntryKind::Noop | EntryKind::Config => Ok(()),
            };
            if let Err(ref err) = res {
                tracing::warn!(index, error=%err, "state machine rejected committed command");
            }
            self.store
                .save_last_applied(index)
                .map_err(|err| self.map_fatal_storage_error(err))?;
            self.last_applied = index;
            results.push((index, res));
        }
        if !results.is_empty() {
            self.report_metrics();
            self.trigger_log_compaction_if_needed().await;
        }
        Ok(results)
    }

    /// Take a snapshot once the log has outgrown the configured threshold.
    ///
    /// The snapshot covers exactly the applied prefix; the log is then
    /// prefix-truncated at its boundary. Failures are logged and retried on
    /// a later apply.
    async fn trigger_log_compaction_if_needed(&mut self) {
        let threshold = self.config.snapshot_interval;
        if threshold == 0 {
            return;
        }
        if self.store.log_len() <= threshold {
            return;
        }
        if self.last_applied <= self.snapshot_last_log_id.index {
            return;
        }
        let term = match self.store.term_at(self.last_applied) {
            Some(term) => term,
            None => return,
        };
        let data = match self.state_machine.snapshot().await {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(error=%err, "error serializing state machine for snapshot");
                return;
            }
        };
        let last = LogId { term, index: self.last_applied };
        if let Err(err) = self.store.save_snapshot(last, &data) {
            tracing::error!(error=%err, "error saving snapshot");
            return;
        }
        self.snapshot_last_log_id = last;
        tracing::info!(snapshot=%last, log_len = self.store.log_len(), "snapshot saved, log compacted");
        self.report_metrics();
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// The node is replicating logs from the leader.
    #[display(fmt = "follower")]
    Follower,
    /// The node is campaigning to become the cluster leader.
    #[display(fmt = "candidate")]
    Candidate,
    /// The node is the cluster leader.
    #[display(fmt = "leader")]
    Leader,
    /// The node is shutting down.
    #[display(fmt = "shutdown")]
    Shutdown,
}

impl State {
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
///
/// `nextIndex` lives inside each replication stream; `matchIndex` is
/// mirrored here from stream reports for commit accounting. Both exist only
/// for the duration of a single leadership episode.
struct LeaderState<'a, N: RaftNetwork, M: StateMachine> {
    core: &'a mut RaftCore<N, M>,
    /// Replication state per peer.
    nodes: BTreeMap<NodeId, ReplicationState>,
    /// Proposals appended locally, awaiting commit + apply, in index order.
    awaiting_committed: Vec<Proposal>,
    /// The stream of events coming from replication tasks.
    replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent, Span)>,
    /// The cloneable sender for replication task events.
    replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
}

/// Core-side view of one replication stream.
struct ReplicationState {
    matched: LogId,
    replstream: ReplicationStream,
}

impl<'a, N: RaftNetwork, M: StateMachine> LeaderState<'a, N, M> {
    pub(self) fn new(core: &'a mut RaftCore<N, M>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            awaiting_committed: Vec::new(),
            replication_rx,
            replication_tx,
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_state = "leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        for target in self.core.peers.clone() {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.core.report_metrics();

        // Establish the new term with a noop entry before accepting
        // proposals.
        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!(id = self.core.id, state = %self.core.target_state, "leader is stepping down");
                for node in self.nodes.values() {
                    let _ = node
                        .replstream
                        .repl_tx
                        .send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                }
                self.release_pending_proposals();
                return Ok(());
            }

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::ClientWrite { cmd, tx } => {
                            self.handle_client_write_request(cmd, tx).await?;
                        }
                    }
                }
                Some((event, span)) = self.replication_rx.recv() => {
                    let _ent = span.enter();
                    tracing::debug!(event = %event.summary(), "leader recv replica event");
                    self.handle_replica_event(event).await?;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    tracing::info!(id = self.core.id, "leader recv shutdown signal");
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.store.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState { matched: LogId::default(), replstream }
    }

    /// Release every outstanding proposal when leadership ends.
    fn release_pending_proposals(&mut self) {
        let shutting_down = self.core.target_state == State::Shutdown;
        for proposal in self.awaiting_committed.drain(..) {
            let err = if shutting_down {
                ClientWriteError::Raft(RaftError::ShuttingDown)
            } else {
                ClientWriteError::NotLeader { leader_id: self.core.current_leader }
            };
            let _ = proposal.tx.send(Err(err));
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
struct CandidateState<'a, N: RaftNetwork, M: StateMachine> {
    core: &'a mut RaftCore<N, M>,
    /// Votes granted so far, including our own.
    votes_granted: usize,
    /// Votes needed to win the election.
    votes_needed: usize,
}

impl<'a, N: RaftNetwork, M: StateMachine> CandidateState<'a, N, M> {
    pub(self) fn new(core: &'a mut RaftCore<N, M>) -> Self {
        Self { core, votes_granted: 0, votes_needed: 0 }
    }

    /// Run the candidate loop. Each iteration of the outer loop represents
    /// a new term.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_state = "candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // A single-node cluster elects itself without any RPCs.
            if self.core.peers.is_empty() {
                self.core.current_term += 1;
                self.core.voted_for = Some(self.core.id);
                self.core.save_hard_state().await?;
                self.core.set_target_state(State::Leader);
                return Ok(());
            }

            self.votes_granted = 1; // We vote for ourselves.
            self.votes_needed = crate::quorum::majority_of(self.core.peers.len() + 1);

            // Setup the new term.
            self.core.update_next_election_timeout();
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.report_metrics();
            tracing::info!(id = self.core.id, term = self.core.current_term, "campaigning");

            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this term.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    // The election timed out; break to the outer loop,
                    // which starts a new term.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => {
                        self.handle_vote_response(res, peer).await?;
                    }
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        match msg {
                            RaftMsg::AppendEntries { rpc, tx } => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote { rpc, tx } => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::InstallSnapshot { rpc, tx } => {
                                let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                            }
                            RaftMsg::ClientWrite { tx, .. } => {
                                self.core.reject_client_write(tx);
                            }
                        }
                    }
                    Ok(_) = &mut self.core.rx_shutdown => {
                        self.core.set_target_state(State::Shutdown);
                    }
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
struct FollowerState<'a, N: RaftNetwork, M: StateMachine> {
    core: &'a mut RaftCore<N, M>,
}

impl<'a, N: RaftNetwork, M: StateMachine> FollowerState<'a, N, M> {
    pub(self) fn new(core: &'a mut RaftCore<N, M>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_state = "follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            // The deadline moves as heartbeats arrive.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                _ = election_timeout => {
                    tracing::info!(id = self.core.id, term = self.core.current_term, "election timeout, becoming candidate");
                    self.core.set_target_state(State::Candidate);
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::ClientWrite { tx, .. } => {
                            self.core.reject_client_write(tx);
                        }
                    }
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }
}
