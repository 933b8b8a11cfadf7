//! Per-peer replication streams.
//!
//! The leader spawns one task per peer. Each task owns that peer's
//! `nextIndex`, paces itself on the heartbeat interval, reads entry batches
//! straight from the shared log store, and reports match-index progress (or
//! a newer term) back to the core. When the peer has fallen behind the
//! snapshot boundary the task ships the whole snapshot instead.

use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::InstallSnapshotRequest;
use crate::storage::RaftStore;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<(RaftEvent, Span)>,
}

impl ReplicationStream {
    /// Create a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<N: RaftNetwork>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        store: Arc<RaftStore>,
        raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    ) -> Self {
        ReplicationCore::spawn(
            id,
            target,
            term,
            config,
            last_log,
            commit_index,
            network,
            store,
            raft_core_tx,
        )
    }
}

/// An event from the Raft core to a replication stream.
pub(crate) enum RaftEvent {
    /// A new entry has been appended and needs replication.
    Replicate { last_log_index: u64, commit_index: u64 },
    /// The commit index advanced; propagate it on the next send.
    UpdateCommitIndex { commit_index: u64 },
    /// Leadership ended; shut the stream down.
    Terminate,
}

/// An event from a replication stream back to the Raft core.
pub(crate) enum ReplicaEvent {
    /// The target confirmed its log up to `matched`.
    UpdateMatchIndex { target: NodeId, matched: LogId },
    /// The target answered with a newer term; the leader must step down.
    RevertToFollower { target: NodeId, term: u64 },
    /// A non-recoverable local error; the node must stop.
    Shutdown,
}

impl MessageSummary for ReplicaEvent {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                format!("UpdateMatchIndex: target={}, matched={}", target, matched)
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                format!("RevertToFollower: target={}, term={}", target, term)
            }
            ReplicaEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}

/// The state of one replication stream.
#[derive(Eq, PartialEq)]
enum TargetReplState {
    /// Shipping log entries (or heartbeats) to the target.
    Replicating,
    /// The target is behind the snapshot boundary; ship the snapshot.
    Snapshotting,
    Shutdown,
}

/// A task replicating the leader's log to one target follower.
struct ReplicationCore<N: RaftNetwork> {
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target follower.
    target: NodeId,
    /// The term of this leadership episode; it never changes here.
    term: u64,

    network: Arc<N>,
    store: Arc<RaftStore>,
    config: Arc<Config>,

    raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    repl_rx: mpsc::UnboundedReceiver<(RaftEvent, Span)>,

    target_state: TargetReplState,

    /// The index of the most recent entry appended by the leader.
    last_log_index: u64,
    /// The leader's commit index, as last told to us.
    commit_index: u64,
    /// The index of the next log entry to send.
    next_index: u64,
    /// The most recent log id known replicated on the target.
    matched: LogId,

    heartbeat: Interval,
    rpc_timeout: Duration,
    install_snapshot_timeout: Duration,
    max_payload_entries: usize,
}

impl<N: RaftNetwork> ReplicationCore<N> {
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        store: Arc<RaftStore>,
        raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    ) -> ReplicationStream {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_interval = config.heartbeat_interval;
        let rpc_timeout = config.rpc_timeout;
        let install_snapshot_timeout = config.install_snapshot_timeout;
        let max_payload_entries = config.max_payload_entries as usize;
        let this = Self {
            id,
            target,
            term,
            network,
            store,
            config,
            raft_core_tx,
            repl_rx,
            target_state: TargetReplState::Replicating,
            last_log_index: last_log.index,
            commit_index,
            next_index: last_log.index + 1,
            matched: LogId::default(),
            heartbeat: interval(heartbeat_interval),
            rpc_timeout,
            install_snapshot_timeout,
            max_payload_entries,
        };
        let _handle = tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));
        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, peer = self.target))]
    async fn main(mut self) {
        // An initial heartbeat announces the new leader without waiting a
        // full tick.
        self.send_append_entries().await;

        loop {
            match self.target_state {
                TargetReplState::Replicating => self.replicate_loop().await,
                TargetReplState::Snapshotting => self.snapshot_loop().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(state = "replicating"))]
    async fn replicate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::Replicating {
                return;
            }
            tokio::select! {
                _ = self.heartbeat.tick() => {
                    // Drain the backlog batch by batch while the target
                    // keeps acknowledging; a failure waits out a tick.
                    while self.send_append_entries().await
                        && self.next_index <= self.last_log_index
                        && self.target_state == TargetReplState::Replicating {}
                }
                event = self.repl_rx.recv() => match event {
                    Some((event, span)) => {
                        self.drain_raft_rx(event, span);
                        if self.target_state == TargetReplState::Replicating
                            && self.next_index <= self.last_log_index
                        {
                            self.send_append_entries().await;
                        }
                    }
                    None => self.target_state = TargetReplState::Shutdown,
                },
            }
        }
    }

    /// Send one AppendEntries payload. Returns `true` when the target
    /// acknowledged it.
    async fn send_append_entries(&mut self) -> bool {
        let snapshot_last = self.store.snapshot_last();
        if self.next_index <= snapshot_last.index {
            self.target_state = TargetReplState::Snapshotting;
            return false;
        }
        let prev_log_index = self.next_index - 1;
        let prev_log_term = match self.store.term_at(prev_log_index) {
            Some(term) => term,
            None => {
                // The prev entry has been compacted away since we computed
                // next_index.
                self.target_state = TargetReplState::Snapshotting;
                return false;
            }
        };
        let entries = self.store.entries_from(self.next_index, self.max_payload_entries);
        let sent = entries.len() as u64;
        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };

        let res = match timeout(
            self.rpc_timeout,
            self.network.send_append_entries(self.target, rpc),
        )
        .await
        {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(peer = self.target, error=%err, "error sending AppendEntries RPC");
                return false;
            }
            Err(_) => {
                tracing::warn!(peer = self.target, "timeout sending AppendEntries RPC");
                return false;
            }
        };

        if res.success {
            let matched_index = prev_log_index + sent;
            self.next_index = matched_index + 1;
            if matched_index != self.matched.index {
                self.matched = LogId {
                    term: self.store.term_at(matched_index).unwrap_or(0),
                    index: matched_index,
                };
                let _ = self.raft_core_tx.send((
                    ReplicaEvent::UpdateMatchIndex { target: self.target, matched: self.matched },
                    tracing::debug_span!("CH"),
                ));
            }
            return true;
        }

        // A newer term ends this leadership episode.
        if res.term > self.term {
            tracing::debug!(peer = self.target, term = res.term, "append entries rejected, newer term");
            let _ = self.raft_core_tx.send((
                ReplicaEvent::RevertToFollower { target: self.target, term: res.term },
                tracing::debug_span!("CH"),
            ));
            self.target_state = TargetReplState::Shutdown;
            return false;
        }

        // Log mismatch; jump back using the conflict hint. When we still
        // hold entries of the conflicting term, resume right after our last
        // one; otherwise take the follower's first index of that term.
        let mut next = if res.conflict_index > 0 {
            res.conflict_index
        } else {
            self.next_index.saturating_sub(1)
        };
        if res.conflict_term != 0 {
            if let Some(last_of_term) = self.store.last_index_of_term(res.conflict_term) {
                next = last_of_term + 1;
            }
        }
        self.next_index = next.max(1);
        if self.matched.index >= self.next_index {
            // Whatever we thought was matched is no longer trustworthy.
            self.matched = LogId::default();
        }
        tracing::debug!(
            peer = self.target,
            next_index = self.next_index,
            "append entries rejected, adjusted next index"
        );
        false
    }

    #[tracing::instrument(level = "debug", skip(self), fields(state = "snapshotting"))]
    async fn snapshot_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::Snapshotting {
                return;
            }
            let snapshot = match self.store.load_snapshot() {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => {
                    // Nothing to install; resume from the head of the log.
                    self.next_index = self.store.snapshot_last().index + 1;
                    self.target_state = TargetReplState::Replicating;
                    return;
                }
                Err(err) => {
                    tracing::error!(error=%err, "error loading snapshot for replication");
                    let _ = self
                        .raft_core_tx
                        .send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            };
            let last_included = snapshot.last_included;
            let rpc = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                last_included_index: last_included.index,
                last_included_term: last_included.term,
                data: snapshot.data,
            };
            tracing::info!(peer = self.target, snapshot = %last_included, "sending snapshot");

            let res = match timeout(
                self.install_snapshot_timeout,
                self.network.send_install_snapshot(self.target, rpc),
            )
            .await
            {
                Ok(Ok(res)) => res,
                Ok(Err(err)) => {
                    tracing::warn!(peer = self.target, error=%err, "error sending InstallSnapshot RPC");
                    self.wait_for_tick().await;
                    continue;
                }
                Err(_) => {
                    tracing::warn!(peer = self.target, "timeout sending InstallSnapshot RPC");
                    self.wait_for_tick().await;
                    continue;
                }
            };

            if res.term > self.term {
                let _ = self.raft_core_tx.send((
                    ReplicaEvent::RevertToFollower { target: self.target, term: res.term },
                    tracing::debug_span!("CH"),
                ));
                self.target_state = TargetReplState::Shutdown;
                return;
            }

            self.next_index = last_included.index + 1;
            self.matched = last_included;
            let _ = self.raft_core_tx.send((
                ReplicaEvent::UpdateMatchIndex { target: self.target, matched: self.matched },
                tracing::debug_span!("CH"),
            ));
            self.target_state = TargetReplState::Replicating;
            return;
        }
    }

    /// Wait for the next heartbeat tick, staying responsive to core
    /// events.
    async fn wait_for_tick(&mut self) {
        tokio::select! {
            _ = self.heartbeat.tick() => {}
            event = self.repl_rx.recv() => match event {
                Some((event, span)) => self.drain_raft_rx(event, span),
                None => self.target_state = TargetReplState::Shutdown,
            },
        }
    }

    /// Fully drain the channel coming in from the Raft core.
    fn drain_raft_rx(&mut self, first: RaftEvent, span: Span) {
        let mut event_opt = Some((first, span));
        let mut iters = 0u64;
        loop {
            // Don't get stuck draining a really hot feed.
            if iters > self.config.max_payload_entries {
                return;
            }
            let (event, span) = match event_opt.take() {
                Some(event) => event,
                None => return,
            };
            let _ent = span.enter();

            match event {
                RaftEvent::Replicate { last_log_index, commit_index } => {
                    self.last_log_index = last_log_index;
                    self.commit_index = commit_index;
                }
                RaftEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }
                RaftEvent::Terminate => {
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            }

            if let Some(event_span) = self.repl_rx.recv().now_or_never() {
                event_opt = event_span;
            }
            iters += 1;
        }
    }
}
