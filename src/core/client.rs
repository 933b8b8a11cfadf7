//! Leader-side proposal handling: append, replicate, commit, apply,
//! release.

use std::collections::BTreeMap;

use crate::command::Command;
use crate::core::LeaderState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::entry::EntryKind;
use crate::entry::LogEntry;
use crate::error::ApplyError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::quorum;
use crate::raft::ClientWriteResponseTx;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::sm::StateMachine;

/// A proposal appended to the leader's log, awaiting commit and apply.
pub(super) struct Proposal {
    pub index: u64,
    pub tx: ClientWriteResponseTx,
}

impl<'a, N: RaftNetwork, M: StateMachine> LeaderState<'a, N, M> {
    /// Append the term-establishing noop entry new leaders are obligated to
    /// create, and start replicating it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let entry = self.append_payload_to_log(EntryKind::Noop, Vec::new())?;
        self.replicate_entry(&entry).await
    }

    /// Handle a client write request.
    #[tracing::instrument(level = "debug", skip(self, cmd, tx))]
    pub(super) async fn handle_client_write_request(
        &mut self,
        cmd: Command,
        tx: ClientWriteResponseTx,
    ) -> RaftResult<()> {
        let entry = match self.append_payload_to_log(EntryKind::Command, cmd.encode()) {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::Raft(RaftError::ShuttingDown)));
                return Err(err);
            }
        };
        self.awaiting_committed.push(Proposal { index: entry.index, tx });
        self.replicate_entry(&entry).await
    }

    /// Assign the next index and the current term, append to the local
    /// log durably.
    pub(super) fn append_payload_to_log(
        &mut self,
        kind: EntryKind,
        payload: Vec<u8>,
    ) -> RaftResult<LogEntry> {
        let entry = LogEntry::new(
            self.core.last_log_id.index + 1,
            self.core.current_term,
            kind,
            payload,
        );
        self.core
            .store
            .append(std::slice::from_ref(&entry))
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = entry.log_id();
        self.core.report_metrics();
        Ok(entry)
    }

    /// Kick replication for a freshly appended entry. A cluster of one
    /// commits immediately.
    pub(super) async fn replicate_entry(&mut self, entry: &LogEntry) -> RaftResult<()> {
        if self.nodes.is_empty() {
            self.core.commit_index = entry.index;
            self.core.report_metrics();
            self.commit_and_apply().await?;
            return Ok(());
        }
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::Replicate {
                    last_log_index: entry.index,
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }
        Ok(())
    }

    /// Process one event reported by a replication stream.
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) -> RaftResult<()> {
        match event {
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                if let Some(state) = self.nodes.get_mut(&target) {
                    state.matched = matched;
                }
                if self.recalc_commit_index() {
                    for node in self.nodes.values() {
                        let _ = node.replstream.repl_tx.send((
                            RaftEvent::UpdateCommitIndex {
                                commit_index: self.core.commit_index,
                            },
                            tracing::debug_span!("CH"),
                        ));
                    }
                    self.core.report_metrics();
                    self.commit_and_apply().await?;
                }
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                if term > self.core.current_term {
                    tracing::info!(
                        { peer = target, term },
                        "newer term observed during replication, stepping down"
                    );
                    self.core.update_current_term(term, None);
                    self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.core.set_target_state(State::Follower);
                    self.core.save_hard_state().await?;
                }
            }
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
            }
        }
        Ok(())
    }

    /// Recompute the commit index from match indexes.
    ///
    /// Only entries of the current term commit by counting; earlier-term
    /// entries ride along underneath (terms are non-decreasing, so one
    /// check at the quorum index suffices).
    fn recalc_commit_index(&mut self) -> bool {
        let mut indexes: Vec<u64> = self.nodes.values().map(|n| n.matched.index).collect();
        indexes.push(self.core.last_log_id.index);
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = quorum::majority_of(indexes.len());
        let candidate = indexes[quorum - 1];
        if candidate <= self.core.commit_index {
            return false;
        }
        match self.core.store.term_at(candidate) {
            Some(term) if term == self.core.current_term => {
                tracing::debug!(commit_index = candidate, "commit index advanced");
                self.core.commit_index = candidate;
                true
            }
            _ => false,
        }
    }

    /// Apply newly committed entries and release their waiting proposals
    /// with the apply outcome.
    pub(super) async fn commit_and_apply(&mut self) -> RaftResult<()> {
        let results = self.core.replicate_to_state_machine_if_needed().await?;
        if self.awaiting_committed.is_empty() {
            return Ok(());
        }
        let mut outcomes: BTreeMap<u64, Result<(), ApplyError>> = results.into_iter().collect();
        while let Some(first) = self.awaiting_committed.first() {
            if first.index > self.core.last_applied {
                break;
            }
            let proposal = self.awaiting_committed.remove(0);
            let res = outcomes
                .remove(&proposal.index)
                .unwrap_or(Ok(()))
                .map(|_| proposal.index)
                .map_err(ClientWriteError::Apply);
            let _ = proposal.tx.send(res);
        }
        Ok(())
    }
}
