//! Follower-side InstallSnapshot handling.

use anyhow::anyhow;

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::sm::StateMachine;
use crate::LogId;
use crate::MessageSummary;

impl<N: RaftNetwork, M: StateMachine> RaftCore<N, M> {
    /// Handle an incoming InstallSnapshot RPC.
    ///
    /// The snapshot arrives whole. Installing it replaces the state
    /// machine, jumps `commitIndex` and `lastApplied` to the snapshot
    /// boundary — the only path by which `lastApplied` moves
    /// non-incrementally — and drops every log entry the snapshot covers.
    /// A snapshot at or below our commit index is acknowledged without
    /// touching state.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req = %req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }

        self.update_next_election_timeout();

        let mut report_metrics = false;
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
            report_metrics = true;
        }

        if req.last_included_index <= self.commit_index {
            tracing::debug!(
                last_included = req.last_included_index,
                commit_index = self.commit_index,
                "snapshot is behind our commit index, acknowledging without install"
            );
            if report_metrics {
                self.report_metrics();
            }
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }

        let last = LogId { term: req.last_included_term, index: req.last_included_index };
        tracing::info!(snapshot = %last, bytes = req.data.len(), "installing snapshot from leader");

        // Restore failures are not deterministic application rejections;
        // continuing with a half-written state machine is unsafe.
        self.state_machine
            .restore(&req.data)
            .await
            .map_err(|err| self.map_fatal_storage_error(anyhow!("restoring snapshot: {err}")))?;
        self.store
            .install_snapshot(last, &req.data)
            .map_err(|err| self.map_fatal_storage_error(err))?;

        self.commit_index = last.index;
        self.last_applied = last.index;
        self.snapshot_last_log_id = last;
        self.last_log_id = self.store.last_log_id();
        self.report_metrics();

        Ok(InstallSnapshotResponse { term: self.current_term })
    }
}
