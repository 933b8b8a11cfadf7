//! Follower-side AppendEntries handling.

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::sm::StateMachine;
use crate::MessageSummary;

impl<N: RaftNetwork, M: StateMachine> RaftCore<N, M> {
    /// Handle an incoming AppendEntries RPC.
    ///
    /// A valid request from the current leader resets the election timer.
    /// Rejections carry a conflict hint: `conflict_term = 0` with
    /// `conflict_index = lastLogIndex + 1` when our log is too short,
    /// otherwise our term at `prevLogIndex` plus the first index holding
    /// it. All appends and truncations are durable before the reply.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req = %req.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        if req.term < self.current_term {
            tracing::debug!(
                { leader = req.leader_id, term = req.term },
                "rejecting stale-term append entries"
            );
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_term: 0,
                conflict_index: 0,
            });
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
        // A valid leader in the current term demotes candidates and stale
        // leaders alike.
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
            report_metrics = true;
        }

        // Log matching: the entry at prevLogIndex must carry prevLogTerm.
        let reject = |core: &Self, conflict_term: u64, conflict_index: u64| AppendEntriesResponse {
            term: core.current_term,
            success: false,
            conflict_term,
            conflict_index,
        };

        if req.prev_log_index > self.last_log_id.index {
            if report_metrics {
                self.report_metrics();
            }
            return Ok(reject(self, 0, self.last_log_id.index + 1));
        }
        match self.store.term_at(req.prev_log_index) {
            Some(term) if term == req.prev_log_term => {}
            Some(term) => {
                let conflict_index =
                    self.store.first_index_of_term(term).unwrap_or(req.prev_log_index);
                if report_metrics {
                    self.report_metrics();
                }
                return Ok(reject(self, term, conflict_index));
            }
            None => {
                // prevLogIndex fell below our snapshot; resume replication
                // right after the boundary.
                let conflict_index = self.store.snapshot_last().index + 1;
                if report_metrics {
                    self.report_metrics();
                }
                return Ok(reject(self, 0, conflict_index));
            }
        }

        // Walk the incoming entries: skip those we already hold, truncate
        // on the first term conflict, then append the rest in one batch.
        let mut append_from = None;
        for (i, entry) in req.entries.iter().enumerate() {
            match self.store.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    tracing::debug!(index = entry.index, "term conflict, truncating log suffix");
                    self.store
                        .truncate_from(entry.index)
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    append_from = Some(i);
                    break;
                }
                None => {
                    append_from = Some(i);
                    break;
                }
            }
        }
        if let Some(i) = append_from {
            self.store
                .append(&req.entries[i..])
                .map_err(|err| self.map_fatal_storage_error(err))?;
        }
        self.last_log_id = self.store.last_log_id();

        let last_new_entry_index =
            req.entries.last().map(|e| e.index).unwrap_or(req.prev_log_index);
        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(last_new_entry_index);
            // Follower-side apply outcomes have no waiting proposer; any
            // deterministic rejection was already logged.
            let _ = self.replicate_to_state_machine_if_needed().await?;
            report_metrics = true;
        }

        if report_metrics || append_from.is_some() {
            self.report_metrics();
        }
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_term: 0,
            conflict_index: 0,
        })
    }
}
