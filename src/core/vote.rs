//! RequestVote handling and candidate-side vote gathering.

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::sm::StateMachine;
use crate::NodeId;

impl<N: RaftNetwork, M: StateMachine> RaftCore<N, M> {
    /// Handle an incoming RequestVote RPC.
    ///
    /// The vote is granted iff the message's term is current, this node has
    /// not yet voted for a different candidate in that term, and the
    /// candidate's log is at least as up-to-date as ours. Granting resets
    /// the election timer, and the vote is durable before the reply leaves.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req = ?req))]
    pub(super) async fn handle_vote_request(
        &mut self,
        req: VoteRequest,
    ) -> RaftResult<VoteResponse> {
        if req.term < self.current_term {
            tracing::debug!(
                { candidate = req.candidate_id, term = req.term },
                "rejecting stale-term vote request"
            );
            return Ok(VoteResponse { term: self.current_term, vote_granted: false });
        }

        // A newer term unconditionally steps us down before the request is
        // judged on its merits.
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
            self.report_metrics();
        }

        // Candidate log recency check.
        let candidate_up_to_date = req.last_log_term > self.last_log_id.term
            || (req.last_log_term == self.last_log_id.term
                && req.last_log_index >= self.last_log_id.index);
        if !candidate_up_to_date {
            tracing::debug!(
                { candidate = req.candidate_id },
                "rejecting vote request, candidate log is behind"
            );
            return Ok(VoteResponse { term: self.current_term, vote_granted: false });
        }

        match self.voted_for {
            Some(voted_for) if voted_for != req.candidate_id => {
                tracing::debug!(
                    { candidate = req.candidate_id, voted_for },
                    "rejecting vote request, already voted this term"
                );
                Ok(VoteResponse { term: self.current_term, vote_granted: false })
            }
            _ => {
                self.voted_for = Some(req.candidate_id);
                self.set_target_state(State::Follower);
                self.update_next_election_timeout();
                self.save_hard_state().await?;
                self.report_metrics();
                tracing::debug!({ candidate = req.candidate_id, term = req.term }, "voted");
                Ok(VoteResponse { term: self.current_term, vote_granted: true })
            }
        }
    }
}

impl<'a, N: RaftNetwork, M: StateMachine> CandidateState<'a, N, M> {
    /// Send a RequestVote to every peer in parallel, funnelling replies
    /// into the returned channel. Unreachable peers simply never answer;
    /// they count as non-votes.
    pub(super) fn spawn_parallel_vote_requests(
        &self,
    ) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let rpc = VoteRequest {
            term: self.core.current_term,
            candidate_id: self.core.id,
            last_log_index: self.core.last_log_id.index,
            last_log_term: self.core.last_log_id.term,
        };
        let (tx, rx) = mpsc::channel(self.core.peers.len().max(1));
        for peer in self.core.peers.clone() {
            let rpc = rpc.clone();
            let tx = tx.clone();
            let network = self.core.network.clone();
            let ttl = self.core.config.rpc_timeout;
            tokio::spawn(
                async move {
                    match timeout(ttl, network.send_vote(peer, rpc)).await {
                        Ok(Ok(res)) => {
                            let _ = tx.send((res, peer)).await;
                        }
                        Ok(Err(err)) => {
                            tracing::warn!(peer, error=%err, "error sending vote request")
                        }
                        Err(_) => tracing::warn!(peer, "timeout sending vote request"),
                    }
                }
                .instrument(tracing::debug_span!("vote-request")),
            );
        }
        rx
    }

    /// Tally one vote reply.
    #[tracing::instrument(level = "debug", skip(self, res), fields(peer = peer))]
    pub(super) async fn handle_vote_response(
        &mut self,
        res: VoteResponse,
        peer: NodeId,
    ) -> RaftResult<()> {
        // A newer term ends the campaign.
        if res.term > self.core.current_term {
            tracing::debug!({ peer, term = res.term }, "newer term observed, reverting to follower");
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            self.core.report_metrics();
            return Ok(());
        }

        if res.vote_granted {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                tracing::info!(
                    id = self.core.id,
                    term = self.core.current_term,
                    "won election, becoming leader"
                );
                self.core.set_target_state(State::Leader);
            }
        }
        Ok(())
    }
}
