//! Elections: granting votes and campaigning.

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::net::RaftNetwork;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::MessageSummary;
use crate::NodeId;

impl<N: RaftNetwork> RaftCore<N> {
    /// An RPC invoked by candidates to gather votes.
    #[tracing::instrument(level="trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // A stateless node has no log to judge candidates with and no
        // place to persist a vote.
        if self.dbid.is_none() {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Leader stickiness: a node which heard from a live leader within
        // the minimum election timeout does not depose it.
        if let Some(heartbeat) = &self.last_heartbeat {
            let delta = heartbeat.elapsed();
            if delta.as_millis() as u64 <= self.config.election_timeout_min {
                tracing::debug!(
                    { candidate = msg.candidate_id },
                    "rejecting vote request received within election timeout minimum"
                );
                return Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                });
            }
        }

        // Observing a higher term makes this node a follower of that term
        // regardless of how it votes.
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.update_next_election_timeout(false);
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
        }

        // A vote may only go to a candidate whose log is at least as
        // up-to-date as ours.
        if msg.last_log_id < self.last_log_id {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        match &self.voted_for {
            // Already voted for this candidate in this term.
            Some(candidate_id) if candidate_id == &msg.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            }),
            // Already voted for someone else.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            None => {
                self.voted_for = Some(msg.candidate_id);
                self.set_target_state(State::Follower);
                self.update_next_election_timeout(false);
                // The vote must be durable before it is acknowledged.
                self.save_hard_state().await?;
                tracing::debug!({candidate=msg.candidate_id, term=msg.term}, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }
}

impl<'a, N: RaftNetwork> CandidateState<'a, N> {
    /// Spawn one vote request per cluster member, in parallel, feeding the
    /// responses back over a channel.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let all_members: Vec<NodeId> =
            self.core.membership.all_nodes().filter(|member| member != &self.core.id).collect();
        let (tx, rx) = mpsc::channel(all_members.len().max(1));

        for member in all_members {
            let rpc = VoteRequest {
                term: self.core.current_term,
                candidate_id: self.core.id,
                last_log_id: self.core.last_log_id,
            };
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let ttl = Duration::from_millis(self.core.config.request_timeout);
            let _ = tokio::spawn(
                async move {
                    match timeout(ttl, network.send_vote(member, rpc)).await {
                        Ok(Ok(res)) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(peer = member, error=%err, "error sending RequestVote RPC to target")
                        }
                        Err(_) => {
                            tracing::debug!(peer = member, "timeout while sending RequestVote RPC to target")
                        }
                    }
                }
                .instrument(tracing::debug_span!("requesting vote", peer = member)),
            );
        }
        rx
    }

    /// Handle a vote response.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        // A higher term ends the campaign.
        if res.term > self.core.current_term {
            tracing::debug!({res.term}, "RequestVote response with newer term, reverting to follower");
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            return Ok(());
        }

        if res.vote_granted {
            self.votes_granted += 1;
            tracing::debug!(
                from = target,
                granted = self.votes_granted,
                needed = self.votes_needed,
                "vote granted"
            );
            if self.votes_granted >= self.votes_needed {
                tracing::info!(id = self.core.id, term = self.core.current_term, "won election, becoming leader");
                self.core.set_target_state(State::Leader);
            }
        }
        Ok(())
    }
}
