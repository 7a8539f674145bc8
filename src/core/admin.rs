//! Cluster administration: INIT, JOIN, and membership changes.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing_futures::Instrument;

use crate::core::client::ClientRequestEntry;
use crate::core::LeaderState;
use crate::core::NonVoterState;
use crate::core::State;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::error::JoinError;
use crate::net::RaftNetwork;
use crate::raft::AddNodeRequest;
use crate::raft::AddNodeResponse;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::MembershipConfig;
use crate::raft::NodeAddr;
use crate::raft::RaftMsg;
use crate::raft::ResponseTx;
use crate::replication::RaftEvent;
use crate::ClusterState;
use crate::new_dbid;
use crate::NodeId;

impl<'a, N: RaftNetwork> NonVoterState<'a, N> {
    /// Handle `RAFT.CLUSTER INIT`: become a cluster of one with a fresh
    /// dbid.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_cluster_init(&mut self) -> Result<(), InitializeError> {
        if self.core.cluster_state != ClusterState::Uninitialized
            || self.core.last_log_id.index != 0
            || self.core.current_term != 0
        {
            tracing::error!(
                cluster_state = %self.core.cluster_state,
                last_log_index = self.core.last_log_id.index,
                term = self.core.current_term,
                "rejecting CLUSTER INIT on a node with existing state"
            );
            return Err(InitializeError::NotAllowed);
        }

        let dbid = new_dbid();
        let membership = MembershipConfig::new_initial(self.core.id, self.core.addr.clone());
        self.core
            .storage
            .initialize(&dbid, membership.clone())
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;

        tracing::info!(id = self.core.id, %dbid, "cluster initialized");
        self.core.dbid = Some(dbid);
        self.core.membership = membership;
        self.core.cluster_state = ClusterState::Up;

        // A cluster of one elects itself without campaigning.
        self.core.current_term += 1;
        self.core.voted_for = Some(self.core.id);
        self.core.set_target_state(State::Leader);
        self.core.save_hard_state().await?;
        self.core.report_metrics();
        Ok(())
    }

    /// Handle `RAFT.CLUSTER JOIN`: walk the address list asking to be
    /// added, off the consensus task. The walk reports back through the
    /// request queue.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) fn handle_cluster_join(
        &mut self,
        addrs: Vec<NodeAddr>,
        tx: oneshot::Sender<Result<(), JoinError>>,
    ) {
        if self.core.cluster_state != ClusterState::Uninitialized {
            self.core.reject_join(tx);
            return;
        }
        if addrs.is_empty() {
            let _ = tx.send(Err(JoinError::Rejected("no addresses to join".into())));
            return;
        }

        self.core.cluster_state = ClusterState::Joining;
        self.core.report_metrics();

        let network = self.core.network.clone();
        let req = AddNodeRequest {
            id: self.core.id,
            addr: self.core.addr.clone(),
        };
        let tx_api = self.core.tx_api.clone();
        let pause = self.core.config.reconnect_interval;
        tokio::spawn(
            async move {
                let res = join_walk(network, addrs, req, pause).await;
                let dbid = res.as_ref().ok().cloned();
                let _ = tx_api.send((RaftMsg::JoinFinished { dbid }, tracing::debug_span!("CH")));
                let _ = tx.send(res.map(|_| ()));
            }
            .instrument(tracing::debug_span!("cluster-join")),
        );
    }
}

/// Walk the join address list until the cluster accepts us.
///
/// MOVED redirects append the named leader to the list and do not count as
/// failures; the walk fails with a timeout only after a full pass in which
/// every address returned a network error.
async fn join_walk<N: RaftNetwork>(
    network: Arc<N>,
    mut addrs: Vec<NodeAddr>,
    req: AddNodeRequest,
    pause_ms: u64,
) -> Result<String, JoinError> {
    loop {
        let mut all_network_errors = true;
        let mut i = 0;
        while i < addrs.len() {
            let addr = addrs[i].clone();
            i += 1;
            match network.send_add_node(&addr, req.clone()).await {
                Ok(AddNodeResponse::Added { dbid }) => {
                    tracing::info!(%addr, "cluster accepted join request");
                    return Ok(dbid);
                }
                Ok(AddNodeResponse::Moved { leader: Some(leader) }) => {
                    tracing::debug!(%addr, %leader, "redirected to leader");
                    all_network_errors = false;
                    if !addrs.contains(&leader) {
                        addrs.push(leader);
                    }
                }
                Ok(AddNodeResponse::Moved { leader: None }) => {
                    tracing::debug!(%addr, "contacted node has no leader yet");
                    all_network_errors = false;
                }
                Ok(AddNodeResponse::Rejected { reason }) => {
                    tracing::error!(%addr, %reason, "cluster rejected join request");
                    return Err(JoinError::Rejected(reason));
                }
                Err(err) => {
                    tracing::debug!(%addr, error=%err, "join address unreachable");
                }
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(pause_ms)).await;
        }
        if all_network_errors {
            return Err(JoinError::Timeout);
        }
    }
}

impl<'a, N: RaftNetwork> LeaderState<'a, N> {
    /// Handle `RAFT.NODE ADD`: propose a membership config containing the
    /// new node.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn add_member(&mut self, target: NodeId, addr: NodeAddr, tx: ResponseTx) {
        if self.pending_config_change.is_some() {
            let _ = tx.send(Err(ChangeConfigError::ChangeInProgress.into()));
            return;
        }
        if let Some(existing) = self.core.membership.addr_of(&target) {
            if existing == &addr {
                // An idempotent retry of an add which already committed.
                tracing::debug!(peer = target, %addr, "node is already a member");
                let _ = tx.send(Ok(self.core.last_log_id.index));
                return;
            }
            // Same id, new address: propose the address change.
            tracing::info!(peer = target, old = %existing, new = %addr, "updating member address");
        }

        let mut members = self.core.membership.members.clone();
        members.insert(target, addr);
        self.append_membership_log(MembershipConfig { members }, Some(tx)).await;
    }

    /// Handle `RAFT.NODE REMOVE`: propose a membership config without the
    /// node.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn remove_member(&mut self, target: NodeId, tx: ResponseTx) {
        if self.pending_config_change.is_some() {
            let _ = tx.send(Err(ChangeConfigError::ChangeInProgress.into()));
            return;
        }
        if !self.core.membership.contains(&target) {
            let _ = tx.send(Err(ChangeConfigError::NodeNotFound(target).into()));
            return;
        }
        if self.core.membership.len() == 1 {
            let _ = tx.send(Err(ChangeConfigError::InoperableConfig.into()));
            return;
        }

        let mut members = self.core.membership.members.clone();
        members.remove(&target);
        if target == self.core.id {
            self.is_stepping_down = true;
        }
        self.append_membership_log(MembershipConfig { members }, Some(tx)).await;
    }

    /// Append a membership config entry, adopt it as the active config,
    /// reconcile the replication streams, and start replicating it.
    #[tracing::instrument(level = "trace", skip(self, mem, resp_tx), fields(id = self.core.id))]
    pub(super) async fn append_membership_log(
        &mut self,
        mem: MembershipConfig,
        resp_tx: Option<ResponseTx>,
    ) {
        let payload = EntryPayload::ConfigChange(mem.clone());
        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(error=%err, "error appending membership config entry");
                if let Some(tx) = resp_tx {
                    let _ = tx.send(Err(ChangeConfigError::from(err).into()));
                }
                return;
            }
        };

        // The latest config takes effect as soon as it is appended.
        self.pending_config_change = Some(entry.log_id.index);
        self.core.membership = mem;
        self.reconcile_replication_streams(entry.log_id.index);
        self.core.report_metrics();

        let cr_entry = ClientRequestEntry::from_entry(entry, resp_tx);
        self.replicate_client_request(cr_entry).await;
    }

    /// Bring the replication streams in line with the active membership:
    /// spawn streams for new members, and mark streams of removed members
    /// for teardown once they replicate the config entry which removes
    /// them.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn reconcile_replication_streams(&mut self, config_index: u64) {
        for target in self.core.membership.all_nodes().collect::<Vec<_>>() {
            if target != self.core.id && !self.nodes.contains_key(&target) {
                let state = self.spawn_replication_stream(target);
                self.nodes.insert(target, state);
            }
        }
        for (target, state) in self.nodes.iter_mut() {
            if !self.core.membership.contains(target) && state.remove_after_commit.is_none() {
                tracing::debug!(peer = *target, "marking replication stream of removed node");
                state.remove_after_commit = Some(config_index);
            }
        }
    }

    /// A membership config entry committed.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub(super) async fn handle_config_entry_committed(&mut self, entry: &Entry) {
        let membership = match &entry.payload {
            EntryPayload::ConfigChange(membership) => membership,
            _ => return,
        };
        if self.pending_config_change == Some(entry.log_id.index) {
            self.pending_config_change = None;
        }

        // A committed config without this node steps the leader down.
        if self.is_stepping_down && !membership.contains(&self.core.id) {
            tracing::info!(id = self.core.id, "removed from cluster by committed config, stepping down");
            self.core.set_target_state(State::NonVoter);
            self.core.update_current_leader(super::UpdateCurrentLeader::Unknown);
            return;
        }

        // Tear down streams of removed nodes which have already
        // replicated the config entry removing them; stragglers are torn
        // down by the match-index handler when they catch up.
        let to_remove: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, state)| !membership.contains(id) && state.matched.index >= entry.log_id.index)
            .map(|(id, _)| *id)
            .collect();
        for target in to_remove {
            tracing::debug!(peer = target, "removing replication stream of removed node");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
            }
        }
        self.core.report_metrics();
    }
}
