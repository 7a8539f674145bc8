//! The client write path on the leader: append, replicate, and answer in
//! commit order.

use std::sync::Arc;

use futures::StreamExt;

use crate::core::LeaderState;
use crate::core::RaftCore;
use crate::core::State;
use crate::error::ChangeConfigError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::net::RaftNetwork;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::ResponseTx;
use crate::replication::RaftEvent;
use crate::store::KvCommand;
use crate::store::KvResponse;
use crate::LogId;

/// A client request which has been transformed into a log entry, along
/// with its response channel, awaiting cluster commit.
pub(super) struct ClientRequestEntry {
    /// The appended entry. Arc'd so it can be handed to the replication
    /// streams without cloning the payload.
    pub entry: Arc<Entry>,
    /// The response channel for the request.
    pub tx: ClientOrInternalResponseTx,
}

impl ClientRequestEntry {
    pub(crate) fn from_entry<T: Into<ClientOrInternalResponseTx>>(entry: Entry, tx: T) -> Self {
        Self {
            entry: Arc::new(entry),
            tx: tx.into(),
        }
    }
}

/// Either a client response channel or an internal (config change)
/// response channel.
#[derive(derive_more::From)]
pub enum ClientOrInternalResponseTx {
    Client(ClientWriteResponseTx),
    Internal(Option<ResponseTx>),
}

/// Answer a pending request with a shutdown error during teardown.
pub(super) fn fail_pending_shutting_down(req: ClientRequestEntry) {
    match req.tx {
        ClientOrInternalResponseTx::Client(tx) => {
            let _ = tx.send(Err(ClientWriteError::RaftError(RaftError::ShuttingDown)));
        }
        ClientOrInternalResponseTx::Internal(Some(tx)) => {
            let _ = tx.send(Err(RaftError::ShuttingDown.into()));
        }
        ClientOrInternalResponseTx::Internal(None) => {}
    }
}

impl<N: RaftNetwork> RaftCore<N> {
    /// Answer a pending request whose commit this node will never observe:
    /// leadership was lost while it waited.
    pub(super) fn fail_pending_not_leader(&self, req: ClientRequestEntry) {
        let leader_id = self.current_leader;
        let leader_addr = leader_id.and_then(|id| self.membership.addr_of(&id).cloned());
        match req.tx {
            ClientOrInternalResponseTx::Client(tx) => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader { leader_id, leader_addr }));
            }
            ClientOrInternalResponseTx::Internal(Some(tx)) => {
                let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(leader_id).into()));
            }
            ClientOrInternalResponseTx::Internal(None) => {}
        }
    }
}

impl<'a, N: RaftNetwork> LeaderState<'a, N> {
    /// Commit an initial entry on becoming leader.
    ///
    /// A brand new cluster has its membership seeded in the dataset and
    /// nothing to re-commit, so the log stays empty and client commands
    /// start at index 1. Any other new leader appends a blank entry so
    /// entries from previous terms commit promptly.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        if self.core.last_log_id.index == 0 {
            self.core.last_log_id.term = self.core.current_term;
            return Ok(());
        }

        let entry = self.append_payload_to_log(EntryPayload::Blank).await?;
        self.core.last_log_id.term = self.core.current_term;
        let cr_entry = ClientRequestEntry::from_entry(entry, None);
        self.replicate_client_request(cr_entry).await;
        Ok(())
    }

    /// Handle a client write request.
    #[tracing::instrument(level = "trace", skip(self, cmd, tx))]
    pub(super) async fn handle_client_write_request(&mut self, cmd: KvCommand, tx: ClientWriteResponseTx) {
        let entry = match self.append_payload_to_log(EntryPayload::Normal(cmd)).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, tx),
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Transform a payload into an entry, assign it the next index under
    /// the current term, and append it to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload) -> RaftResult<Entry> {
        let entry = Entry {
            log_id: LogId {
                term: self.core.current_term,
                index: self.core.last_log_id.index + 1,
            },
            payload,
        };
        self.core
            .storage
            .append_to_log(&[&entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id.index = entry.log_id.index;
        self.core.report_metrics();
        Ok(entry)
    }

    /// Begin replicating a request. Does not wait for the commit: once a
    /// quorum acknowledges, the response is dispatched from the
    /// replication event handler.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry) {
        let entry_arc = req.entry.clone();

        if self.nodes.is_empty() {
            // No other members; the entry is committed at once.
            self.core.commit_index = entry_arc.log_id.index;
            self.core.report_metrics();
            self.client_request_post_commit(req).await;
            return;
        }

        self.awaiting_committed.push(req);
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::Replicate {
                    entry: entry_arc.clone(),
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }
    }

    /// Handle the post-commit logic for a request: apply it and dispatch
    /// its reply. Called in commit order.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry) {
        let entry = &req.entry;

        match req.tx {
            ClientOrInternalResponseTx::Client(tx) => match &entry.payload {
                EntryPayload::Normal(_) => match self.apply_entry_to_state_machine(entry).await {
                    Ok(data) => {
                        let _ = tx.send(Ok(ClientWriteResponse {
                            index: entry.log_id.index,
                            data,
                        }));
                    }
                    Err(err) => {
                        let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                    }
                },
                _ => {
                    // Client channels are only ever attached to normal
                    // entries; anything else is a programming bug severe
                    // enough to stop for.
                    tracing::error!("a client response channel was attached to a non-client entry");
                    self.core.set_target_state(State::Shutdown);
                }
            },
            ClientOrInternalResponseTx::Internal(tx) => {
                self.handle_config_entry_committed(entry).await;

                let res = match self.apply_entry_to_state_machine(entry).await {
                    Ok(_data) => Ok(entry.log_id.index),
                    Err(err) => {
                        tracing::error!(error=%err, "error applying internal entry");
                        Err(err)
                    }
                };
                if let Some(tx) = tx {
                    let _ = tx.send(res.map_err(ResponseError::from));
                }
            }
        }

        self.core.trigger_log_compaction_if_needed(false).await;
    }

    /// Apply a committed entry to the dataset, first catching up any
    /// outstanding entries below it.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub(super) async fn apply_entry_to_state_machine(&mut self, entry: &Entry) -> RaftResult<KvResponse> {
        // Apply anything below this entry first. Only happens when a node
        // carries unapplied entries into its leadership.
        let index = entry.log_id.index;
        let expected_next_index = self.core.last_applied.index + 1;
        if index != expected_next_index {
            let entries = self
                .core
                .storage
                .get_log_entries(expected_next_index..index)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;

            if let Some(prior) = entries.last() {
                self.core.last_applied = prior.log_id;
            }

            let data_entries: Vec<_> = entries.iter().collect();
            if !data_entries.is_empty() {
                self.core
                    .storage
                    .apply_to_state_machine(&data_entries)
                    .await
                    .map_err(|err| self.core.map_fatal_storage_error(err))?;
            }
        }

        // Drain any outstanding background apply before touching the
        // dataset directly. Edge case from very early in a leader's term.
        if !self.core.replicate_to_sm_handle.is_empty() {
            if let Some(Ok(replicate_to_sm_result)) = self.core.replicate_to_sm_handle.next().await {
                self.core.handle_replicate_to_sm_result(replicate_to_sm_result).await?;
            }
        }

        let res = self
            .core
            .storage
            .apply_to_state_machine(&[entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err));

        self.core.last_applied = entry.log_id;
        self.core.report_metrics();
        let mut res = res?;

        res.pop().ok_or_else(|| RaftError::Storage(anyhow::anyhow!("state machine returned no response")))
    }
}
