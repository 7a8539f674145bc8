//! The AppendEntries receiver: log consistency checking, conflicting
//! suffix truncation, and handing committed entries to the apply task.

use tracing::Instrument;

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::net::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::LogId;
use crate::MessageSummary;

impl<N: RaftNetwork> RaftCore<N> {
    /// An RPC invoked by the leader to replicate log entries; also used as
    /// a heartbeat.
    #[tracing::instrument(level="trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        // An earlier term is not honored.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        // First contact from a leader hands a stateless node its cluster
        // identity. A node with state never switches clusters.
        if self.dbid.is_none() {
            self.adopt_dbid(&msg.dbid).await?;
        } else if self.dbid.as_deref() != Some(msg.dbid.as_str()) {
            tracing::error!(
                ours = ?self.dbid,
                theirs = %msg.dbid,
                "AppendEntries RPC from a different cluster, ignoring"
            );
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        self.update_next_election_timeout(true);
        let mut report_metrics = false;

        // Only followers learn the commit index this way.
        self.commit_index = msg.leader_commit;

        if self.current_term != msg.term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        if self.current_leader.as_ref() != Some(&msg.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader_id));
            report_metrics = true;
        }

        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower);
        }

        // If the previous log info matches local state (or the leader is
        // starting from the beginning), replication proceeds directly.
        let msg_prev_index_is_min = msg.prev_log_id.index == u64::MIN;
        let msg_index_and_term_match = msg.prev_log_id == self.last_log_id;

        // Entries below our snapshot boundary can not be re-appended; the
        // leader must be pointed at our actual position instead.
        if msg_prev_index_is_min && !msg.entries.is_empty() && self.snapshot_last_log_id.index > 0 {
            if report_metrics {
                self.report_metrics();
            }
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: Some(ConflictOpt {
                    log_id: self.last_log_id,
                }),
            });
        }

        if msg_prev_index_is_min || msg_index_and_term_match {
            if !msg.entries.is_empty() {
                self.append_log_entries(&msg.entries).await?;
            }
            self.replicate_to_state_machine_if_needed().await?;
            if report_metrics {
                self.report_metrics();
            }
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: true,
                conflict_opt: None,
            });
        }

        //// Begin log consistency check ////
        tracing::debug!("begin log consistency check");

        if self.last_log_id.index < msg.prev_log_id.index {
            if report_metrics {
                self.report_metrics();
            }
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: Some(ConflictOpt {
                    log_id: self.last_log_id,
                }),
            });
        }

        let prev_entry = self
            .storage
            .try_get_log_entry(msg.prev_log_id.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        let target_entry = match prev_entry {
            Some(target_entry) => target_entry,
            None => {
                // The entry was removed by compaction or a snapshot
                // install; answer with the last known id.
                if report_metrics {
                    self.report_metrics();
                }
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    conflict_opt: Some(ConflictOpt {
                        log_id: self.last_log_id,
                    }),
                });
            }
        };

        if target_entry.log_id.term == msg.prev_log_id.term {
            // A point of agreement with the leader; anything above it is a
            // conflicting suffix which must be deleted.
            if self.last_log_id.index > target_entry.log_id.index {
                self.storage
                    .delete_logs_from(target_entry.log_id.index + 1)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                self.last_log_id = target_entry.log_id;
                let membership =
                    self.storage.get_membership_config().await.map_err(|err| self.map_fatal_storage_error(err))?;
                self.update_membership(membership)?;
            }
        } else {
            // Terms differ at the previous index. Walk the recent log for
            // the last entry still within the leader's previous term to
            // speed up convergence.
            let start = msg.prev_log_id.index.saturating_sub(50);
            let old_entries = self
                .storage
                .get_log_entries(start..msg.prev_log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            let opt = match old_entries.iter().find(|entry| entry.log_id.term == msg.prev_log_id.term) {
                Some(entry) => Some(ConflictOpt { log_id: entry.log_id }),
                None => Some(ConflictOpt {
                    log_id: self.last_log_id,
                }),
            };
            if report_metrics {
                self.report_metrics();
            }
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: opt,
            });
        }

        //// End log consistency check ////
        tracing::debug!("end log consistency check");

        self.append_log_entries(&msg.entries).await?;
        self.replicate_to_state_machine_if_needed().await?;
        if report_metrics {
            self.report_metrics();
        }
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_opt: None,
        })
    }

    /// Append the given entries to the log, adopting any membership
    /// config they carry.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_log_entries(&mut self, entries: &[Entry]) -> RaftResult<()> {
        let last_conf_change = entries
            .iter()
            .filter_map(|ent| match &ent.payload {
                EntryPayload::ConfigChange(conf) => Some(conf),
                _ => None,
            })
            .last();
        if let Some(conf) = last_conf_change {
            tracing::debug!(membership=?conf, "applying new membership config received from leader");
            self.update_membership(conf.clone())?;
        };

        // A leader may retransmit a suffix we already hold; the log is
        // append-only, so drop the overlap before re-appending.
        if let Some(first) = entries.first() {
            if first.log_id.index <= self.last_log_id.index {
                self.storage
                    .delete_logs_from(first.log_id.index)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
            }
        }

        let entry_refs = entries.iter().collect::<Vec<_>>();
        self.storage.append_to_log(&entry_refs).await.map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(entry) = entries.last() {
            self.last_log_id = entry.log_id;
        }
        Ok(())
    }

    /// Hand any newly committed entries to a background apply task.
    ///
    /// Must not block the control loop: a slow apply here would cause the
    /// leader to time this node out.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn replicate_to_state_machine_if_needed(&mut self) -> RaftResult<()> {
        if !self.has_completed_initial_replication_to_sm {
            // Optimistic update, as failures will cause shutdown.
            self.has_completed_initial_replication_to_sm = true;
            self.initial_replicate_to_state_machine().await;
            return Ok(());
        }
        // One apply task at a time keeps the sequence linear.
        if !self.replicate_to_sm_handle.is_empty() {
            return Ok(());
        }
        if self.commit_index <= self.last_applied.index {
            return Ok(());
        }

        let entries = self
            .storage
            .get_log_entries(self.last_applied.index + 1..=self.commit_index)
            .await
            .map_err(|e| self.map_fatal_storage_error(e))?;

        let last_log_id = entries.last().map(|x| x.log_id);
        if entries.is_empty() {
            if let Some(log_id) = last_log_id {
                self.last_applied = log_id;
                self.report_metrics();
            }
            return Ok(());
        }

        let storage = self.storage.clone();
        let handle = tokio::spawn(
            async move {
                let entries_refs: Vec<_> = entries.iter().collect();
                storage.apply_to_state_machine(&entries_refs).await?;
                Ok(last_log_id)
            }
            .instrument(tracing::debug_span!("spawn")),
        );
        self.replicate_to_sm_handle.push(handle);
        Ok(())
    }

    /// The one-time catch-up apply performed on the first AppendEntries
    /// payload after startup.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn initial_replicate_to_state_machine(&mut self) {
        let stop = std::cmp::min(self.commit_index, self.last_log_id.index) + 1;
        let start = self.last_applied.index + 1;
        let storage = self.storage.clone();

        if !self.replicate_to_sm_handle.is_empty() {
            return;
        }
        if start >= stop {
            return;
        }

        let handle = tokio::spawn(
            async move {
                let mut new_last_applied: Option<LogId> = None;
                let entries = storage.get_log_entries(start..stop).await?;
                if let Some(entry) = entries.last() {
                    new_last_applied = Some(entry.log_id);
                }
                let data_entries: Vec<_> = entries.iter().collect();
                if data_entries.is_empty() {
                    return Ok(new_last_applied);
                }
                storage.apply_to_state_machine(&data_entries).await?;
                Ok(new_last_applied)
            }
            .instrument(tracing::debug_span!("spawn-init-replicate-to-sm")),
        );
        self.replicate_to_sm_handle.push(handle);
    }
}
