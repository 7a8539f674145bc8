//! Leader-side handling of replication stream events: match index
//! bookkeeping, quorum commit advancement, and snapshot hand-off.

use tokio::sync::oneshot;

use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::net::RaftNetwork;
use crate::quorum;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::Snapshot;
use crate::LogId;
use crate::NodeId;

impl<'a, N: RaftNetwork> LeaderState<'a, N> {
    /// Spawn a new replication stream, returning its state handle.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.dbid.clone().unwrap_or_default(),
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId::default(),
            remove_after_commit: None,
            replstream,
        }
    }

    /// Handle an event coming from one of the replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) {
        let res = match event {
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                self.handle_update_match_index(target, matched).await
            }
            ReplicaEvent::NeedsSnapshot { target, tx } => self.handle_needs_snapshot(target, tx).await,
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
                return;
            }
        };
        if let Err(err) = res {
            tracing::error!({error=%err}, "error while processing event from replication stream");
        }
    }

    /// A peer answered with a higher term; this leader is deposed.
    #[tracing::instrument(level = "trace", skip(self, term))]
    async fn handle_revert_to_follower(&mut self, _: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// A target's match index advanced; recompute the commit index and
    /// dispatch any newly committed requests, in log order.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_match_index(&mut self, target: NodeId, matched: LogId) -> RaftResult<()> {
        let mut needs_removal = false;
        match self.nodes.get_mut(&target) {
            Some(state) => {
                state.matched = matched;
                if let Some(threshold) = &state.remove_after_commit {
                    if &matched.index >= threshold {
                        needs_removal = true;
                    }
                }
            }
            None => return Ok(()), // The stream was already torn down.
        }

        // Drop the stream of a removed node once it has replicated the
        // config entry removing it.
        if needs_removal {
            tracing::debug!(peer = target, "removing replication stream of removed node");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
            }
        }

        let commit_index = self.calc_commit_index();

        if commit_index > self.core.commit_index {
            self.core.commit_index = commit_index;

            for node in self.nodes.values() {
                let _ = node.replstream.repl_tx.send((
                    RaftEvent::UpdateCommitIndex {
                        commit_index: self.core.commit_index,
                    },
                    tracing::debug_span!("CH"),
                ));
            }

            // Answer every request whose entry is now committed.
            let take = self
                .awaiting_committed
                .iter()
                .enumerate()
                .take_while(|(_idx, elem)| elem.entry.log_id.index <= self.core.commit_index)
                .last()
                .map(|(idx, _)| idx);
            if let Some(offset) = take {
                for request in self.awaiting_committed.drain(..=offset).collect::<Vec<_>>() {
                    self.client_request_post_commit(request).await;
                }
            }
        }

        self.core.report_metrics();
        Ok(())
    }

    /// Compute the highest index replicated on a majority of the current
    /// config, counting this node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn calc_commit_index(&self) -> u64 {
        let mut entries = Vec::with_capacity(self.core.membership.len());
        for id in self.core.membership.all_nodes() {
            if id == self.core.id {
                entries.push((self.core.last_log_id.index, self.core.last_log_id.term));
            } else if let Some(state) = self.nodes.get(&id) {
                entries.push((state.matched.index, state.matched.term));
            } else {
                // A member the leader has not spawned a stream for yet
                // has replicated nothing, as far as we know.
                entries.push((0, 0));
            }
        }
        calculate_new_commit_index(entries, self.core.commit_index, self.core.current_term)
    }

    /// A replication stream requested the current snapshot for its
    /// target.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn handle_needs_snapshot(&mut self, _: NodeId, tx: oneshot::Sender<Snapshot>) -> RaftResult<()> {
        let threshold = self.core.config.max_log_entries;

        // An existing snapshot close enough to the head of the log is
        // served as is.
        let current_snapshot_opt = self
            .core
            .storage
            .get_current_snapshot()
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;

        if let Some(snapshot) = current_snapshot_opt {
            if snapshot_is_within_half_of_threshold(
                &snapshot.meta.last_log_id.index,
                &self.core.last_log_id.index,
                &threshold,
            ) {
                let _ = tx.send(snapshot);
                return Ok(());
            }
        }

        // A snapshot build is already in progress: spawn a waiter which
        // drops the response channel on completion; the stream will then
        // re-request and get the fresh snapshot.
        if let Some(SnapshotState::Snapshotting { handle, sender }) = self.core.snapshot_state.take() {
            let mut chan = sender.subscribe();
            tokio::spawn(async move {
                let _ = chan.recv().await;
                drop(tx);
            });
            self.core.snapshot_state = Some(SnapshotState::Snapshotting { handle, sender });
            return Ok(());
        }

        // No usable snapshot and no build running: start one. The stream
        // will re-request shortly and hit the waiter path above.
        self.core.trigger_log_compaction_if_needed(true).await;
        Ok(())
    }
}

/// Determine the new commit index from the known replication positions of
/// the cluster members.
///
/// `entries` holds one `(index, term)` per member, including the leader.
/// The result never decreases below `current_commit`, and only entries
/// from the leader's own term are counted, per the protocol's commit
/// safety rule.
fn calculate_new_commit_index(mut entries: Vec<(u64, u64)>, current_commit: u64, leader_term: u64) -> u64 {
    if entries.is_empty() {
        return current_commit;
    }

    entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let majority = quorum::majority_of(entries.len());
    let offset = entries.len() - majority;
    let new_val = entries[offset];

    if new_val.0 > current_commit && new_val.1 == leader_term {
        new_val.0
    } else {
        current_commit
    }
}

/// Check if the given snapshot is within half of the compaction threshold
/// from the head of the log, and therefore still useful for catching a
/// peer up.
fn snapshot_is_within_half_of_threshold(snapshot_last_index: &u64, last_log_index: &u64, threshold: &u64) -> bool {
    // Guard against underflow.
    let distance_from_line = if snapshot_last_index > last_log_index {
        0u64
    } else {
        last_log_index - snapshot_last_index
    };
    distance_from_line <= threshold / 2
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    mod snapshot_is_within_half_of_threshold {
        use super::*;

        macro_rules! test_snapshot_is_within_half_of_threshold {
            ({test=>$name:ident, snapshot_last_index=>$snapshot_last_index:expr, last_log_index=>$last_log:expr, threshold=>$thresh:expr, expected=>$exp:literal}) => {
                #[test]
                fn $name() {
                    let res = snapshot_is_within_half_of_threshold($snapshot_last_index, $last_log, $thresh);
                    assert_eq!(res, $exp)
                }
            };
        }

        test_snapshot_is_within_half_of_threshold!({
            test=>happy_path_true_when_within_half_threshold,
            snapshot_last_index=>&50, last_log_index=>&100, threshold=>&500, expected=>true
        });

        test_snapshot_is_within_half_of_threshold!({
            test=>happy_path_false_when_above_half_threshold,
            snapshot_last_index=>&1, last_log_index=>&500, threshold=>&100, expected=>false
        });

        test_snapshot_is_within_half_of_threshold!({
            test=>guards_against_underflow,
            snapshot_last_index=>&200, last_log_index=>&100, threshold=>&500, expected=>true
        });
    }

    mod calculate_new_commit_index {
        use super::*;

        macro_rules! test_calculate_new_commit_index {
            ($name:ident, $expected:literal, $current:literal, $leader_term:literal, $entries:expr) => {
                #[test]
                fn $name() {
                    let mut entries = $entries;
                    let output = calculate_new_commit_index(entries.clone(), $current, $leader_term);
                    entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
                    assert_eq!(output, $expected, "Sorted values: {:?}", entries);
                }
            };
        }

        test_calculate_new_commit_index!(basic_values, 10, 5, 3, vec![(20, 3), (5, 2), (0, 2), (15, 3), (10, 3)]);

        test_calculate_new_commit_index!(len_zero_should_return_current_commit, 20, 20, 10, vec![]);

        test_calculate_new_commit_index!(len_one_where_greater_than_current, 100, 0, 3, vec![(100, 3)]);

        test_calculate_new_commit_index!(len_one_where_greater_than_current_but_smaller_term, 0, 0, 3, vec![(
            100, 2
        )]);

        test_calculate_new_commit_index!(len_one_where_less_than_current, 100, 100, 3, vec![(50, 3)]);

        test_calculate_new_commit_index!(even_number_of_nodes, 0, 0, 3, vec![
            (0, 3),
            (100, 3),
            (0, 3),
            (100, 3),
            (0, 3),
            (100, 3)
        ]);

        test_calculate_new_commit_index!(majority_wins, 100, 0, 3, vec![
            (0, 3),
            (100, 3),
            (0, 3),
            (100, 3),
            (0, 3),
            (100, 3),
            (100, 3)
        ]);

        test_calculate_new_commit_index!(majority_entries_wins_but_not_current_term, 0, 0, 3, vec![
            (0, 2),
            (100, 2),
            (0, 2),
            (101, 3),
            (0, 2),
            (101, 3),
            (101, 3)
        ]);
    }
}
