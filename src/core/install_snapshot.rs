//! The InstallSnapshot receiver: stream a snapshot in from the leader and
//! swap it in as the new dataset.

use std::io::SeekFrom;

use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

use crate::core::RaftCore;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::net::RaftNetwork;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::MessageSummary;
use crate::SnapshotSegmentId;

impl<N: RaftNetwork> RaftCore<N> {
    /// Invoked by the leader to send chunks of a snapshot to a follower
    /// which is too far behind to catch up from the log.
    #[tracing::instrument(level="debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // An earlier term is not honored.
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        self.update_next_election_timeout(true);

        let mut report_metrics = false;
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            // A node receiving its very first contact as a snapshot has no
            // log yet; its hard state is persisted when the install
            // completes and the log springs into existence.
            if self.dbid.is_some() {
                self.save_hard_state().await?;
            }
            report_metrics = true;
        }

        if self.current_leader.as_ref() != Some(&req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }

        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower);
        }

        if report_metrics {
            self.report_metrics();
        }

        // Compare the current snapshot state with the received chunk:
        // - no stream, or a local build in progress: start a new stream
        //   (the local build is aborted in favor of the leader's).
        // - matching stream id: continue it.
        // - mismatched id at offset 0: the leader restarted the stream.
        // - mismatched id past offset 0: out of order, reject.
        match self.snapshot_state.take() {
            None => self.begin_installing_snapshot(req).await,
            Some(SnapshotState::Snapshotting { handle, .. }) => {
                handle.abort(); // Abort the local build in favor of the leader's snapshot.
                self.begin_installing_snapshot(req).await
            }
            Some(SnapshotState::Streaming { snapshot, id, offset }) => {
                if req.meta.snapshot_id == id {
                    return self.continue_installing_snapshot(req, offset, snapshot).await;
                }
                if req.offset == 0 {
                    return self.begin_installing_snapshot(req).await;
                }
                Err(RaftError::SnapshotMismatch {
                    expect: SnapshotSegmentId { id, offset },
                    got: SnapshotSegmentId {
                        id: req.meta.snapshot_id.clone(),
                        offset: req.offset,
                    },
                })
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, req))]
    async fn begin_installing_snapshot(&mut self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let id = req.meta.snapshot_id.clone();

        if req.offset > 0 {
            return Err(RaftError::SnapshotMismatch {
                expect: SnapshotSegmentId {
                    id: id.clone(),
                    offset: 0,
                },
                got: SnapshotSegmentId { id, offset: req.offset },
            });
        }

        let mut snapshot =
            self.storage.begin_receiving_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?;
        snapshot.as_mut().write_all(&req.data).await?;

        // A small snapshot may arrive as a single chunk.
        if req.done {
            self.finalize_snapshot_installation(req, snapshot).await?;
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        self.snapshot_state = Some(SnapshotState::Streaming {
            offset: req.data.len() as u64,
            id,
            snapshot,
        });
        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, req, snapshot))]
    async fn continue_installing_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
        mut offset: u64,
        mut snapshot: Box<std::io::Cursor<Vec<u8>>>,
    ) -> RaftResult<InstallSnapshotResponse> {
        let id = req.meta.snapshot_id.clone();

        // Always seek to the target offset if not an exact match.
        if req.offset != offset {
            if let Err(err) = snapshot.as_mut().seek(SeekFrom::Start(req.offset)).await {
                self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
                return Err(err.into());
            }
            offset = req.offset;
        }

        if let Err(err) = snapshot.as_mut().write_all(&req.data).await {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
            return Err(err.into());
        }
        offset += req.data.len() as u64;

        if req.done {
            self.finalize_snapshot_installation(req, snapshot).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
        }
        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    /// Finalize the installation of a fully received snapshot: swap the
    /// dataset, adopt the embedded membership, and resume from the
    /// snapshot boundary.
    #[tracing::instrument(level = "debug", skip(self, req, snapshot))]
    async fn finalize_snapshot_installation(
        &mut self,
        req: InstallSnapshotRequest,
        mut snapshot: Box<std::io::Cursor<Vec<u8>>>,
    ) -> RaftResult<()> {
        snapshot.as_mut().shutdown().await.map_err(|err| self.map_fatal_storage_error(err.into()))?;

        self.storage
            .finalize_snapshot_installation(&req.meta, snapshot)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        // A previously stateless node now has a log file and a cluster
        // identity.
        if self.dbid.is_none() {
            self.dbid = self.storage.dbid().await;
            self.cluster_state = crate::ClusterState::Up;
            self.save_hard_state().await?;
        }

        let membership = self.storage.get_membership_config().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.update_membership(membership)?;
        self.last_log_id = req.meta.last_log_id;
        self.last_applied = req.meta.last_log_id;
        self.snapshot_last_log_id = req.meta.last_log_id;
        self.report_metrics();
        Ok(())
    }
}
