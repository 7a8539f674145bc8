//! The consensus core: a single task per node owning the protocol state,
//! the storage handle and the peer replication streams.
//!
//! The core is the only place protocol state changes. Everything reaches
//! it through the request queue (client commands, inbound peer RPCs,
//! admin requests) or through its internal channels (replication events,
//! snapshot progress, apply results), and it processes one message at a
//! time, so no lock guards any of its fields.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::stream::FuturesOrdered;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::client::ClientRequestEntry;
use crate::error::ChangeConfigError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::JoinError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::net::RaftNetwork;
use crate::raft::ClientWriteResponseTx;
use crate::raft::InfoReport;
use crate::raft::MembershipConfig;
use crate::raft::NodeAddr;
use crate::raft::RaftMsg;
use crate::raft::ResponseTx;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::snapshot::SnapshotResult;
use crate::storage::snapshot::SNAPSHOT_RESULT_MAGIC;
use crate::storage::HardState;
use crate::storage::KvStore;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// The core type implementing the consensus protocol for one node.
pub struct RaftCore<N: RaftNetwork> {
    /// This node's ID.
    id: NodeId,
    /// This node's address, carried in membership configs.
    addr: NodeAddr,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's current membership configuration.
    membership: MembershipConfig,
    network: Arc<N>,
    storage: Arc<KvStore>,

    /// The cluster lifecycle state of this node.
    cluster_state: ClusterState,
    /// The protocol role the node is transitioning to.
    target_state: State,
    /// The cluster dbid, `None` until the node is initialized, joined, or
    /// contacted by a leader.
    dbid: Option<String>,

    /// The index of the highest log entry known to be committed
    /// cluster-wide.
    ///
    /// Initialized to 0 on startup regardless of persisted state; it is
    /// re-learned from the leader (or re-derived by a new leader) and
    /// increases monotonically from there.
    commit_index: u64,
    /// The id of the highest entry applied to the dataset.
    last_applied: LogId,
    /// The current term. Increases monotonically.
    current_term: u64,
    /// The ID of the current cluster leader, as this node sees it.
    current_leader: Option<NodeId>,
    /// The candidate which received this node's vote in the current term.
    voted_for: Option<NodeId>,
    /// The id of the last entry appended to the log.
    last_log_id: LogId,

    /// The node's current snapshot activity, if any. At most one snapshot
    /// is in flight at a time; further triggers are deferred until the
    /// field clears.
    snapshot_state: Option<SnapshotState>,
    /// The id up to which the current snapshot includes, inclusive.
    snapshot_last_log_id: LogId,
    /// Clients blocked on an explicit compaction request.
    compact_waiters: Vec<oneshot::Sender<RaftResult<LogId>>>,

    /// Join handles of dataset apply tasks. At most one element; the
    /// ordering guarantees applies are observed in sequence without
    /// blocking the RPC flow.
    replicate_to_sm_handle: FuturesOrdered<JoinHandle<anyhow::Result<Option<LogId>>>>,
    /// Whether the initial catch-up apply has run.
    has_completed_initial_replication_to_sm: bool,

    /// The last time a heartbeat was received.
    last_heartbeat: Option<Instant>,
    /// The deadline of the next election timeout.
    next_election_timeout: Option<Instant>,

    tx_compaction: mpsc::Sender<SnapshotUpdate>,
    rx_compaction: mpsc::Receiver<SnapshotUpdate>,

    /// A sender onto our own queue, for internal tasks (the join walk)
    /// reporting back.
    tx_api: mpsc::UnboundedSender<(RaftMsg, Span)>,
    rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: RaftNetwork> RaftCore<N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        addr: NodeAddr,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<KvStore>,
        tx_api: mpsc::UnboundedSender<(RaftMsg, Span)>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_compaction, rx_compaction) = mpsc::channel(1);
        let this = Self {
            id,
            addr,
            config,
            membership: MembershipConfig::default(),
            network,
            storage,
            cluster_state: ClusterState::Loading,
            target_state: State::NonVoter,
            dbid: None,
            commit_index: 0,
            last_applied: LogId::default(),
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            snapshot_state: None,
            snapshot_last_log_id: LogId::default(),
            compact_waiters: Vec::new(),
            replicate_to_sm_handle: FuturesOrdered::new(),
            has_completed_initial_replication_to_sm: false,
            last_heartbeat: None,
            next_election_timeout: None,
            tx_compaction,
            rx_compaction,
            tx_api,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the consensus task.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.membership = state.membership;
        self.last_applied = state.last_applied;
        self.dbid = state.dbid;
        // It is unsafe to initialize the commit index to anything else: it
        // must be re-established through the protocol after a restart.
        self.commit_index = 0;

        if let Some(snapshot) =
            self.storage.get_current_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?
        {
            self.snapshot_last_log_id = snapshot.meta.last_log_id;
        }

        // Recovery is complete; classify the node.
        let has_state = self.dbid.is_some();
        let single = self.membership.len() == 1 && self.membership.contains(&self.id);
        let is_member = self.membership.contains(&self.id);

        self.cluster_state = if has_state {
            ClusterState::Up
        } else {
            ClusterState::Uninitialized
        };
        self.target_state = match (has_state, single, is_member) {
            // A pristine node waits for CLUSTER INIT / JOIN, or for a
            // leader to contact it after an out-of-band ADD.
            (false, ..) => State::NonVoter,
            // A cluster of one resumes leadership directly.
            (true, true, _) => State::Leader,
            (true, false, true) => State::Follower,
            // Initialized but not (or no longer) a member.
            (true, false, false) => State::NonVoter,
        };

        if self.target_state == State::Follower {
            // Overhead on the initial timeout so a restarted node does not
            // disrupt a stable cluster by campaigning before its network
            // comes up.
            let inst = Instant::now()
                + Duration::from_secs(2)
                + Duration::from_millis(self.config.new_rand_election_timeout());
            self.next_election_timeout = Some(inst);
        }

        tracing::debug!(id = self.id, state = ?self.target_state, cluster_state = %self.cluster_state, "node initialized");
        self.report_metrics();

        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::NonVoter => NonVoterState::new(&mut self).run().await?,
                State::Shutdown => {
                    self.shutdown().await;
                    return Ok(());
                }
            }
        }
    }

    /// Final teardown: refuse new requests, fail everything pending, and
    /// make the log durable.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn shutdown(&mut self) {
        self.rx_api.close();
        while let Ok((msg, _span)) = self.rx_api.try_recv() {
            fail_shutting_down(msg);
        }
        for tx in self.compact_waiters.drain(..) {
            let _ = tx.send(Err(RaftError::ShuttingDown));
        }
        if let Err(err) = self.storage.sync_log().await {
            tracing::error!(error=%err, "error syncing log during shutdown");
        }
        tracing::info!(id = self.id, "node has shutdown");
    }

    /// Report a metrics payload on the current state of the node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            cluster_state: self.cluster_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            membership_config: self.membership.clone(),
            snapshot: self.snapshot_last_log_id,
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Save the node's current hard state to the log sidecar.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update the core's target state, ensuring all invariants are upheld.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        if target_state == State::Follower && !self.membership.contains(&self.id) {
            self.target_state = State::NonVoter;
        } else {
            self.target_state = target_state;
        }
    }

    /// Get the next election timeout, generating a new value if not set.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a new election timeout deadline. With `heartbeat=true`, also
    /// record the heartbeat arrival time.
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Update the value of the `current_leader` property.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => self.current_leader = Some(self.id),
            UpdateCurrentLeader::OtherNode(target) => self.current_leader = Some(target),
            UpdateCurrentLeader::Unknown => self.current_leader = None,
        }
    }

    /// Update the current term, which resets `voted_for`.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable storage
    /// error. Losing committed entries silently is never an option; the
    /// node steps down and terminates instead.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=self.id}, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::Storage(err)
    }

    /// Adopt a new membership config learned from the log or a snapshot.
    #[tracing::instrument(level = "trace", skip(self, cfg))]
    fn update_membership(&mut self, cfg: MembershipConfig) -> RaftResult<()> {
        // A config without this node means it is either a fresh addition
        // replicating an older config, or it has been removed; either way
        // it must not campaign.
        self.membership = cfg;
        if !self.membership.contains(&self.id) {
            self.set_target_state(State::NonVoter);
        } else if self.target_state == State::NonVoter {
            self.set_target_state(State::Follower);
        }
        self.report_metrics();
        Ok(())
    }

    /// Adopt the cluster identity carried on first leader contact.
    async fn adopt_dbid(&mut self, dbid: &str) -> RaftResult<()> {
        if self.dbid.is_some() {
            return Ok(());
        }
        self.storage.ensure_log(dbid).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.dbid = Some(dbid.to_string());
        self.cluster_state = ClusterState::Up;
        tracing::info!(id = self.id, dbid, "adopted cluster identity");
        Ok(())
    }

    /// Handle the result of a snapshot build reported on the compaction
    /// channel; polled from every state loop.
    #[tracing::instrument(level = "debug", skip(self, update))]
    async fn handle_compaction_update(&mut self, update: SnapshotUpdate) {
        let taken = self.snapshot_state.take();

        match update {
            SnapshotUpdate::Done(sr) if sr.magic != SNAPSHOT_RESULT_MAGIC => {
                tracing::error!(magic = sr.magic, "snapshot result with bad magic, discarding");
                self.storage.cancel_compaction(&sr).await;
                self.fail_compact_waiters(|| RaftError::Storage(anyhow::anyhow!("snapshot worker protocol error")));
            }
            SnapshotUpdate::Done(sr) if sr.success => match self.storage.finalize_compaction(&sr).await {
                Ok(meta) => {
                    self.snapshot_last_log_id = meta.last_log_id;
                    if let Some(SnapshotState::Snapshotting { sender, .. }) = &taken {
                        let _ = sender.send(meta.last_log_id.index);
                    }
                    for tx in self.compact_waiters.drain(..) {
                        let _ = tx.send(Ok(meta.last_log_id));
                    }
                    self.report_metrics();
                }
                Err(err) => {
                    let err = self.map_fatal_storage_error(err);
                    tracing::error!(error=%err, "error adopting snapshot");
                    self.fail_compact_waiters(|| RaftError::ShuttingDown);
                }
            },
            SnapshotUpdate::Done(sr) => {
                tracing::error!(error=%sr.err, "snapshot build failed");
                self.storage.cancel_compaction(&sr).await;
                let msg = sr.err.clone();
                self.fail_compact_waiters(move || RaftError::Storage(anyhow::anyhow!(msg.clone())));
            }
            SnapshotUpdate::Aborted => {
                tracing::debug!("snapshot build aborted");
                self.storage.abort_compaction().await;
                self.fail_compact_waiters(|| RaftError::ShuttingDown);
            }
        }

        // A snapshot install stream started in the meantime survives; the
        // snapshotting marker is consumed either way.
        if let Some(state @ SnapshotState::Streaming { .. }) = taken {
            self.snapshot_state = Some(state);
        }
    }

    fn fail_compact_waiters<F>(&mut self, err: F)
    where F: Fn() -> RaftError {
        for tx in self.compact_waiters.drain(..) {
            let _ = tx.send(Err(err()));
        }
    }

    /// Trigger a snapshot if the log has outgrown `max_log_entries` (or
    /// unconditionally with `force`). A trigger while one is already in
    /// flight is deferred: the running snapshot's completion re-evaluates
    /// the thresholds on the next apply.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) async fn trigger_log_compaction_if_needed(&mut self, force: bool) {
        if self.snapshot_state.is_some() {
            return;
        }
        if self.last_applied.index == 0 || self.last_applied.index < self.snapshot_last_log_id.index {
            return;
        }
        if !force && self.last_applied.index < self.snapshot_last_log_id.index + self.config.max_log_entries {
            return;
        }

        let job = match self.storage.begin_compaction().await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(err) => {
                let _ = self.map_fatal_storage_error(err);
                return;
            }
        };

        let (handle, reg) = AbortHandle::new_pair();
        let (chan_tx, _) = broadcast::channel(1);
        let tx_compaction = self.tx_compaction.clone();
        let delay = self.config.compact_delay;
        self.snapshot_state = Some(SnapshotState::Snapshotting {
            handle,
            sender: chan_tx,
        });
        tokio::spawn(
            async move {
                let fut = async move {
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    crate::storage::snapshot::build_snapshot(job)
                };
                match Abortable::new(fut, reg).await {
                    Ok(sr) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::Done(sr));
                    }
                    Err(_aborted) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::Aborted);
                    }
                }
            }
            .instrument(tracing::debug_span!("compaction")),
        );
    }

    /// Handle an explicit compaction request.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(self) async fn handle_compact_request(&mut self, tx: oneshot::Sender<RaftResult<LogId>>) {
        self.compact_waiters.push(tx);
        self.trigger_log_compaction_if_needed(true).await;
        if self.snapshot_state.is_none() {
            // Nothing to compact; answer with the standing snapshot.
            let last = self.snapshot_last_log_id;
            for tx in self.compact_waiters.drain(..) {
                let _ = tx.send(Ok(last));
            }
        }
    }

    /// Handle the output of an async task applying entries to the dataset.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(self) async fn handle_replicate_to_sm_result(&mut self, res: anyhow::Result<Option<LogId>>) -> RaftResult<()> {
        let last_applied_opt = res.map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(last_applied) = last_applied_opt {
            self.last_applied = last_applied;
        }
        self.report_metrics();
        self.trigger_log_compaction_if_needed(false).await;
        Ok(())
    }

    /// Handle the completion report of the join walk.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(self) async fn handle_join_finished(&mut self, dbid: Option<String>) -> RaftResult<()> {
        match dbid {
            Some(dbid) => {
                self.adopt_dbid(&dbid).await?;
                self.cluster_state = ClusterState::Up;
            }
            None => {
                if self.cluster_state == ClusterState::Joining {
                    self.cluster_state = ClusterState::Uninitialized;
                }
            }
        }
        self.report_metrics();
        Ok(())
    }

    /// Build the `RAFT.INFO` status report.
    pub(self) fn build_info(&self) -> InfoReport {
        InfoReport {
            id: self.id,
            dbid: self.dbid.clone().unwrap_or_default(),
            cluster_state: self.cluster_state,
            state: self.target_state,
            current_term: self.current_term,
            current_leader: self.current_leader,
            leader_addr: self
                .current_leader
                .and_then(|id| self.membership.addr_of(&id).cloned()),
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied,
            snapshot_last: self.snapshot_last_log_id,
            membership: self.membership.clone(),
        }
    }

    /// Reject an init request due to the node not being in a state which
    /// allows it.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_init_with_config(&self, tx: oneshot::Sender<Result<(), InitializeError>>) {
        let _ = tx.send(Err(InitializeError::NotAllowed));
    }

    /// Reject a join request due to the node not being in a state which
    /// allows it.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_join(&self, tx: oneshot::Sender<Result<(), JoinError>>) {
        let _ = tx.send(Err(JoinError::NotAllowed));
    }

    /// Reject a config change request due to this node not being the
    /// leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_config_change_not_leader(&self, tx: ResponseTx) {
        let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(self.current_leader).into()));
    }

    /// Answer a client write submitted to a non-leader with the MOVED
    /// redirect naming the leader, when known.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn forward_client_write_request(&self, tx: ClientWriteResponseTx) {
        if self.cluster_state != ClusterState::Up {
            let _ = tx.send(Err(ClientWriteError::ClusterState(self.cluster_state)));
            return;
        }
        let leader_addr = self.current_leader.and_then(|id| self.membership.addr_of(&id).cloned());
        let _ = tx.send(Err(ClientWriteError::ForwardToLeader {
            leader_id: self.current_leader,
            leader_addr,
        }));
    }
}

/// Answer a queued request with a shutdown error. Used when draining the
/// queue during teardown.
fn fail_shutting_down(msg: RaftMsg) {
    match msg {
        RaftMsg::AppendEntries { tx, .. } => {
            let _ = tx.send(Err(RaftError::ShuttingDown));
        }
        RaftMsg::RequestVote { tx, .. } => {
            let _ = tx.send(Err(RaftError::ShuttingDown));
        }
        RaftMsg::InstallSnapshot { tx, .. } => {
            let _ = tx.send(Err(RaftError::ShuttingDown));
        }
        RaftMsg::ClientWrite { tx, .. } => {
            let _ = tx.send(Err(ClientWriteError::RaftError(RaftError::ShuttingDown)));
        }
        RaftMsg::ClusterInit { tx } => {
            let _ = tx.send(Err(InitializeError::RaftError(RaftError::ShuttingDown)));
        }
        RaftMsg::ClusterJoin { tx, .. } => {
            let _ = tx.send(Err(JoinError::RaftError(RaftError::ShuttingDown)));
        }
        RaftMsg::AddNode { tx, .. } | RaftMsg::RemoveNode { tx, .. } => {
            let _ = tx.send(Err(RaftError::ShuttingDown.into()));
        }
        RaftMsg::Compact { tx } => {
            let _ = tx.send(Err(RaftError::ShuttingDown));
        }
        RaftMsg::Info { .. } | RaftMsg::JoinFinished { .. } => {}
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// The snapshot activity of a node.
pub(self) enum SnapshotState {
    /// A local snapshot build is running in the background.
    Snapshotting {
        /// Aborts the build, e.g. when a snapshot install from the leader
        /// supersedes it.
        handle: AbortHandle,
        /// Notifies waiters (snapshot-streaming peers) of completion.
        sender: broadcast::Sender<u64>,
    },
    /// A snapshot is streaming in from the leader.
    Streaming {
        /// The offset of the last byte written so far.
        offset: u64,
        /// The ID of the snapshot being received.
        id: String,
        /// The buffer the stream is being written into.
        snapshot: Box<std::io::Cursor<Vec<u8>>>,
    },
}

/// Progress reported by a snapshot build task.
#[derive(Debug)]
pub(self) enum SnapshotUpdate {
    Done(SnapshotResult),
    Aborted,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible protocol roles of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is passive: it replicates entries but neither votes nor
    /// times out.
    NonVoter,
    /// The node is replicating entries from the leader.
    Follower,
    /// The node is campaigning to become the leader.
    Candidate,
    /// The node is the cluster leader.
    Leader,
    /// The node is shutting down.
    Shutdown,
}

impl State {
    pub fn is_non_voter(&self) -> bool {
        matches!(self, Self::NonVoter)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// The cluster lifecycle state of a node, orthogonal to its protocol
/// role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    /// Waiting for CLUSTER INIT or CLUSTER JOIN.
    Uninitialized,
    /// Recovering persisted state on startup.
    Loading,
    /// A CLUSTER JOIN is in flight.
    Joining,
    /// Up and running.
    Up,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            ClusterState::Uninitialized => "uninitialized",
            ClusterState::Loading => "loading",
            ClusterState::Joining => "joining",
            ClusterState::Up => "up",
        };
        write!(f, "{}", s)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the leader role.
struct LeaderState<'a, N: RaftNetwork> {
    pub(super) core: &'a mut RaftCore<N>,
    /// The replication stream of every peer, by node id.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState>,
    /// The log index of an appended but not yet committed membership
    /// change. Only one may be in flight at a time.
    pub(super) pending_config_change: Option<u64>,
    /// True when the in-flight config change removes this node; committed,
    /// it steps the leader down.
    pub(super) is_stepping_down: bool,

    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent, Span)>,
    /// The cloneable sender for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,

    /// Requests appended locally and awaiting cluster commit, in log
    /// order.
    pub(super) awaiting_committed: Vec<ClientRequestEntry>,
}

impl<'a, N: RaftNetwork> LeaderState<'a, N> {
    pub(self) fn new(core: &'a mut RaftCore<N>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            pending_config_change: None,
            is_stepping_down: false,
            replication_tx,
            replication_rx,
            awaiting_committed: Vec::new(),
        }
    }

    /// Run the leader loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        let targets = self
            .core
            .membership
            .all_nodes()
            .filter(|elem| elem != &self.core.id)
            .collect::<Vec<_>>();
        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.core.report_metrics();

        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!(id = self.core.id, state = ?self.core.target_state, "leaving leader state");
                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                }
                // Nothing pending will commit under this leader; answer
                // every waiting client with a redirect, or with a
                // shutdown error when the node is going down.
                let shutting_down = matches!(self.core.target_state, State::Shutdown);
                for req in self.awaiting_committed.drain(..) {
                    if shutting_down {
                        client::fail_pending_shutting_down(req);
                    } else {
                        self.core.fail_pending_not_leader(req);
                    }
                }
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:LeaderState");
            let _ent = span.enter();

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::ClientWrite { cmd, tx } => {
                            self.handle_client_write_request(cmd, tx).await;
                        }
                        RaftMsg::ClusterInit { tx } => {
                            self.core.reject_init_with_config(tx);
                        }
                        RaftMsg::ClusterJoin { tx, .. } => {
                            self.core.reject_join(tx);
                        }
                        RaftMsg::AddNode { id, addr, tx } => {
                            self.add_member(id, addr, tx).await;
                        }
                        RaftMsg::RemoveNode { id, tx } => {
                            self.remove_member(id, tx).await;
                        }
                        RaftMsg::Info { tx } => {
                            let _ = tx.send(self.core.build_info());
                        }
                        RaftMsg::Compact { tx } => {
                            self.core.handle_compact_request(tx).await;
                        }
                        RaftMsg::JoinFinished { dbid } => {
                            self.core.handle_join_finished(dbid).await?;
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.handle_compaction_update(update).await;
                }
                Some((event, span)) = self.replication_rx.recv() => {
                    let _ent = span.enter();
                    tracing::debug!("leader recv from replication_rx: {}", event.summary());
                    self.handle_replica_event(event).await;
                }
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein trigger shutdown on their own.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }
}

/// The replication state of a single target peer, from the leader's
/// perspective.
pub(self) struct ReplicationState {
    pub matched: LogId,
    /// When set, the stream is to be torn down once the target has
    /// replicated this index: the node was removed by the config entry at
    /// that index.
    pub remove_after_commit: Option<u64>,
    pub replstream: ReplicationStream,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the candidate role.
struct CandidateState<'a, N: RaftNetwork> {
    core: &'a mut RaftCore<N>,
    /// Granted votes, including our own.
    votes_granted: u64,
    /// Votes needed for a majority of the current config.
    votes_needed: u64,
}

impl<'a, N: RaftNetwork> CandidateState<'a, N> {
    pub(self) fn new(core: &'a mut RaftCore<N>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop. Each iteration of the outer loop is a new
    /// term.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // We vote for ourselves, so need a majority minus nothing
            // further from ourselves.
            self.votes_granted = 1;
            self.votes_needed = crate::quorum::majority_of(self.core.membership.len()) as u64;

            // Setup the new term.
            self.core.update_next_election_timeout(false);
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.report_metrics();

            // A majority of one is already satisfied by our own ballot.
            if self.votes_granted >= self.votes_needed {
                self.core.set_target_state(State::Leader);
                continue;
            }

            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this term.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                let span = tracing::debug_span!("CHrx:CandidateState");
                let _ent = span.enter();

                tokio::select! {
                    // The election timed out; break to the outer loop,
                    // which starts a new term.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await?,
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        match msg {
                            RaftMsg::AppendEntries { rpc, tx } => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote { rpc, tx } => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::InstallSnapshot { rpc, tx } => {
                                let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                            }
                            RaftMsg::ClientWrite { tx, .. } => {
                                self.core.forward_client_write_request(tx);
                            }
                            RaftMsg::ClusterInit { tx } => {
                                self.core.reject_init_with_config(tx);
                            }
                            RaftMsg::ClusterJoin { tx, .. } => {
                                self.core.reject_join(tx);
                            }
                            RaftMsg::AddNode { tx, .. } | RaftMsg::RemoveNode { tx, .. } => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                            RaftMsg::Info { tx } => {
                                let _ = tx.send(self.core.build_info());
                            }
                            RaftMsg::Compact { tx } => {
                                self.core.handle_compact_request(tx).await;
                            }
                            RaftMsg::JoinFinished { dbid } => {
                                self.core.handle_join_finished(dbid).await?;
                            }
                        }
                    },
                    Some(update) = self.core.rx_compaction.recv() => {
                        self.core.handle_compaction_update(update).await;
                    }
                    Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                        let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                    }
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the follower role.
pub struct FollowerState<'a, N: RaftNetwork> {
    core: &'a mut RaftCore<N>,
}

impl<'a, N: RaftNetwork> FollowerState<'a, N> {
    pub(self) fn new(core: &'a mut RaftCore<N>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            // Deadline updated as heartbeats arrive.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            let span = tracing::debug_span!("CHrx:FollowerState");
            let _ent = span.enter();

            tokio::select! {
                // No leader contact within the window; campaign.
                _ = election_timeout => self.core.set_target_state(State::Candidate),
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::ClientWrite { tx, .. } => {
                            self.core.forward_client_write_request(tx);
                        }
                        RaftMsg::ClusterInit { tx } => {
                            self.core.reject_init_with_config(tx);
                        }
                        RaftMsg::ClusterJoin { tx, .. } => {
                            self.core.reject_join(tx);
                        }
                        RaftMsg::AddNode { tx, .. } | RaftMsg::RemoveNode { tx, .. } => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::Info { tx } => {
                            let _ = tx.send(self.core.build_info());
                        }
                        RaftMsg::Compact { tx } => {
                            self.core.handle_compact_request(tx).await;
                        }
                        RaftMsg::JoinFinished { dbid } => {
                            self.core.handle_join_finished(dbid).await?;
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.handle_compaction_update(update).await;
                }
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the non-voter role. This is also where an
/// uninitialized node waits for CLUSTER INIT / JOIN.
pub struct NonVoterState<'a, N: RaftNetwork> {
    core: &'a mut RaftCore<N>,
}

impl<'a, N: RaftNetwork> NonVoterState<'a, N> {
    pub(self) fn new(core: &'a mut RaftCore<N>) -> Self {
        Self { core }
    }

    /// Run the non-voter loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="non-voter"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_non_voter() {
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:NonVoterState");
            let _ent = span.enter();

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::ClientWrite { tx, .. } => {
                            self.core.forward_client_write_request(tx);
                        }
                        RaftMsg::ClusterInit { tx } => {
                            let _ = tx.send(self.handle_cluster_init().await);
                        }
                        RaftMsg::ClusterJoin { addrs, tx } => {
                            self.handle_cluster_join(addrs, tx);
                        }
                        RaftMsg::AddNode { tx, .. } | RaftMsg::RemoveNode { tx, .. } => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::Info { tx } => {
                            let _ = tx.send(self.core.build_info());
                        }
                        RaftMsg::Compact { tx } => {
                            self.core.handle_compact_request(tx).await;
                        }
                        RaftMsg::JoinFinished { dbid } => {
                            self.core.handle_join_finished(dbid).await?;
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.handle_compaction_update(update).await;
                }
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
