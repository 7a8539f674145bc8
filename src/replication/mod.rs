//! Per-peer replication streams.
//!
//! The leader spawns one replication task per peer. Each stream runs at
//! line rate while the target keeps up, falls back to a lagging state
//! which feeds from storage when it does not, and switches to streaming a
//! snapshot when the target is so far behind that the entries it needs
//! have already been compacted away.

use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::FutureExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;
use tracing::Span;

use crate::config::Config;
use crate::net::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::Entry;
use crate::raft::InstallSnapshotRequest;
use crate::storage::KvStore;
use crate::storage::Snapshot;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<(RaftEvent, Span)>,
}

impl ReplicationStream {
    /// Create a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<N: RaftNetwork>(
        id: NodeId,
        target: NodeId,
        term: u64,
        dbid: String,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<KvStore>,
        replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    ) -> Self {
        ReplicationCore::spawn(
            id,
            target,
            term,
            dbid,
            config,
            last_log,
            commit_index,
            network,
            storage,
            replication_tx,
        )
    }
}

/// A task responsible for replicating the log to a single target peer.
///
/// Requests to a target are never stacked: a payload is buffered until the
/// previous one is acknowledged, which keeps delivery in order and allows
/// retransmission across transient errors.
struct ReplicationCore<N: RaftNetwork> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this node.
    id: NodeId,
    /// The ID of the target peer.
    target: NodeId,
    /// The current term, which never changes during the lifetime of this
    /// task.
    term: u64,
    /// The cluster dbid, stamped on every AppendEntries frame.
    dbid: String,

    /// A channel for sending events to the consensus core.
    raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    /// A channel for receiving events from the consensus core.
    repl_rx: mpsc::UnboundedReceiver<(RaftEvent, Span)>,

    network: Arc<N>,
    storage: Arc<KvStore>,
    config: Arc<Config>,
    max_payload_entries: usize,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The target state of this replication stream.
    target_state: TargetReplState,

    /// The index of the entry most recently appended to the log by the
    /// leader.
    last_log_index: u64,
    /// The index of the highest entry known to be committed cluster-wide.
    commit_index: u64,

    /// The index of the next log entry to send.
    ///
    /// Initialized to the leader's last log index + 1, and decremented as
    /// consistency-check conflicts come back, per the protocol's log
    /// matching rule with the conflicting-term optimization.
    next_index: u64,
    /// The last entry known to be successfully replicated on the target.
    matched: LogId,

    /// Entries flowing in from the consensus core, waiting to be chunked
    /// into the outbound buffer.
    replication_buffer: Vec<Arc<Entry>>,
    /// The payload currently being sent. Kept until acknowledged so it can
    /// be retransmitted after transient errors.
    outbound_buffer: Vec<OutboundEntry>,

    /// The heartbeat cadence.
    heartbeat: Interval,
    /// The timeout for one AppendEntries round-trip.
    heartbeat_timeout: Duration,
    /// The timeout for one snapshot segment round-trip.
    install_snapshot_timeout: Duration,
}

impl<N: RaftNetwork> ReplicationCore<N> {
    /// Spawn a new replication task for the target node.
    #[allow(clippy::too_many_arguments)]
    pub(self) fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        dbid: String,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<KvStore>,
        raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    ) -> ReplicationStream {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.request_timeout);
        let install_snapshot_timeout = Duration::from_millis(config.install_snapshot_timeout);
        let max_payload_entries = config.max_payload_entries as usize;
        let heartbeat_interval = config.raft_interval;
        let this = Self {
            id,
            target,
            term,
            dbid,
            network,
            storage,
            config,
            max_payload_entries,
            target_state: TargetReplState::Lagging,
            last_log_index: last_log.index,
            commit_index,
            next_index: last_log.index + 1,
            matched: last_log,
            raft_core_tx,
            repl_rx,
            heartbeat: interval(Duration::from_millis(heartbeat_interval)),
            heartbeat_timeout,
            install_snapshot_timeout,
            replication_buffer: Vec::new(),
            outbound_buffer: Vec::new(),
        };

        let _handle = tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));

        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        // Perform an initial heartbeat.
        self.send_append_entries().await;

        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Lagging => self.lagging_loop().await,
                TargetReplState::Snapshotting => SnapshottingState::new(&mut self).run().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    /// Send an AppendEntries RPC to the target, with the heartbeat
    /// timeout.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) {
        // Attempt to fill the send buffer from the replication buffer.
        if self.outbound_buffer.is_empty() {
            let repl_len = self.replication_buffer.len();
            if repl_len > 0 {
                let chunk_size = std::cmp::min(repl_len, self.max_payload_entries);
                self.outbound_buffer.extend(self.replication_buffer.drain(..chunk_size).map(OutboundEntry::Arc));
            }
        }

        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            dbid: self.dbid.clone(),
            prev_log_id: self.matched,
            leader_commit: self.commit_index,
            entries: self.outbound_buffer.iter().map(|entry| entry.as_ref().clone()).collect(),
        };

        tracing::debug!("start sending append_entries, timeout: {:?}", self.heartbeat_timeout);
        let res = match timeout(
            self.heartbeat_timeout,
            self.network.send_append_entries(self.target, payload),
        )
        .await
        {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::debug!(error=%err, "error sending AppendEntries RPC to target");
                return;
            }
            Err(err) => {
                tracing::debug!(error=%err, "timeout while sending AppendEntries RPC to target");
                return;
            }
        };
        let last_log_id = self.outbound_buffer.last().map(|last| last.as_ref().log_id);

        // Once a payload of entries is acknowledged, don't send it again.
        self.outbound_buffer.clear();

        if res.success {
            tracing::debug!("append entries succeeded to {:?}", last_log_id);
            if let Some(log_id) = last_log_id {
                self.next_index = log_id.index + 1;
                self.matched = log_id;
                let _ = self.raft_core_tx.send((
                    ReplicaEvent::UpdateMatchIndex {
                        target: self.target,
                        matched: log_id,
                    },
                    tracing::debug_span!("CH"),
                ));

                // If our outbound requests have accumulated too much while
                // running at line rate, the target can not keep up and we
                // must transition to lagging.
                let is_lagging = self
                    .last_log_index
                    .checked_sub(self.matched.index)
                    .map(|diff| diff > self.config.replication_lag_threshold)
                    .unwrap_or(false);
                if is_lagging {
                    self.target_state = TargetReplState::Lagging;
                }
            }
            return;
        }

        // Replication was not successful; if a newer term has been
        // returned, revert to follower.
        if res.term > self.term {
            tracing::debug!({ res.term }, "append entries failed, reverting to follower");
            let _ = self.raft_core_tx.send((
                ReplicaEvent::RevertToFollower {
                    target: self.target,
                    term: res.term,
                },
                tracing::debug_span!("CH"),
            ));
            self.target_state = TargetReplState::Shutdown;
            return;
        }

        // Replication was not successful; handle the conflict record.
        if let Some(conflict) = res.conflict_opt {
            tracing::debug!(?conflict, res.term, "append entries failed, handling conflict opt");

            // A conflict index above our last log index is a logical
            // error on the target's part; take no action.
            if conflict.log_id.index > self.last_log_index {
                return;
            }
            self.next_index = conflict.log_id.index + 1;
            self.matched = conflict.log_id;

            // Conflict index 0 means the target wants the log from the
            // start; there is nothing to look up.
            if conflict.log_id.index == 0 {
                self.target_state = TargetReplState::Lagging;
                let _ = self.raft_core_tx.send((
                    ReplicaEvent::UpdateMatchIndex {
                        target: self.target,
                        matched: self.matched,
                    },
                    tracing::debug_span!("CH"),
                ));
                return;
            }

            // Fetch the entry at the conflict index and use its actual
            // term, if we still have it.
            let ent = match self.storage.try_get_log_entry(conflict.log_id.index).await {
                Ok(x) => x,
                Err(err) => {
                    tracing::error!(error=?err, "error fetching log entry due to returned AppendEntries RPC conflict_opt");
                    let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            };
            match ent {
                Some(entry) => {
                    self.matched.term = entry.log_id.term;
                }
                None => {
                    // The entry was compacted away; the target needs a
                    // snapshot.
                    self.target_state = TargetReplState::Snapshotting;
                    let _ = self.raft_core_tx.send((
                        ReplicaEvent::UpdateMatchIndex {
                            target: self.target,
                            matched: self.matched,
                        },
                        tracing::debug_span!("CH"),
                    ));
                    return;
                }
            }

            let _ = self.raft_core_tx.send((
                ReplicaEvent::UpdateMatchIndex {
                    target: self.target,
                    matched: self.matched,
                },
                tracing::debug_span!("CH"),
            ));

            let diff = self.last_log_index - conflict.log_id.index;
            if diff >= self.config.max_log_entries {
                // Far enough behind that compaction will overtake it;
                // stream a snapshot instead of entries.
                self.target_state = TargetReplState::Snapshotting;
            } else {
                self.target_state = TargetReplState::Lagging;
            }
        }
    }

    /// Check if this stream is lagging far enough behind that only a
    /// snapshot can bring the target up to date.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn needs_snapshot(&self) -> bool {
        let needs =
            self.commit_index.checked_sub(self.matched.index).map(|diff| diff >= self.config.max_log_entries).unwrap_or(false);
        if needs {
            tracing::trace!("snapshot needed");
        }
        needs
    }

    /// Fully drain the channel coming in from the consensus core.
    pub(self) fn drain_raft_rx(&mut self, first: RaftEvent, span: Span) {
        let mut event_opt = Some((first, span));
        let mut iters = 0;
        loop {
            // Don't get stuck draining a REALLY hot replication feed.
            if iters > self.max_payload_entries {
                return;
            }

            let (event, span) = match event_opt.take() {
                Some(event) => event,
                None => return,
            };
            let _ent = span.enter();

            match event {
                RaftEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }
                RaftEvent::Replicate { entry, commit_index } => {
                    self.commit_index = commit_index;
                    self.last_log_index = entry.log_id.index;
                    if self.target_state == TargetReplState::LineRate {
                        self.replication_buffer.push(entry);
                    }
                }
                RaftEvent::Terminate => {
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            }

            if let Some(event_span) = self.repl_rx.recv().now_or_never() {
                event_opt = event_span;
            }
            iters += 1;
        }
    }
}

/// A type which wraps the two possible forms of an outbound entry.
enum OutboundEntry {
    /// An entry owned by an Arc, hot off the replication stream.
    Arc(Arc<Entry>),
    /// An entry which was fetched directly from storage.
    Raw(Entry),
}

impl AsRef<Entry> for OutboundEntry {
    fn as_ref(&self) -> &Entry {
        match self {
            Self::Arc(inner) => inner.as_ref(),
            Self::Raw(inner) => inner,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The state of a replication stream.
#[derive(Eq, PartialEq)]
enum TargetReplState {
    /// The stream is running at line rate.
    LineRate,
    /// The stream is lagging behind, feeding from storage.
    Lagging,
    /// The stream is sending the target a snapshot.
    Snapshotting,
    /// The stream is shutting down.
    Shutdown,
}

/// An event from the consensus core to a replication stream.
pub(crate) enum RaftEvent {
    Replicate {
        /// The most recent entry to have been appended to the log.
        entry: Arc<Entry>,
        /// The index of the highest entry known to be committed.
        commit_index: u64,
    },
    UpdateCommitIndex {
        commit_index: u64,
    },
    Terminate,
}

/// An event from a replication stream to the consensus core.
pub(crate) enum ReplicaEvent {
    /// The target's match index advanced.
    UpdateMatchIndex { target: NodeId, matched: LogId },
    /// A peer answered with a higher term; the leader must step down.
    RevertToFollower { target: NodeId, term: u64 },
    /// The stream needs the current snapshot to catch its target up.
    NeedsSnapshot {
        target: NodeId,
        tx: oneshot::Sender<Snapshot>,
    },
    /// A critical storage error; the node must shut down.
    Shutdown,
}

impl MessageSummary for ReplicaEvent {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                format!("UpdateMatchIndex: target: {}, matched: {}", target, matched)
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            ReplicaEvent::NeedsSnapshot { target, .. } => {
                format!("NeedsSnapshot: target: {}", target)
            }
            ReplicaEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}

impl<N: RaftNetwork> ReplicationCore<N> {
    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    pub async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            // Always prioritize draining the buffers first.
            let next_buf_index = self
                .outbound_buffer
                .first()
                .map(|entry| entry.as_ref().log_id.index)
                .or_else(|| self.replication_buffer.first().map(|entry| entry.log_id.index));

            // The buffers are cleared on entering the lagging state, which
            // may lose uncommitted entries; when they are empty, resend
            // everything from next_index so nothing is stranded.
            let index = match next_buf_index {
                Some(i) => i,
                None => self.last_log_index + 1,
            };

            // New data may have skipped this stream while transitioning
            // states; a single fetch from storage puts it back on track.
            if self.next_index != index {
                self.frontload_outbound_buffer(self.next_index, index).await;
                if self.target_state != TargetReplState::LineRate {
                    return;
                }
                self.send_append_entries().await;
                continue;
            }

            let span = tracing::debug_span!("CHrx:LineRate");
            let _en = span.enter();

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,
                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_raft_rx(event, span),
                        None => self.target_state = TargetReplState::Shutdown,
                    }
                }
            }
        }
    }

    /// Fill gaps in the outbound buffer left by a state transition.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn frontload_outbound_buffer(&mut self, start: u64, stop: u64) {
        // Entries below the compaction floor can only come via snapshot.
        if start < self.storage.first_log_index().await {
            self.target_state = TargetReplState::Snapshotting;
            return;
        }
        let entries = match self.storage.get_log_entries(start..stop).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error while frontloading outbound buffer");
                let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                return;
            }
        };

        // Prepend.
        self.outbound_buffer.reverse();
        self.outbound_buffer.extend(entries.into_iter().rev().map(OutboundEntry::Raw));
        self.outbound_buffer.reverse();
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "lagging"))]
    pub async fn lagging_loop(&mut self) {
        self.replication_buffer.clear();
        self.outbound_buffer.clear();
        loop {
            if self.target_state != TargetReplState::Lagging {
                return;
            }
            if self.needs_snapshot() {
                self.target_state = TargetReplState::Snapshotting;
                return;
            }

            if self.is_up_to_speed() {
                self.target_state = TargetReplState::LineRate;
                return;
            }
            self.prep_outbound_buffer_from_storage().await;
            if self.target_state != TargetReplState::Lagging {
                return;
            }
            self.send_append_entries().await;
            if self.is_up_to_speed() {
                self.target_state = TargetReplState::LineRate;
                return;
            }

            // Stay up to date with the consensus core, then loop.
            if let Some(Some((event, span))) = self.repl_rx.recv().now_or_never() {
                self.drain_raft_rx(event, span);
            }
        }
    }

    /// Check if this stream has caught up to the commit index.
    fn is_up_to_speed(&self) -> bool {
        self.next_index > self.commit_index
    }

    /// Prep the outbound buffer with the next payload from storage.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn prep_outbound_buffer_from_storage(&mut self) {
        if !self.outbound_buffer.is_empty() {
            return;
        }

        // Entries below the compaction floor are gone; snapshot instead.
        if self.next_index < self.storage.first_log_index().await {
            self.target_state = TargetReplState::Snapshotting;
            return;
        }

        // Underflow is guarded by the `is_up_to_speed` check in the outer
        // loop.
        let distance_behind = self.commit_index - self.next_index;
        let is_within_payload_distance = distance_behind <= self.max_payload_entries as u64;
        let stop_idx = if is_within_payload_distance {
            // After this payload the stream will be at line rate.
            self.target_state = TargetReplState::LineRate;
            self.commit_index + 1
        } else {
            self.next_index + self.max_payload_entries as u64 + 1
        };

        let entries = match self.storage.get_log_entries(self.next_index..stop_idx).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error fetching logs from storage");
                let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                self.target_state = TargetReplState::Shutdown;
                return;
            }
        };

        self.outbound_buffer.extend(entries.into_iter().map(OutboundEntry::Raw));
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Snapshot streaming specific state.
struct SnapshottingState<'a, N: RaftNetwork> {
    replication_core: &'a mut ReplicationCore<N>,
    snapshot: Option<Snapshot>,
    snapshot_fetch_rx: Option<oneshot::Receiver<Snapshot>>,
}

impl<'a, N: RaftNetwork> SnapshottingState<'a, N> {
    pub fn new(replication_core: &'a mut ReplicationCore<N>) -> Self {
        Self {
            replication_core,
            snapshot: None,
            snapshot_fetch_rx: None,
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshotting"))]
    pub async fn run(mut self) {
        self.replication_core.replication_buffer.clear();
        self.replication_core.outbound_buffer.clear();

        loop {
            if self.replication_core.target_state != TargetReplState::Snapshotting {
                return;
            }

            // Request the current snapshot from the consensus core if we
            // have neither a snapshot nor an outstanding request.
            if self.snapshot.is_none() && self.snapshot_fetch_rx.is_none() {
                let (tx, rx) = oneshot::channel();
                let _ = self.replication_core.raft_core_tx.send((
                    ReplicaEvent::NeedsSnapshot {
                        target: self.replication_core.target,
                        tx,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.snapshot_fetch_rx = Some(rx);
            }

            // Wait for the response, sending heartbeats in the meantime.
            if let Some(snapshot_fetch_rx) = self.snapshot_fetch_rx.take() {
                self.wait_for_snapshot(snapshot_fetch_rx).await;
                continue;
            }

            if let Some(snapshot) = self.snapshot.take() {
                if let Err(err) = self.stream_snapshot(snapshot).await {
                    tracing::warn!(error=%err, "error streaming snapshot to target");
                }
                continue;
            }
        }
    }

    /// Wait for a snapshot from the consensus core. If the channel closes
    /// the outer loop simply issues a new request.
    #[tracing::instrument(level = "trace", skip(self, rx))]
    async fn wait_for_snapshot(&mut self, mut rx: oneshot::Receiver<Snapshot>) {
        loop {
            let span = tracing::debug_span!("CHrx:wait_for_snapshot");
            let _ent = span.enter();

            tokio::select! {
                _ = self.replication_core.heartbeat.tick() => self.replication_core.send_append_entries().await,
                event_span = self.replication_core.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.replication_core.drain_raft_rx(event, span),
                        None => {
                            self.replication_core.target_state = TargetReplState::Shutdown;
                            return;
                        }
                    }
                },
                res = &mut rx => {
                    match res {
                        Ok(snapshot) => {
                            self.snapshot = Some(snapshot);
                            return;
                        }
                        Err(_) => return, // Channels may close for various acceptable reasons.
                    }
                },
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot), fields(snapshot_id=%snapshot.meta.snapshot_id))]
    async fn stream_snapshot(&mut self, mut snapshot: Snapshot) -> anyhow::Result<()> {
        let end = snapshot.snapshot.seek(SeekFrom::End(0)).await?;
        let mut offset = 0;

        self.replication_core.next_index = snapshot.meta.last_log_id.index + 1;
        self.replication_core.matched = snapshot.meta.last_log_id;
        let mut buf = Vec::with_capacity(self.replication_core.config.snapshot_max_chunk_size as usize);

        loop {
            snapshot.snapshot.seek(SeekFrom::Start(offset)).await?;
            let n_read = snapshot.snapshot.read_buf(&mut buf).await?;

            let done = (offset + n_read as u64) == end;
            let req = InstallSnapshotRequest {
                term: self.replication_core.term,
                leader_id: self.replication_core.id,
                meta: snapshot.meta.clone(),
                offset,
                data: Vec::from(&buf[..n_read]),
                done,
            };
            buf.clear();

            tracing::debug!(
                snapshot_size = req.data.len(),
                req.offset,
                end,
                req.done,
                "sending snapshot chunk"
            );

            let res = timeout(
                self.replication_core.install_snapshot_timeout,
                self.replication_core.network.send_install_snapshot(self.replication_core.target, req),
            )
            .await;

            let res = match res {
                Ok(Ok(res)) => res,
                Ok(Err(err)) => {
                    tracing::warn!(error=%err, "error sending InstallSnapshot RPC to target");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(error=%err, "timeout while sending InstallSnapshot RPC to target");
                    continue;
                }
            };

            // A higher term in the response means this leader is deposed.
            if res.term > self.replication_core.term {
                let _ = self.replication_core.raft_core_tx.send((
                    ReplicaEvent::RevertToFollower {
                        target: self.replication_core.target,
                        term: res.term,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.replication_core.target_state = TargetReplState::Shutdown;
                return Ok(());
            }

            // The last chunk is out; fall back to lagging, which will
            // resume entry replication past the snapshot.
            if done {
                self.replication_core.target_state = TargetReplState::Lagging;
                let _ = self.replication_core.raft_core_tx.send((
                    ReplicaEvent::UpdateMatchIndex {
                        target: self.replication_core.target,
                        matched: self.replication_core.matched,
                    },
                    tracing::debug_span!("CH"),
                ));
                return Ok(());
            }

            offset += n_read as u64;

            // Stay up to date with the consensus core, then loop.
            if let Some(Some((event, span))) = self.replication_core.repl_rx.recv().now_or_never() {
                self.replication_core.drain_raft_rx(event, span);
            }
        }
    }
}
