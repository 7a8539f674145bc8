//! Public interface to a running replikv node, and the message types it
//! exchanges with its peers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::ClusterState;
use crate::core::RaftCore;
use crate::core::State;
use crate::error::AddrParseError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::JoinError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::net::RaftNetwork;
use crate::storage::KvStore;
use crate::storage::SnapshotMeta;
use crate::store::KvCommand;
use crate::store::KvResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// A `host:port` pair identifying where a node can be reached.
///
/// Hosts are limited to 255 bytes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for NodeAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| AddrParseError::Invalid(s.to_string()))?;
        if host.is_empty() {
            return Err(AddrParseError::Invalid(s.to_string()));
        }
        if host.len() > 255 {
            return Err(AddrParseError::HostTooLong(host.len()));
        }
        let port = port.parse::<u16>().map_err(|_| AddrParseError::Invalid(s.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The membership configuration of the cluster: every voting member and the
/// address it can be reached at.
///
/// Addresses travel with the config so that any node can issue a MOVED
/// redirect naming the current leader, and so a snapshot carries enough
/// information for a restarting node to re-establish its peer connections.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    pub members: BTreeMap<NodeId, NodeAddr>,
}

impl MembershipConfig {
    /// Create a new initial config containing only the given node.
    pub fn new_initial(id: NodeId, addr: NodeAddr) -> Self {
        let mut members = BTreeMap::new();
        members.insert(id, addr);
        Self { members }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains_key(id)
    }

    pub fn addr_of(&self, id: &NodeId) -> Option<&NodeAddr> {
        self.members.get(id)
    }

    /// All member ids.
    pub fn all_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,
    pub payload: EntryPayload,
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl MessageSummary for &[Entry] {
    fn summary(&self) -> String {
        self.iter().map(|x| x.summary()).collect::<Vec<_>>().join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A replicated client command.
    Normal(KvCommand),
    /// A cluster membership change.
    ConfigChange(MembershipConfig),
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(cmd) => format!("normal: {}", cmd.summary()),
            EntryPayload::ConfigChange(m) => {
                format!("config-change: {:?}", m.members.keys().collect::<Vec<_>>())
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the cluster leader to replicate log entries, and as a
/// heartbeat.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,
    /// The cluster dbid. A node joining with no state adopts it on first
    /// contact; a node with state rejects mismatches.
    pub dbid: String,
    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,
    /// The new log entries to store. Empty for heartbeats.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for the leader to update itself.
    pub term: u64,
    /// True if the follower contained an entry matching `prev_log_id`.
    pub success: bool,
    /// The conflicting-term optimization: the most recent entry which does
    /// not conflict with the received request. Only meaningful when
    /// `success` is false.
    pub conflict_opt: Option<ConflictOpt>,
}

/// See [`AppendEntriesResponse::conflict_opt`].
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictOpt {
    pub log_id: LogId,
}

/// An RPC sent by candidates to gather votes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The id of the candidate's last log entry.
    pub last_log_id: LogId,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node.
    pub term: u64,
    /// True if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

/// An RPC sent by the leader to bring a lagging or restarting node
/// up-to-speed with a snapshot of the dataset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader_id: NodeId,
    /// Metadata of the snapshot being installed.
    pub meta: SnapshotMeta,
    /// The byte offset where this chunk is positioned in the snapshot.
    pub offset: u64,
    /// The raw bytes of the snapshot chunk, starting at `offset`.
    pub data: Vec<u8>,
    /// True if this is the last chunk in the snapshot.
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, meta={:?}, offset={}, len={}, done={}",
            self.term,
            self.leader_id,
            self.meta,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for the leader to update itself.
    pub term: u64,
}

/// A request from a joining node asking the cluster to add it as a member.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddNodeRequest {
    pub id: NodeId,
    pub addr: NodeAddr,
}

/// The answer to an [`AddNodeRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AddNodeResponse {
    /// The membership change committed; the node is a member. Carries the
    /// cluster dbid for the joining node to adopt.
    Added { dbid: String },
    /// The contacted node is not the leader; retry at the given address.
    Moved { leader: Option<NodeAddr> },
    /// The cluster rejected the request (duplicate id, change in
    /// progress, ...).
    Rejected { reason: String },
}

/// The response to a committed client write.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse {
    /// The log index at which the command committed.
    pub index: u64,
    /// The reply produced by applying the command to the dataset.
    pub data: KvResponse,
}

/// A point-in-time human-readable status report, the `RAFT.INFO` payload.
#[derive(Clone, Debug)]
pub struct InfoReport {
    pub id: NodeId,
    pub dbid: String,
    pub cluster_state: ClusterState,
    pub state: State,
    pub current_term: u64,
    pub current_leader: Option<NodeId>,
    pub leader_addr: Option<NodeAddr>,
    pub last_log_index: u64,
    pub last_applied: LogId,
    pub snapshot_last: LogId,
    pub membership: MembershipConfig,
}

impl fmt::Display for InfoReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "node_id:{}", self.id)?;
        writeln!(f, "dbid:{}", self.dbid)?;
        writeln!(f, "cluster_state:{}", self.cluster_state)?;
        writeln!(f, "role:{:?}", self.state)?;
        writeln!(f, "current_term:{}", self.current_term)?;
        match (&self.current_leader, &self.leader_addr) {
            (Some(id), Some(addr)) => writeln!(f, "leader:{} {}", id, addr)?,
            (Some(id), None) => writeln!(f, "leader:{}", id)?,
            _ => writeln!(f, "leader:none")?,
        }
        writeln!(f, "last_log_index:{}", self.last_log_index)?;
        writeln!(f, "last_applied:{}", self.last_applied)?;
        writeln!(f, "snapshot_last:{}", self.snapshot_last)?;
        write!(f, "members:")?;
        for (i, (id, addr)) in self.membership.members.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}@{}", id, addr)?;
        }
        writeln!(f)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) type ClientWriteResponseTx = oneshot::Sender<Result<ClientWriteResponse, ClientWriteError>>;
pub(crate) type ResponseTx = oneshot::Sender<Result<u64, ResponseError>>;

/// A request traveling over the queue into the consensus task.
pub(crate) enum RaftMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<RaftResult<AppendEntriesResponse>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<RaftResult<VoteResponse>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<RaftResult<InstallSnapshotResponse>>,
    },
    ClientWrite {
        cmd: KvCommand,
        tx: ClientWriteResponseTx,
    },
    ClusterInit {
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    ClusterJoin {
        addrs: Vec<NodeAddr>,
        tx: oneshot::Sender<Result<(), JoinError>>,
    },
    AddNode {
        id: NodeId,
        addr: NodeAddr,
        tx: ResponseTx,
    },
    RemoveNode {
        id: NodeId,
        tx: ResponseTx,
    },
    Info {
        tx: oneshot::Sender<InfoReport>,
    },
    Compact {
        tx: oneshot::Sender<RaftResult<LogId>>,
    },
    /// Internal: the join task finished walking the address list. On
    /// acceptance, carries the cluster dbid learned from the leader.
    JoinFinished { dbid: Option<String> },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

struct RaftInner<N: RaftNetwork> {
    tx_api: mpsc::UnboundedSender<(RaftMsg, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
}

/// The public handle to a running replikv node.
///
/// One consensus task is spawned per handle; all interaction goes through
/// the internal request queue, so this type is cheap to clone and every
/// clone refers to the same node.
///
/// If any of the interfaces returns `RaftError::ShuttingDown`, the node is
/// going down (possibly for data safety reasons after a storage error) and
/// `shutdown` should be awaited.
pub struct Raft<N: RaftNetwork> {
    inner: Arc<RaftInner<N>>,
}

impl<N: RaftNetwork> Raft<N> {
    /// Create and spawn a new node.
    ///
    /// `id` must be stable across restarts of this node, and `addr` is the
    /// address peers and redirected clients will use to reach it.
    #[tracing::instrument(level="debug", skip(config, network, storage), fields(cluster=%config.cluster_name))]
    pub fn new(id: NodeId, addr: NodeAddr, config: Arc<Config>, network: Arc<N>, storage: Arc<KvStore>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(
            id,
            addr,
            config,
            network,
            storage,
            tx_api.clone(),
            rx_api,
            tx_metrics,
            rx_shutdown,
        );
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    async fn call<T>(
        &self,
        msg: RaftMsg,
        rx: oneshot::Receiver<RaftResult<T>>,
    ) -> RaftResult<T> {
        let span = tracing::debug_span!("CH");
        self.inner.tx_api.send((msg, span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit an AppendEntries RPC to this node.
    ///
    /// Sent by the cluster leader to replicate log entries, and as a
    /// heartbeat.
    #[tracing::instrument(level="debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a RequestVote RPC to this node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::RequestVote { rpc, tx }, rx).await
    }

    /// Submit an InstallSnapshot RPC to this node.
    ///
    /// Sent by the cluster leader to bring a new or lagging node
    /// up-to-speed.
    #[tracing::instrument(level="debug", skip(self, rpc), fields(snapshot_id=%rpc.meta.last_log_id))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::InstallSnapshot { rpc, tx }, rx).await
    }

    /// Submit a client command to be replicated.
    ///
    /// The command is appended to the log, committed to the cluster, and
    /// applied to the dataset; the apply result is returned. Submitting to
    /// a non-leader fails with `ForwardToLeader` carrying the leader's
    /// address.
    #[tracing::instrument(level="debug", skip(self, cmd), fields(cmd=%cmd.summary()))]
    pub async fn client_write(&self, cmd: KvCommand) -> Result<ClientWriteResponse, ClientWriteError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClientWrite { cmd, tx }, span))
            .map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?;
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(ClientWriteError::RaftError(RaftError::ShuttingDown)),
        }
    }

    /// Initialize a new cluster of one with a fresh dbid.
    ///
    /// Valid only on a pristine node; afterwards the node is a single-node
    /// leader and the cluster state is Up. Additional members are brought
    /// in with `add_node` (or by running `cluster_join` on them).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn cluster_init(&self) -> Result<(), InitializeError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClusterInit { tx }, span))
            .map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Ask an existing cluster to adopt this node.
    ///
    /// The given addresses are contacted in order; MOVED redirects grow the
    /// list. Returns once the cluster has committed the membership change,
    /// or with `JoinError::Timeout` after a full pass of unreachable
    /// addresses.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn cluster_join(&self, addrs: Vec<NodeAddr>) -> Result<(), JoinError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClusterJoin { addrs, tx }, span))
            .map_err(|_| JoinError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| JoinError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Propose adding a node to the cluster. Leader only.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn add_node(&self, id: NodeId, addr: NodeAddr) -> Result<(), ResponseError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::AddNode { id, addr, tx }, span))
            .map_err(|_| ResponseError::Raft(RaftError::ShuttingDown))?;
        match rx.await {
            Ok(res) => res.map(|_| ()),
            Err(e) => {
                tracing::error!("recv rx error: {}", e);
                Err(ResponseError::Raft(RaftError::ShuttingDown))
            }
        }
    }

    /// Propose removing a node from the cluster. Leader only.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove_node(&self, id: NodeId) -> Result<(), ResponseError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::RemoveNode { id, tx }, span))
            .map_err(|_| ResponseError::Raft(RaftError::ShuttingDown))?;
        match rx.await {
            Ok(res) => res.map(|_| ()),
            Err(e) => {
                tracing::error!("recv rx error: {}", e);
                Err(ResponseError::Raft(RaftError::ShuttingDown))
            }
        }
    }

    /// Fetch a human-readable status report.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn info(&self) -> RaftResult<InfoReport> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((RaftMsg::Info { tx }, span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Force a snapshot of the dataset and compact the log.
    ///
    /// If a snapshot is already in progress the call completes when that
    /// snapshot does. Returns the log id covered by the snapshot.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn compact(&self) -> RaftResult<LogId> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::Compact { tx }, rx).await
    }

    /// Get the ID of the current leader as this node sees it.
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = timeout.unwrap_or_else(|| Duration::from_millis(500));
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this node: stop accepting requests, fail pending replies,
    /// sync the log, and join the consensus task.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<N: RaftNetwork> Clone for Raft<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
