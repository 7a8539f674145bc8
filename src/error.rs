//! Error types exposed by this crate.

use std::time::Duration;

use thiserror::Error;

use crate::core::ClusterState;
use crate::raft::NodeAddr;
use crate::NodeId;
use crate::SnapshotSegmentId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors originating from the consensus core itself.
///
/// Storage errors are fatal: the node steps down and terminates rather than
/// risk silently losing committed entries.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The node is in the process of shutting down.
    #[error("raft node is shutting down")]
    ShuttingDown,
    /// The node has no cluster state yet and can not serve this request.
    #[error("cluster is not initialized")]
    Uninitialized,
    /// An error with the persistent log or dataset.
    #[error("error with raft storage: {0}")]
    Storage(anyhow::Error),
    /// An error coming from the network layer.
    #[error("error with the network: {0}")]
    Network(anyhow::Error),
    /// An RPC arrived carrying a snapshot segment which does not line up
    /// with the segment stream being received.
    #[error("snapshot segment id mismatch, expect: {expect}, got: {got}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },
    /// A low-level I/O error.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// An error related to a client write request.
#[derive(Debug, Error)]
pub enum ClientWriteError {
    /// The write was submitted to a node which is not the leader.
    ///
    /// Carries the current leader's id and address, when known, so the
    /// client can redirect — the MOVED reply of the command surface.
    #[error("moved: leader is {leader_id:?} at {leader_addr:?}")]
    ForwardToLeader {
        leader_id: Option<NodeId>,
        leader_addr: Option<NodeAddr>,
    },
    /// The cluster is not in a state which accepts commands.
    #[error("cluster is not ready to accept commands (state: {0})")]
    ClusterState(ClusterState),
    #[error("{0}")]
    RaftError(#[from] RaftError),
}

/// An error related to a cluster membership change.
#[derive(Debug, Error)]
pub enum ChangeConfigError {
    /// The node received a membership change request but is not the leader.
    #[error("this node is not the raft leader, current leader: {0:?}")]
    NodeNotLeader(Option<NodeId>),
    /// A membership change is already in flight; only one uncommitted
    /// change is allowed at a time.
    #[error("a cluster membership change is already in progress")]
    ChangeInProgress,
    /// The requested change would have no effect.
    #[error("membership change would have no effect")]
    Noop,
    /// The node to remove is not a member of the cluster.
    #[error("node {0} is not a cluster member")]
    NodeNotFound(NodeId),
    /// The proposed change would leave the cluster without members.
    #[error("membership change would leave the cluster inoperable")]
    InoperableConfig,
    #[error("{0}")]
    RaftError(#[from] RaftError),
}

/// The set of errors which may take place when requesting to propose a
/// config change or when answering an admin request in general.
#[derive(Debug, Error, derive_more::From)]
pub enum ResponseError {
    #[error("{0}")]
    Raft(RaftError),
    #[error("{0}")]
    ChangeConfig(ChangeConfigError),
}

/// An error related to cluster initialization.
#[derive(Debug, Error)]
pub enum InitializeError {
    /// The cluster is already initialized or has existing state.
    #[error("cluster is already initialized or has existing raft state")]
    NotAllowed,
    #[error("{0}")]
    RaftError(#[from] RaftError),
}

/// An error related to a cluster join attempt.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The node is not in a state which allows joining a cluster.
    #[error("node has existing raft state and can not join a cluster")]
    NotAllowed,
    /// Every address in the join list failed with a network error over a
    /// full pass of the list.
    #[error("timed out contacting cluster: all join addresses unreachable")]
    Timeout,
    /// The cluster rejected the join request.
    #[error("cluster rejected join request: {0}")]
    Rejected(String),
    #[error("{0}")]
    RaftError(#[from] RaftError),
}

/// A parse failure for a `host:port` node address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrParseError {
    #[error("invalid node address: {0:?}")]
    Invalid(String),
    #[error("node address host exceeds 255 bytes ({0})")]
    HostTooLong(usize),
}

/// Errors from validating a `Config`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("election timeout min ({min}) must be < max ({max})")]
    ElectionTimeout { min: u64, max: u64 },
    #[error("election timeout min ({election_timeout_min}) must be > raft interval ({raft_interval})")]
    ElectionTimeoutLTTick {
        election_timeout_min: u64,
        raft_interval: u64,
    },
    #[error("max_payload_entries must not be 0")]
    MaxPayloadIs0,
    #[error("max_log_entries must not be 0")]
    MaxLogEntriesIs0,
}

/// An error from waiting on a metrics condition.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("raft node is shutting down")]
    ShuttingDown,
}
