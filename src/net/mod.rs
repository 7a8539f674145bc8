//! Networking: the transport seam used by the consensus core, plus the
//! TCP implementation of it.
//!
//! The consensus core sends RPCs through the [`RaftNetwork`] trait and
//! never touches sockets itself. Production nodes use [`PeerManager`],
//! which maintains one managed connection per peer; tests swap in an
//! in-process router.

mod codec;
mod peer;
mod server;

pub use codec::RpcRequest;
pub use codec::RpcResponse;
pub use peer::PeerManager;
pub use peer::PeerState;
pub use server::serve;

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AddNodeRequest;
use crate::raft::AddNodeResponse;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::NodeAddr;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::NodeId;

/// The interface the consensus core uses for sending RPCs to peers.
///
/// Errors are transient from the protocol's point of view: a failed or
/// timed-out send is simply retried by the next heartbeat or election
/// round.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target node.
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target node.
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send an InstallSnapshot RPC to the target node.
    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    /// Ask the node at `target` to add us to its cluster. Addressed by
    /// address rather than id: a joining node does not know ids yet.
    async fn send_add_node(&self, target: &NodeAddr, rpc: AddNodeRequest) -> Result<AddNodeResponse>;
}
