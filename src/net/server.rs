//! The accept side of the peer transport: decode inbound frames, hand
//! them to the node through its public handle, write the reply back.

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

use crate::error::ChangeConfigError;
use crate::error::ResponseError;
use crate::net::codec;
use crate::net::codec::RpcRequest;
use crate::net::codec::RpcResponse;
use crate::net::RaftNetwork;
use crate::raft::AddNodeResponse;
use crate::raft::Raft;

/// Serve inter-node RPCs on `listener` until the listener fails or the
/// task is dropped.
pub async fn serve<N: RaftNetwork>(listener: TcpListener, raft: Raft<N>) -> Result<()> {
    loop {
        let (sock, remote) = listener.accept().await?;
        let _ = sock.set_nodelay(true);
        let raft = raft.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(sock, raft).await {
                tracing::debug!(%remote, error=%err, "peer connection closed");
            }
        });
    }
}

async fn handle_conn<N: RaftNetwork>(mut sock: TcpStream, raft: Raft<N>) -> Result<()> {
    loop {
        let req: RpcRequest = codec::read_frame(&mut sock).await?;
        let resp = dispatch(&raft, req).await;
        codec::write_frame(&mut sock, &resp).await?;
    }
}

async fn dispatch<N: RaftNetwork>(raft: &Raft<N>, req: RpcRequest) -> RpcResponse {
    match req {
        RpcRequest::AppendEntries { rpc, .. } => match raft.append_entries(rpc).await {
            Ok(resp) => RpcResponse::AppendEntries(resp),
            Err(err) => RpcResponse::Error(err.to_string()),
        },
        RpcRequest::Vote { rpc, .. } => match raft.vote(rpc).await {
            Ok(resp) => RpcResponse::Vote(resp),
            Err(err) => RpcResponse::Error(err.to_string()),
        },
        RpcRequest::InstallSnapshot { rpc, .. } => match raft.install_snapshot(rpc).await {
            Ok(resp) => RpcResponse::InstallSnapshot(resp),
            Err(err) => RpcResponse::Error(err.to_string()),
        },
        RpcRequest::AddNode(req) => match raft.add_node(req.id, req.addr).await {
            Ok(()) => {
                let dbid = match raft.info().await {
                    Ok(info) => info.dbid,
                    Err(err) => return RpcResponse::Error(err.to_string()),
                };
                RpcResponse::AddNode(AddNodeResponse::Added { dbid })
            }
            Err(ResponseError::ChangeConfig(ChangeConfigError::NodeNotLeader(leader))) => {
                let rx = raft.metrics();
                let leader_addr = {
                    let metrics = rx.borrow();
                    leader.and_then(|id| metrics.membership_config.addr_of(&id).cloned())
                };
                RpcResponse::AddNode(AddNodeResponse::Moved { leader: leader_addr })
            }
            Err(err) => RpcResponse::AddNode(AddNodeResponse::Rejected { reason: err.to_string() }),
        },
        RpcRequest::RemoveNode { id } => match raft.remove_node(id).await {
            Ok(()) => RpcResponse::RemoveNode,
            Err(err) => RpcResponse::Error(err.to_string()),
        },
    }
}
