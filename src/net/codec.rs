//! Wire format for inter-node RPCs: 4-byte big-endian length prefix
//! followed by a JSON-encoded tagged frame. One request, one response,
//! in order, per connection.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use crate::raft::AddNodeRequest;
use crate::raft::AddNodeResponse;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::NodeId;

/// Frames larger than this are treated as protocol violations. Snapshot
/// chunks are bounded well below it by `snapshot_max_chunk_size`.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// A request frame.
#[derive(Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    AppendEntries { src: NodeId, rpc: AppendEntriesRequest },
    Vote { src: NodeId, rpc: VoteRequest },
    InstallSnapshot { src: NodeId, rpc: InstallSnapshotRequest },
    AddNode(AddNodeRequest),
    RemoveNode { id: NodeId },
}

/// A response frame.
#[derive(Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    AppendEntries(AppendEntriesResponse),
    Vote(VoteResponse),
    InstallSnapshot(InstallSnapshotResponse),
    AddNode(AddNodeResponse),
    RemoveNode,
    /// The remote failed to process the request.
    Error(String),
}

pub(crate) async fn write_frame<W, T>(w: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let raw = serde_json::to_vec(frame)?;
    if raw.len() as u64 > MAX_FRAME_LEN as u64 {
        bail!("outgoing frame of {} bytes exceeds the maximum", raw.len());
    }
    w.write_all(&(raw.len() as u32).to_be_bytes()).await?;
    w.write_all(&raw).await?;
    w.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R, T>(r: &mut R) -> Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await.context("reading frame length")?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_LEN {
        bail!("incoming frame of {} bytes exceeds the maximum", len);
    }
    let mut raw = BytesMut::with_capacity(len as usize);
    raw.resize(len as usize, 0);
    r.read_exact(&mut raw[..]).await.context("reading frame body")?;
    Ok(serde_json::from_slice(&raw)?)
}
