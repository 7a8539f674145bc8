//! The peer connection manager.
//!
//! One [`Peer`] record is kept per remote node, moving through the
//! connection lifecycle:
//!
//! ```text
//! Disconnected ──connect──▶ Resolving ──resolved──▶ Connecting ──ok──▶ Connected
//!      ▲                        │ fail                   │ fail
//!      │                        ▼                        ▼
//!      └──────────────────── ConnectError ◀──────────────┘
//! ```
//!
//! A reconnect pass runs every `reconnect_interval` ms and re-dials every
//! idle, non-terminating peer. A connected peer falls back to Disconnected
//! when its connection reports an error; terminating peers are dropped
//! once idle.
//!
//! Outbound RPCs are only issued to Connected peers. In any other state
//! they fail fast, and the consensus layer retries on its next heartbeat.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::timeout;

use crate::config::Config;
use crate::metrics::RaftMetrics;
use crate::net::codec;
use crate::net::codec::RpcRequest;
use crate::net::codec::RpcResponse;
use crate::net::RaftNetwork;
use crate::raft::AddNodeRequest;
use crate::raft::AddNodeResponse;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::MembershipConfig;
use crate::raft::NodeAddr;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::NodeId;

/// Where a peer is in its connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Resolving,
    Connecting,
    Connected,
    ConnectError,
}

impl PeerState {
    /// Idle states are the ones the reconnect pass acts on.
    fn is_idle(&self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::ConnectError)
    }
}

struct Peer {
    id: NodeId,
    addr: NodeAddr,
    state: PeerState,
    terminating: bool,
    conn: Option<TcpStream>,
}

/// Maintains the peer records and implements [`RaftNetwork`] over them.
pub struct PeerManager {
    node_id: NodeId,
    config: Arc<Config>,
    peers: RwLock<BTreeMap<NodeId, Arc<Mutex<Peer>>>>,
}

impl PeerManager {
    pub fn new(node_id: NodeId, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            config,
            peers: RwLock::new(BTreeMap::new()),
        })
    }

    /// Spawn the reconnect timer: every `reconnect_interval` ms, drop
    /// terminating idle peers and re-dial the remaining idle ones.
    pub fn spawn_reconnect_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(this.config.reconnect_interval));
            loop {
                ticker.tick().await;
                this.handle_node_states().await;
            }
        })
    }

    /// Spawn a task which reconciles the peer set against the node's
    /// membership as published on the metrics channel.
    pub fn spawn_membership_sync(self: &Arc<Self>, mut rx: watch::Receiver<RaftMetrics>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let membership = rx.borrow().membership_config.clone();
                this.set_membership(&membership).await;
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    /// Reconcile the peer records against a membership config: absent
    /// members are added as Disconnected, removed members are flagged
    /// terminating.
    pub async fn set_membership(&self, membership: &MembershipConfig) {
        let mut peers = self.peers.write().await;
        for (id, addr) in &membership.members {
            if *id == self.node_id {
                continue;
            }
            match peers.get(id) {
                Some(peer) => {
                    let mut peer = peer.lock().await;
                    peer.terminating = false;
                    if &peer.addr != addr {
                        tracing::info!(peer=*id, old=%peer.addr, new=%addr, "peer address changed");
                        peer.addr = addr.clone();
                        peer.conn = None;
                        peer.state = PeerState::Disconnected;
                    }
                }
                None => {
                    tracing::info!(peer=*id, addr=%addr, "tracking new peer");
                    peers.insert(
                        *id,
                        Arc::new(Mutex::new(Peer {
                            id: *id,
                            addr: addr.clone(),
                            state: PeerState::Disconnected,
                            terminating: false,
                            conn: None,
                        })),
                    );
                }
            }
        }
        for (id, peer) in peers.iter() {
            if !membership.contains(id) {
                let mut peer = peer.lock().await;
                if !peer.terminating {
                    tracing::info!(peer=*id, "peer removed from cluster, terminating");
                    peer.terminating = true;
                    peer.conn = None;
                    peer.state = PeerState::Disconnected;
                }
            }
        }
    }

    /// One reconnect pass over all peers.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn handle_node_states(self: &Arc<Self>) {
        let snapshot: Vec<Arc<Mutex<Peer>>> = {
            let mut peers = self.peers.write().await;
            let mut drop_ids = Vec::new();
            for (id, peer) in peers.iter() {
                if let Ok(peer) = peer.try_lock() {
                    if peer.terminating && peer.state.is_idle() {
                        drop_ids.push(*id);
                    }
                }
            }
            for id in drop_ids {
                tracing::debug!(peer = id, "dropping terminated peer");
                peers.remove(&id);
            }
            peers.values().cloned().collect()
        };

        for peer in snapshot {
            let config = self.config.clone();
            tokio::spawn(async move {
                let mut guard = peer.lock().await;
                if guard.terminating || !guard.state.is_idle() {
                    return;
                }
                connect_peer(&mut guard, &config).await;
            });
        }
    }

    /// Issue a request to a connected peer and await its response, under
    /// the per-request timeout. Any failure tears the connection down;
    /// the reconnect timer will bring it back.
    async fn call(&self, target: NodeId, req: RpcRequest) -> Result<RpcResponse> {
        let peer = {
            let peers = self.peers.read().await;
            peers.get(&target).cloned().with_context(|| format!("unknown peer {}", target))?
        };
        let mut peer = peer.lock().await;
        if peer.state != PeerState::Connected {
            bail!("peer {} is not connected (state: {:?})", target, peer.state);
        }
        let conn = peer.conn.as_mut().context("connected peer has no stream")?;

        let ttl = Duration::from_millis(self.config.request_timeout);
        let res = timeout(ttl, async {
            codec::write_frame(conn, &req).await?;
            codec::read_frame::<_, RpcResponse>(conn).await
        })
        .await;

        match res {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(err)) => {
                tracing::debug!(peer=target, error=%err, "peer call failed, disconnecting");
                peer.conn = None;
                peer.state = PeerState::Disconnected;
                Err(err)
            }
            Err(_) => {
                tracing::debug!(peer = target, "peer call timed out, disconnecting");
                peer.conn = None;
                peer.state = PeerState::Disconnected;
                bail!("request to peer {} timed out", target)
            }
        }
    }

    /// The connection state of a peer, for status reporting and tests.
    pub async fn peer_state(&self, id: NodeId) -> Option<PeerState> {
        let peers = self.peers.read().await;
        match peers.get(&id) {
            Some(peer) => Some(peer.lock().await.state),
            None => None,
        }
    }
}

/// Walk one peer through resolve → connect.
async fn connect_peer(peer: &mut Peer, config: &Config) {
    peer.state = PeerState::Resolving;
    let resolved = match tokio::net::lookup_host((peer.addr.host.as_str(), peer.addr.port)).await {
        Ok(mut addrs) => addrs.next(),
        Err(err) => {
            tracing::debug!(peer=peer.id, addr=%peer.addr, error=%err, "peer resolution failed");
            peer.state = PeerState::ConnectError;
            return;
        }
    };
    let sockaddr = match resolved {
        Some(a) => a,
        None => {
            tracing::debug!(peer=peer.id, addr=%peer.addr, "peer resolved to no addresses");
            peer.state = PeerState::ConnectError;
            return;
        }
    };

    peer.state = PeerState::Connecting;
    let ttl = Duration::from_millis(config.request_timeout);
    match timeout(ttl, TcpStream::connect(sockaddr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            tracing::debug!(peer=peer.id, addr=%peer.addr, "peer connected");
            peer.conn = Some(stream);
            peer.state = PeerState::Connected;
        }
        Ok(Err(err)) => {
            tracing::debug!(peer=peer.id, addr=%peer.addr, error=%err, "peer connect failed");
            peer.state = PeerState::ConnectError;
        }
        Err(_) => {
            tracing::debug!(peer=peer.id, addr=%peer.addr, "peer connect timed out");
            peer.state = PeerState::ConnectError;
        }
    }
}

/// Dial an arbitrary address for a one-shot request, outside the managed
/// peer set. Used by the join flow, which knows addresses but not ids.
async fn call_addr(addr: &NodeAddr, req: &RpcRequest, ttl: Duration) -> Result<RpcResponse> {
    let fut = async {
        let mut stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
        codec::write_frame(&mut stream, req).await?;
        codec::read_frame::<_, RpcResponse>(&mut stream).await
    };
    match timeout(ttl, fut).await {
        Ok(res) => res,
        Err(_) => bail!("request to {} timed out", addr),
    }
}

#[async_trait]
impl RaftNetwork for PeerManager {
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let resp = self.call(target, RpcRequest::AppendEntries { src: self.node_id, rpc }).await?;
        match resp {
            RpcResponse::AppendEntries(resp) => Ok(resp),
            RpcResponse::Error(err) => bail!("append entries rejected by peer {}: {}", target, err),
            other => bail!("unexpected response frame: {:?}", other),
        }
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let resp = self.call(target, RpcRequest::Vote { src: self.node_id, rpc }).await?;
        match resp {
            RpcResponse::Vote(resp) => Ok(resp),
            RpcResponse::Error(err) => bail!("vote rejected by peer {}: {}", target, err),
            other => bail!("unexpected response frame: {:?}", other),
        }
    }

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        // Snapshot segments are large; give them the coarser timeout.
        let peer = {
            let peers = self.peers.read().await;
            peers.get(&target).cloned().with_context(|| format!("unknown peer {}", target))?
        };
        let mut peer = peer.lock().await;
        if peer.state != PeerState::Connected {
            bail!("peer {} is not connected (state: {:?})", target, peer.state);
        }
        let conn = peer.conn.as_mut().context("connected peer has no stream")?;
        let ttl = Duration::from_millis(self.config.install_snapshot_timeout);
        let req = RpcRequest::InstallSnapshot { src: self.node_id, rpc };
        let res = timeout(ttl, async {
            codec::write_frame(conn, &req).await?;
            codec::read_frame::<_, RpcResponse>(conn).await
        })
        .await;
        let resp = match res {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                peer.conn = None;
                peer.state = PeerState::Disconnected;
                return Err(err);
            }
            Err(_) => {
                peer.conn = None;
                peer.state = PeerState::Disconnected;
                bail!("snapshot segment to peer {} timed out", target)
            }
        };
        match resp {
            RpcResponse::InstallSnapshot(resp) => Ok(resp),
            RpcResponse::Error(err) => bail!("snapshot rejected by peer {}: {}", target, err),
            other => bail!("unexpected response frame: {:?}", other),
        }
    }

    async fn send_add_node(&self, target: &NodeAddr, rpc: AddNodeRequest) -> Result<AddNodeResponse> {
        // Membership changes wait for a commit round; give them the
        // coarser timeout.
        let ttl = Duration::from_millis(self.config.install_snapshot_timeout);
        let resp = call_addr(target, &RpcRequest::AddNode(rpc), ttl).await?;
        match resp {
            RpcResponse::AddNode(resp) => Ok(resp),
            RpcResponse::Error(err) => bail!("add-node rejected by {}: {}", target, err),
            other => bail!("unexpected response frame: {:?}", other),
        }
    }
}
