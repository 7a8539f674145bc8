mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use replikv::net;
use replikv::net::PeerManager;
use replikv::raft::NodeAddr;
use replikv::raft::Raft;
use replikv::storage::KvStore;
use replikv::store::KvCommand;
use replikv::store::KvResponse;
use replikv::Config;
use replikv::NodeId;
use replikv::State;
use tempfile::TempDir;
use tokio::net::TcpListener;

struct TcpNode {
    raft: Raft<PeerManager>,
    addr: NodeAddr,
    _dir: TempDir,
}

/// Bring up a node with the real TCP transport: a listener serving
/// inter-node RPCs, a peer manager dialing outward, and the membership
/// sync keeping the peer set aligned with the cluster config.
async fn spawn_tcp_node(id: NodeId, config: Arc<Config>) -> Result<TcpNode> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let addr = NodeAddr::new("127.0.0.1", port);

    let dir = tempfile::tempdir()?;
    let storage = Arc::new(KvStore::new_in_dir(id, dir.path()));
    let peers = PeerManager::new(id, config.clone());
    let raft = Raft::new(id, addr.clone(), config, peers.clone(), storage);

    peers.spawn_reconnect_loop();
    peers.spawn_membership_sync(raft.metrics());
    let server_raft = raft.clone();
    tokio::spawn(async move {
        let _ = net::serve(listener, server_raft).await;
    });

    Ok(TcpNode { raft, addr, _dir: dir })
}

/// A two-node cluster over real sockets: init, join over TCP, replicate,
/// and redirect.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn two_nodes_over_tcp() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("tcp-test".into()).validate()?);
    let n1 = spawn_tcp_node(1, config.clone()).await?;
    let n2 = spawn_tcp_node(2, config.clone()).await?;

    tracing::info!("--- initializing node 1");
    n1.raft.cluster_init().await?;
    n1.raft
        .wait(Some(Duration::from_secs(5)))
        .state(State::Leader, "n1 -> leader")
        .await?;

    tracing::info!("--- node 2 joins over tcp");
    n2.raft.cluster_join(vec![n1.addr.clone()]).await?;
    n2.raft
        .wait(Some(Duration::from_secs(10)))
        .state(State::Follower, "n2 -> follower")
        .await?;

    tracing::info!("--- writes require the follower's acknowledgement");
    let cmd = KvCommand::new(vec![b"SET".to_vec(), b"tcp".to_vec(), b"works".to_vec()]);
    let resp = n1.raft.client_write(cmd).await.map_err(|err| anyhow::anyhow!("{}", err))?;
    assert_eq!(resp.data, KvResponse::Ok);

    // One membership entry plus one data entry, applied on both ends.
    n2.raft.wait(Some(Duration::from_secs(10))).log(2, "n2 applied").await?;

    tracing::info!("--- a write against the follower is redirected to the leader's address");
    let cmd = KvCommand::new(vec![b"SET".to_vec(), b"x".to_vec(), b"y".to_vec()]);
    match n2.raft.client_write(cmd).await {
        Err(replikv::ClientWriteError::ForwardToLeader { leader_id, leader_addr }) => {
            assert_eq!(leader_id, Some(1));
            assert_eq!(leader_addr, Some(n1.addr.clone()));
        }
        other => panic!("expected ForwardToLeader, got {:?}", other),
    }

    Ok(())
}
