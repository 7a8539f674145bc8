//! Fixtures for testing replikv clusters in-process.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;
use replikv::async_trait::async_trait;
use replikv::metrics::RaftMetrics;
use replikv::net::RaftNetwork;
use replikv::raft::AddNodeRequest;
use replikv::raft::AddNodeResponse;
use replikv::raft::AppendEntriesRequest;
use replikv::raft::AppendEntriesResponse;
use replikv::raft::InstallSnapshotRequest;
use replikv::raft::InstallSnapshotResponse;
use replikv::raft::NodeAddr;
use replikv::raft::Raft;
use replikv::raft::VoteRequest;
use replikv::raft::VoteResponse;
use replikv::storage::KvStore;
use replikv::store::KvCommand;
use replikv::store::KvResponse;
use replikv::ClientWriteError;
use replikv::ClusterState;
use replikv::Config;
use replikv::LogId;
use replikv::NodeId;
use replikv::State;
use tempfile::TempDir;
use tokio::sync::RwLock;

/// A concrete node type used during testing.
pub type KvRaft = Raft<RaftRouter>;

/// Initialize the tracing system. Safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// The conventional fixture address of a node.
pub fn addr_of(id: NodeId) -> NodeAddr {
    NodeAddr::new(format!("node-{}", id), 7000 + id as u16)
}

/// An in-process network which routes RPCs between registered nodes,
/// implementing the network seam the consensus core sends through.
pub struct RaftRouter {
    /// The runtime config all nodes use.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router.
    routing_table: RwLock<BTreeMap<NodeId, (KvRaft, Arc<KvStore>)>>,
    /// Nodes which can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
    /// Storage directories, kept across node restarts.
    dirs: StdMutex<BTreeMap<NodeId, Arc<TempDir>>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: RwLock::new(BTreeMap::new()),
            isolated_nodes: RwLock::new(HashSet::new()),
            dirs: StdMutex::new(BTreeMap::new()),
        }
    }

    /// Create and register a new node bearing the given ID.
    ///
    /// A node previously removed with `remove_node` restarts over its old
    /// storage directory.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) -> Arc<KvStore> {
        let dir = {
            let mut dirs = self.dirs.lock().unwrap();
            dirs.entry(id)
                .or_insert_with(|| Arc::new(tempfile::tempdir().expect("failed creating a temp dir")))
                .clone()
        };
        let storage = Arc::new(KvStore::new_in_dir(id, dir.path()));
        let node = Raft::new(id, addr_of(id), self.config.clone(), self.clone(), storage.clone());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (node, storage.clone()));
        storage
    }

    /// Register a node over a brand new storage directory, discarding any
    /// previous state it had. Models a node whose disk was lost.
    pub async fn new_raft_node_with_blank_storage(self: &Arc<Self>, id: NodeId) -> Arc<KvStore> {
        self.dirs
            .lock()
            .unwrap()
            .insert(id, Arc::new(tempfile::tempdir().expect("failed creating a temp dir")));
        self.new_raft_node(id).await
    }

    /// Remove the target node from the routing table (and isolation),
    /// keeping its storage directory for a later restart.
    pub async fn remove_node(&self, id: NodeId) -> Option<(KvRaft, Arc<KvStore>)> {
        let mut rt = self.routing_table.write().await;
        let opt_handles = rt.remove(&id);
        let mut isolated = self.isolated_nodes.write().await;
        isolated.remove(&id);
        opt_handles
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    /// Initialize a one-node cluster at the given node.
    pub async fn init_node(&self, id: NodeId) -> Result<()> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&id).with_context(|| format!("node {} not found in routing table", id))?;
        node.0.cluster_init().await?;
        Ok(())
    }

    /// Propose adding `target` to the cluster, through `leader`.
    pub async fn add_node(&self, leader: NodeId, target: NodeId) -> Result<()> {
        let node = {
            let rt = self.routing_table.read().await;
            rt.get(&leader).with_context(|| format!("node {} not found in routing table", leader))?.0.clone()
        };
        node.add_node(target, addr_of(target)).await.map_err(|err| anyhow!("{}", err))?;
        Ok(())
    }

    /// Propose removing `target` from the cluster, through `leader`.
    pub async fn remove_member(&self, leader: NodeId, target: NodeId) -> Result<()> {
        let node = {
            let rt = self.routing_table.read().await;
            rt.get(&leader).with_context(|| format!("node {} not found in routing table", leader))?.0.clone()
        };
        node.remove_node(target).await.map_err(|err| anyhow!("{}", err))?;
        Ok(())
    }

    /// Get a clone of the node's public handle.
    pub async fn get_raft_handle(&self, id: &NodeId) -> Result<KvRaft> {
        let rt = self.routing_table.read().await;
        let node = rt.get(id).with_context(|| format!("node {} not found in routing table", id))?;
        Ok(node.0.clone())
    }

    /// Get a handle to the storage backend of the target node.
    pub async fn get_storage_handle(&self, node_id: &NodeId) -> Result<Arc<KvStore>> {
        let rt = self.routing_table.read().await;
        let addr = rt.get(node_id).with_context(|| format!("node {} not found in routing table", node_id))?;
        Ok(addr.1.clone())
    }

    /// Get a payload of the latest metrics from each registered node.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|node| node.0.metrics().borrow().clone()).collect()
    }

    /// Get the ID of the current (non-isolated) leader.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|node| {
            if node.current_leader == Some(node.id) && node.state == State::Leader && !isolated.contains(&node.id) {
                Some(node.id)
            } else {
                None
            }
        })
    }

    /// Wait on a node's metrics until `func` is satisfied.
    pub async fn wait_for_metrics<T>(
        &self,
        node_id: &NodeId,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<RaftMetrics>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let wait = {
            let rt = self.routing_table.read().await;
            let node = rt.get(node_id).with_context(|| format!("node {} not found", node_id))?;
            node.0.wait(timeout)
        };
        Ok(wait.metrics(func, msg).await?)
    }

    /// Wait for the given nodes to have applied up to `want_log`.
    pub async fn wait_for_log(
        &self,
        node_ids: &std::collections::BTreeSet<u64>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait_for_metrics(
                i,
                |m| m.last_log_index == want_log && m.last_applied == want_log,
                timeout,
                &format!("{} n{}.log == {}", msg, i, want_log),
            )
            .await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to reach `want_state`.
    pub async fn wait_for_state(
        &self,
        node_ids: &std::collections::BTreeSet<u64>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait_for_metrics(
                i,
                |m| m.state == want_state,
                timeout,
                &format!("{} n{}.state == {:?}", msg, i, want_state),
            )
            .await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to hold a snapshot covering `want`.
    pub async fn wait_for_snapshot(
        &self,
        node_ids: &std::collections::BTreeSet<u64>,
        want: LogId,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait_for_metrics(
                i,
                |m| m.snapshot >= want,
                timeout,
                &format!("{} n{}.snapshot >= {}", msg, i, want),
            )
            .await?;
        }
        Ok(())
    }

    /// Wait for some node to become leader, returning its id.
    pub async fn wait_for_leader(&self, timeout: Duration, msg: &str) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("timeout waiting for a leader: {}", msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Send a SET through the target node, panicking on error.
    pub async fn client_set(&self, target: NodeId, key: &str, value: &str) {
        let res = self.try_client_set(target, key, value).await;
        if let Err(err) = res {
            panic!("client SET against node {} failed: {:?}", target, err);
        }
    }

    /// Send a SET through the target node.
    pub async fn try_client_set(
        &self,
        target: NodeId,
        key: &str,
        value: &str,
    ) -> std::result::Result<KvResponse, ClientWriteError> {
        let node = {
            let rt = self.routing_table.read().await;
            rt.get(&target).unwrap_or_else(|| panic!("node {} does not exist in routing table", target)).0.clone()
        };
        let cmd = KvCommand::new(vec![b"SET".to_vec(), key.as_bytes().to_vec(), value.as_bytes().to_vec()]);
        node.client_write(cmd).await.map(|resp| resp.data)
    }

    /// Send a GET through the target node.
    pub async fn client_get(
        &self,
        target: NodeId,
        key: &str,
    ) -> std::result::Result<KvResponse, ClientWriteError> {
        let node = {
            let rt = self.routing_table.read().await;
            rt.get(&target).unwrap_or_else(|| panic!("node {} does not exist in routing table", target)).0.clone()
        };
        let cmd = KvCommand::new(vec![b"GET".to_vec(), key.as_bytes().to_vec()]);
        node.client_write(cmd).await.map(|resp| resp.data)
    }

    /// Send `count` SETs through the target node, keys `prefix-0..count`.
    pub async fn client_set_many(&self, target: NodeId, prefix: &str, count: usize) {
        for idx in 0..count {
            self.client_set(target, &format!("{}-{}", prefix, idx), &format!("value-{}", idx)).await;
        }
    }

    /// Assert that the cluster has a stable leader and that all
    /// non-isolated nodes agree on term, log and membership.
    pub async fn assert_stable_cluster(&self, expected_term: Option<u64>, expected_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.read().await;
        let nodes = self.latest_metrics().await;

        let non_isolated: Vec<_> = nodes.iter().filter(|node| !isolated.contains(&node.id)).collect();
        let leader = non_isolated
            .iter()
            .find(|node| node.state == State::Leader)
            .expect("expected to find a cluster leader");

        let expected_term = expected_term.unwrap_or(leader.current_term);
        let expected_last_log = expected_last_log.unwrap_or(leader.last_log_index);
        let all_members: Vec<u64> = leader.membership_config.all_nodes().collect();

        for node in non_isolated.iter() {
            assert_eq!(
                node.current_leader,
                Some(leader.id),
                "node {} has leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader.id
            );
            assert_eq!(
                node.current_term, expected_term,
                "node {} has term {}, expected {}",
                node.id, node.current_term, expected_term
            );
            assert_eq!(
                node.last_log_index, expected_last_log,
                "node {} has last_log_index {}, expected {}",
                node.id, node.last_log_index, expected_last_log
            );
            assert_eq!(
                node.cluster_state,
                ClusterState::Up,
                "node {} has cluster_state {:?}, expected Up",
                node.id,
                node.cluster_state
            );
            let members: Vec<u64> = node.membership_config.all_nodes().collect();
            assert_eq!(
                members, all_members,
                "node {} has membership {:?}, expected {:?}",
                node.id, members, all_members
            );
        }
    }

    /// Assert that the datasets of the given nodes are byte-identical.
    pub async fn assert_identical_datasets(&self, node_ids: &std::collections::BTreeSet<u64>) {
        let mut datasets = Vec::new();
        for id in node_ids {
            let storage = self.get_storage_handle(id).await.unwrap();
            datasets.push((*id, storage.get_dataset().await));
        }
        let (first_id, first) = &datasets[0];
        for (id, ds) in &datasets[1..] {
            assert_eq!(
                &first.data, &ds.data,
                "datasets of node {} and node {} differ",
                first_id, id
            );
            assert_eq!(
                first.info.last_applied, ds.info.last_applied,
                "applied position of node {} and node {} differ",
                first_id, id
            );
        }
    }

    /// Build a running cluster of the given nodes, with node `leader_id`
    /// as the initial leader. Returns the expected last log index.
    pub async fn build_cluster(self: &Arc<Self>, leader_id: NodeId, others: &[NodeId]) -> Result<u64> {
        self.new_raft_node(leader_id).await;
        self.init_node(leader_id).await?;
        self.wait_for_state(&btreeset![leader_id], State::Leader, None, "init leader").await?;

        let mut want = 0;
        for id in others {
            self.new_raft_node(*id).await;
            self.add_node(leader_id, *id).await?;
            want += 1;
            self.wait_for_log(&btreeset![leader_id], want, Some(Duration::from_secs(5)), "member added").await?;
        }
        Ok(want)
    }
}

#[async_trait]
impl RaftNetwork for RaftRouter {
    async fn send_append_entries(&self, target: u64, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let node = {
            let rt = self.routing_table.read().await;
            let isolated = self.isolated_nodes.read().await;
            if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
                return Err(anyhow!("target node is isolated"));
            }
            rt.get(&target).ok_or_else(|| anyhow!("target node {} not found in routing table", target))?.0.clone()
        };
        Ok(node.append_entries(rpc).await?)
    }

    async fn send_vote(&self, target: u64, rpc: VoteRequest) -> Result<VoteResponse> {
        let node = {
            let rt = self.routing_table.read().await;
            let isolated = self.isolated_nodes.read().await;
            if isolated.contains(&target) || isolated.contains(&rpc.candidate_id) {
                return Err(anyhow!("target node is isolated"));
            }
            rt.get(&target).ok_or_else(|| anyhow!("target node {} not found in routing table", target))?.0.clone()
        };
        Ok(node.vote(rpc).await?)
    }

    async fn send_install_snapshot(
        &self,
        target: u64,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let node = {
            let rt = self.routing_table.read().await;
            let isolated = self.isolated_nodes.read().await;
            if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
                return Err(anyhow!("target node is isolated"));
            }
            rt.get(&target).ok_or_else(|| anyhow!("target node {} not found in routing table", target))?.0.clone()
        };
        Ok(node.install_snapshot(rpc).await?)
    }

    async fn send_add_node(&self, target: &NodeAddr, rpc: AddNodeRequest) -> Result<AddNodeResponse> {
        // Resolve the fixture address back to a node id.
        let node = {
            let rt = self.routing_table.read().await;
            let isolated = self.isolated_nodes.read().await;
            let id = rt
                .keys()
                .find(|id| &addr_of(**id) == target)
                .copied()
                .ok_or_else(|| anyhow!("no node at {}", target))?;
            if isolated.contains(&id) || isolated.contains(&rpc.id) {
                return Err(anyhow!("target node is isolated"));
            }
            rt.get(&id).unwrap().0.clone()
        };

        match node.add_node(rpc.id, rpc.addr).await {
            Ok(()) => {
                let dbid = node.info().await?.dbid;
                Ok(AddNodeResponse::Added { dbid })
            }
            Err(replikv::error::ResponseError::ChangeConfig(
                replikv::error::ChangeConfigError::NodeNotLeader(leader),
            )) => {
                let rx = node.metrics();
                let leader_addr = {
                    let metrics = rx.borrow();
                    leader.and_then(|id| metrics.membership_config.addr_of(&id).cloned())
                };
                Ok(AddNodeResponse::Moved { leader: leader_addr })
            }
            Err(err) => Ok(AddNodeResponse::Rejected { reason: err.to_string() }),
        }
    }
}
