//! Observability of a running node.
//!
//! A node publishes a `RaftMetrics` snapshot on a watch channel whenever
//! something noteworthy changes. `Wait` builds on the channel to await a
//! condition, which is how the integration tests synchronize with the
//! cluster instead of sleeping.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::ClusterState;
use crate::core::State;
use crate::error::WaitError;
use crate::raft::MembershipConfig;
use crate::LogId;
use crate::NodeId;

/// A set of metrics describing the current state of a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the node.
    pub id: NodeId,
    /// The node's protocol role.
    pub state: State,
    /// The node's cluster lifecycle state.
    pub cluster_state: ClusterState,
    /// The current term.
    pub current_term: u64,
    /// The index of the last log entry.
    pub last_log_index: u64,
    /// The index of the last entry applied to the dataset.
    pub last_applied: u64,
    /// The current cluster leader, as this node sees it.
    pub current_leader: Option<NodeId>,
    /// The current membership config.
    pub membership_config: MembershipConfig,
    /// The id covered by the current snapshot, (0,0) if none.
    pub snapshot: LogId,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::NonVoter,
            cluster_state: ClusterState::Loading,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: MembershipConfig::default(),
            snapshot: LogId::default(),
        }
    }
}

/// A handle for awaiting a metrics condition with a timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait until the metrics satisfy `func`, or timeout.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("done waiting for {:?}", msg);
                return Ok(latest);
            }
            let delta = timeout(self.timeout, rx.changed())
                .await
                .map_err(|_| WaitError::Timeout(self.timeout, format!("{} latest: {:?}", msg, latest)))?;
            delta.map_err(|_| WaitError::ShuttingDown)?;
        }
    }

    /// Wait for `last_applied` to reach `want_log`.
    pub async fn log(&self, want_log: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.last_log_index == want_log && x.last_applied == want_log,
            &format!("{} .last_log_index & .last_applied == {}", msg, want_log),
        )
        .await
    }

    /// Wait for the protocol role to become `want_state`.
    pub async fn state(&self, want_state: State, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|x| x.state == want_state, &format!("{} .state == {:?}", msg, want_state)).await
    }

    /// Wait for the cluster lifecycle state to become `want`.
    pub async fn cluster_state(&self, want: ClusterState, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|x| x.cluster_state == want, &format!("{} .cluster_state == {:?}", msg, want)).await
    }

    /// Wait for `current_leader` to become `leader_id`.
    pub async fn current_leader(&self, leader_id: NodeId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.current_leader == Some(leader_id),
            &format!("{} .current_leader == {}", msg, leader_id),
        )
        .await
    }

    /// Wait for the current snapshot to cover `want`.
    pub async fn snapshot(&self, want: LogId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|x| x.snapshot == want, &format!("{} .snapshot == {}", msg, want)).await
    }

    /// Wait for the set of cluster members to become `want`.
    pub async fn members(&self, want: Vec<NodeId>, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.membership_config.all_nodes().collect::<Vec<_>>() == want,
            &format!("{} .members == {:?}", msg, want),
        )
        .await
    }
}
