//! replikv — a replicated in-memory key-value store built on Raft.
//!
//! A cluster of replikv nodes accepts write commands at a single leader,
//! replicates them as a totally ordered persistent log, and applies them
//! deterministically on every member, so each node observes the same
//! sequence of state transitions. Writes are linearizable, minority
//! failures are survived, and the log is compacted online via snapshots.
//!
//! The crate is organized around a single consensus task per node which
//! owns the protocol state, the persistent log and the dataset. Everything
//! else — client-serving contexts, peer I/O, the snapshot worker — talks
//! to it through channels. See the `raft` module for the public handle.

pub mod config;
mod core;
pub mod error;
pub mod metrics;
pub mod net;
mod quorum;
pub mod raft;
mod replication;
pub mod storage;
pub mod store;

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

pub use async_trait;
pub use crate::config::Config;
pub use crate::core::ClusterState;
pub use crate::core::State;
pub use crate::error::ClientWriteError;
pub use crate::error::InitializeError;
pub use crate::error::JoinError;
pub use crate::error::RaftError;
pub use crate::metrics::RaftMetrics;
pub use crate::net::RaftNetwork;
pub use crate::raft::NodeAddr;
pub use crate::raft::Raft;
pub use crate::storage::KvStore;
pub use crate::store::KvCommand;
pub use crate::store::KvResponse;

/// A Raft node's ID.
pub type NodeId = u64;

/// The identity of a log entry: the term in which it was created and its
/// position in the log.
///
/// Indices are strictly monotonic starting at 1; index 0 is the "empty log"
/// sentinel. Terms along the log are non-decreasing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// Identifies a segment of a snapshot stream, for mismatch reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSegmentId {
    pub id: String,
    pub offset: u64,
}

impl fmt::Display for SnapshotSegmentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}+{}", self.id, self.offset)
    }
}

/// A condensed, log-friendly rendering of a message.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

/// The length of a cluster dbid.
pub const DBID_LEN: usize = 32;

/// Generate a fresh cluster dbid: a random 32-character alphanumeric
/// identifier, fixed at cluster init and carried in log and snapshot
/// headers.
pub fn new_dbid() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng().sample_iter(&Alphanumeric).take(DBID_LEN).map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dbid_has_fixed_length() {
        let dbid = new_dbid();
        assert_eq!(dbid.len(), DBID_LEN);
        assert!(dbid.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn log_id_orders_by_term_then_index() {
        assert!(LogId::new(1, 5) < LogId::new(2, 1));
        assert!(LogId::new(2, 1) < LogId::new(2, 2));
    }
}
