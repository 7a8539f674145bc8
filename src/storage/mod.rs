//! Durable state for a node: the persistent Raft log, the in-memory
//! dataset, and the snapshot files, behind the narrow surface the
//! consensus task drives.
//!
//! The consensus task is the only writer. The interior locks exist so
//! that the short-lived tasks it spawns (the background apply task and
//! the snapshot worker) can read consistent state without blocking the
//! main loop.

pub mod log;
pub mod snapshot;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::io::Write;
use std::ops::RangeBounds;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::MembershipConfig;
use crate::storage::log::RaftLog;
use crate::storage::snapshot::CompactionJob;
use crate::storage::snapshot::SnapshotResult;
use crate::store::Dataset;
use crate::store::KvResponse;
use crate::LogId;
use crate::NodeId;

/// A record holding the hard state of a node: what must be durable before
/// the protocol may make promises.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this node.
    pub current_term: u64,
    /// The ID of the node voted for in `current_term`.
    pub voted_for: Option<NodeId>,
}

/// The state a node recovers on startup.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The id of the last entry in the log.
    pub last_log_id: LogId,
    /// The id of the last entry applied to the dataset.
    pub last_applied: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The latest membership found in the log or the dataset.
    pub membership: MembershipConfig,
    /// The cluster dbid, `None` for a pristine node which has neither a
    /// log nor a snapshot yet.
    pub dbid: Option<String>,
}

/// Metadata describing a snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotMeta {
    /// Log entries up to which this snapshot includes, inclusive.
    pub last_log_id: LogId,
    /// The membership covered by the snapshot.
    pub membership: MembershipConfig,
    /// Identifies a snapshot when transferring; two snapshots with the
    /// same `last_log_id` may still differ in bytes.
    pub snapshot_id: String,
}

/// A readable handle to the current snapshot. The image is buffered whole,
/// the way the transmission path consumes it.
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub snapshot: Box<Cursor<Vec<u8>>>,
}

struct LogState {
    /// The persistent log. `None` until the node learns a cluster identity
    /// (cluster init, join acceptance, or first leader contact).
    file: Option<RaftLog>,
    /// All live entries, mirrored in memory for cheap range reads.
    cache: BTreeMap<u64, Entry>,
}

struct PendingCompaction {
    boundary: LogId,
    membership: MembershipConfig,
}

/// The storage engine for one node.
pub struct KvStore {
    id: NodeId,
    log_path: PathBuf,
    snapshot_path: PathBuf,
    log: RwLock<LogState>,
    sm: RwLock<Dataset>,
    current_snapshot: RwLock<Option<SnapshotMeta>>,
    pending_compaction: StdMutex<Option<PendingCompaction>>,
    snapshot_seq: StdMutex<u64>,
}

impl KvStore {
    /// Create a store backed by the given files. Nothing is touched on
    /// disk until `get_initial_state` or `initialize`.
    pub fn new(id: NodeId, log_path: impl Into<PathBuf>, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            log_path: log_path.into(),
            snapshot_path: snapshot_path.into(),
            log: RwLock::new(LogState {
                file: None,
                cache: BTreeMap::new(),
            }),
            sm: RwLock::new(Dataset::default()),
            current_snapshot: RwLock::new(None),
            pending_compaction: StdMutex::new(None),
            snapshot_seq: StdMutex::new(0),
        }
    }

    /// Create a store keeping its files under `dir`.
    pub fn new_in_dir(id: NodeId, dir: &Path) -> Self {
        Self::new(id, dir.join("raft.log"), dir.join("snapshot.rdb"))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Recover state from disk: load the snapshot image if one exists,
    /// then open the log and replay its record stream.
    ///
    /// A missing log and snapshot mean a pristine node. A partial trailing
    /// log record is a recoverable condition: it is discarded with a
    /// warning and the node proceeds with the surviving prefix.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_initial_state(&self) -> Result<InitialState> {
        let mut dbid: Option<String> = None;
        let mut last_applied = LogId::default();

        if self.snapshot_path.exists() {
            let raw = std::fs::read(&self.snapshot_path)
                .with_context(|| format!("reading snapshot {:?}", self.snapshot_path))?;
            let mut image: Dataset =
                serde_json::from_slice(&raw).context("snapshot image is undecodable")?;
            image.info.loaded = true;
            dbid = Some(image.info.dbid.clone());
            last_applied = image.info.last_applied;

            let meta = SnapshotMeta {
                last_log_id: image.info.last_applied,
                membership: image.info.membership.clone(),
                snapshot_id: self.next_snapshot_id(image.info.last_applied),
            };
            *self.current_snapshot.write().await = Some(meta);
            *self.sm.write().await = image;
        }

        let mut logstate = self.log.write().await;
        if self.log_path.exists() {
            let (file, recovery) = log::RaftLog::open(&self.log_path)?;
            if let Some(dbid) = &dbid {
                if dbid != file.dbid() {
                    bail!(
                        "raft log dbid {:?} does not match snapshot dbid {:?}",
                        file.dbid(),
                        dbid
                    );
                }
            }
            dbid = Some(file.dbid().to_string());
            logstate.cache = recovery.entries.into_iter().map(|e| (e.log_id.index, e)).collect();
            logstate.file = Some(file);
        }

        let last_log_id = match logstate.cache.values().next_back() {
            Some(entry) => entry.log_id,
            None => match &logstate.file {
                Some(file) => file.snapshot_last(),
                None => last_applied,
            },
        };
        let hard_state = logstate.file.as_ref().map(|f| f.hard_state()).unwrap_or_default();
        let membership = {
            let sm = self.sm.read().await;
            membership_from(&logstate.cache, &sm)
        };

        tracing::debug!(
            ?dbid,
            %last_log_id,
            %last_applied,
            entries = logstate.cache.len(),
            "recovered initial state"
        );

        Ok(InitialState {
            last_log_id,
            last_applied,
            hard_state,
            membership,
            dbid,
        })
    }

    /// The cluster dbid, if the node has one yet.
    pub async fn dbid(&self) -> Option<String> {
        self.log.read().await.file.as_ref().map(|f| f.dbid().to_string())
    }

    /// Set up a brand new cluster of one: create the log file and seed the
    /// dataset with the cluster identity and initial membership. The seed
    /// is also written out as the initial snapshot image so the identity
    /// survives a restart that happens before the first compaction.
    #[tracing::instrument(level = "debug", skip(self, membership))]
    pub async fn initialize(&self, dbid: &str, membership: MembershipConfig) -> Result<()> {
        let mut logstate = self.log.write().await;
        if logstate.file.is_some() {
            bail!("store already has a raft log");
        }
        let file = RaftLog::create(&self.log_path, dbid, LogId::default())?;
        logstate.file = Some(file);
        logstate.cache.clear();

        let image = {
            let mut sm = self.sm.write().await;
            sm.info.dbid = dbid.to_string();
            sm.info.membership = membership.clone();
            sm.clone()
        };
        self.write_snapshot_image(&image)?;
        *self.current_snapshot.write().await = Some(SnapshotMeta {
            last_log_id: LogId::default(),
            membership,
            snapshot_id: self.next_snapshot_id(LogId::default()),
        });
        Ok(())
    }

    /// Adopt a cluster identity learned from a peer: create the log file
    /// if this node does not have one yet, and verify the dbid if it does.
    pub async fn ensure_log(&self, dbid: &str) -> Result<()> {
        let mut logstate = self.log.write().await;
        match &logstate.file {
            Some(file) => {
                if file.dbid() != dbid {
                    bail!(
                        "peer belongs to cluster {:?} but this node has state for {:?}",
                        dbid,
                        file.dbid()
                    );
                }
                Ok(())
            }
            None => {
                let boundary = self.sm.read().await.info.last_applied;
                let file = RaftLog::create(&self.log_path, dbid, boundary)?;
                logstate.file = Some(file);
                self.sm.write().await.info.dbid = dbid.to_string();
                Ok(())
            }
        }
    }

    /// Persist the node's hard state. Synced before returning; a vote must
    /// never be re-granted after a crash.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        let mut logstate = self.log.write().await;
        let file = logstate.file.as_mut().context("no raft log to persist hard state to")?;
        let old = file.hard_state();
        if old.current_term != hs.current_term {
            file.set_term(hs.current_term, hs.voted_for)?;
        } else if old.voted_for != hs.voted_for {
            file.set_vote(hs.voted_for)?;
        }
        Ok(())
    }

    /// The current hard state, if the node has a log.
    pub async fn read_hard_state(&self) -> Option<HardState> {
        self.log.read().await.file.as_ref().map(|f| f.hard_state())
    }

    /// Get a range of log entries from the in-memory mirror.
    pub async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry>> {
        let logstate = self.log.read().await;
        Ok(logstate.cache.range(range).map(|(_, v)| v.clone()).collect())
    }

    /// Try to get a single log entry.
    pub async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry>> {
        let logstate = self.log.read().await;
        Ok(logstate.cache.get(&index).cloned())
    }

    /// The index of the lowest entry still present in the log, or, when
    /// the log is empty, one past the snapshot boundary.
    pub async fn first_log_index(&self) -> u64 {
        let logstate = self.log.read().await;
        match &logstate.file {
            Some(file) => file.first_index(),
            None => 1,
        }
    }

    /// Append entries to the log. Durable once this returns: the write is
    /// buffered per entry and synced once per batch.
    #[tracing::instrument(level = "trace", skip(self, entries), fields(n=entries.len()))]
    pub async fn append_to_log(&self, entries: &[&Entry]) -> Result<()> {
        let mut logstate = self.log.write().await;
        let file = logstate.file.as_mut().context("no raft log to append to")?;
        for entry in entries {
            file.append(entry)?;
        }
        file.sync()?;
        for entry in entries {
            logstate.cache.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    /// Delete the conflicting uncommitted suffix starting at `start`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete_logs_from(&self, start: u64) -> Result<()> {
        let mut logstate = self.log.write().await;
        if let Some(file) = logstate.file.as_mut() {
            while file.entry_count() > 0 && file.last_index() >= start {
                file.remove_tail()?;
            }
        }
        let _ = logstate.cache.split_off(&start);
        Ok(())
    }

    /// Apply committed entries to the dataset, in index order, returning
    /// one reply per entry.
    #[tracing::instrument(level = "trace", skip(self, entries), fields(n=entries.len()))]
    pub async fn apply_to_state_machine(&self, entries: &[&Entry]) -> Result<Vec<KvResponse>> {
        let mut sm = self.sm.write().await;
        let mut res = Vec::with_capacity(entries.len());
        for entry in entries {
            tracing::debug!(id = self.id, index = entry.log_id.index, "applying entry");
            sm.info.last_applied = entry.log_id;
            match &entry.payload {
                EntryPayload::Blank => res.push(KvResponse::Ok),
                EntryPayload::Normal(cmd) => res.push(sm.apply(cmd)),
                EntryPayload::ConfigChange(membership) => {
                    sm.info.membership = membership.clone();
                    res.push(KvResponse::Ok);
                }
            }
        }
        Ok(res)
    }

    /// The latest membership config: the most recent config entry in the
    /// log, else the config recorded in the dataset.
    pub async fn get_membership_config(&self) -> Result<MembershipConfig> {
        let logstate = self.log.read().await;
        let sm = self.sm.read().await;
        Ok(membership_from(&logstate.cache, &sm))
    }

    /// Capture everything a snapshot worker needs: the dataset image as of
    /// now, the boundary it covers, and the entries that must survive into
    /// the rewritten log. Returns `None` when there is nothing to compact.
    pub(crate) async fn begin_compaction(&self) -> Result<Option<CompactionJob>> {
        let logstate = self.log.read().await;
        let image = self.sm.read().await.clone();
        let boundary = image.info.last_applied;
        if boundary.index == 0 {
            return Ok(None);
        }
        let file = logstate.file.as_ref().context("no raft log to compact")?;
        let carried: Vec<Entry> =
            logstate.cache.range(boundary.index + 1..).map(|(_, v)| v.clone()).collect();
        let job = CompactionJob {
            boundary,
            carried,
            dbid: file.dbid().to_string(),
            image,
            rdb_tmp: tmp_path(&self.snapshot_path),
            log_tmp: tmp_path(&self.log_path),
        };
        let mut pending = self.pending_compaction.lock().unwrap();
        *pending = Some(PendingCompaction {
            boundary,
            membership: job.image.info.membership.clone(),
        });
        Ok(Some(job))
    }

    /// Adopt the artifacts of a successful snapshot build: rename the
    /// image and the rewritten log into place, re-append entries that
    /// arrived while the worker ran, and drop covered entries from the
    /// mirror.
    #[tracing::instrument(level = "debug", skip(self, sr))]
    pub(crate) async fn finalize_compaction(&self, sr: &SnapshotResult) -> Result<SnapshotMeta> {
        let pending = self
            .pending_compaction
            .lock()
            .unwrap()
            .take()
            .context("no compaction in progress")?;

        let mut logstate = self.log.write().await;

        std::fs::rename(&sr.rdb_filename, &self.snapshot_path)
            .with_context(|| format!("adopting snapshot image {:?}", sr.rdb_filename))?;

        let (mut newlog, _) = RaftLog::open(&sr.log_filename)?;
        let old = logstate.file.take().context("no raft log being compacted")?;

        // Entries appended while the worker ran survive in the new log.
        for (_, entry) in logstate.cache.range(newlog.last_index() + 1..) {
            newlog.append(entry)?;
        }
        let hs = old.hard_state();
        if hs != HardState::default() {
            newlog.set_term(hs.current_term, hs.voted_for)?;
        }
        newlog.sync()?;
        newlog.persist_to(&self.log_path)?;
        logstate.file = Some(newlog);
        let live = logstate.cache.split_off(&(pending.boundary.index + 1));
        logstate.cache = live;

        let meta = SnapshotMeta {
            last_log_id: pending.boundary,
            membership: pending.membership,
            snapshot_id: self.next_snapshot_id(pending.boundary),
        };
        *self.current_snapshot.write().await = Some(meta.clone());
        tracing::info!(boundary=%pending.boundary, carried=sr.num_entries, "snapshot adopted, log compacted");
        Ok(meta)
    }

    /// Discard the artifacts of a failed snapshot build; the existing log
    /// remains authoritative.
    pub(crate) async fn cancel_compaction(&self, sr: &SnapshotResult) {
        let _ = self.pending_compaction.lock().unwrap().take();
        let _ = std::fs::remove_file(&sr.rdb_filename);
        let _ = std::fs::remove_file(&sr.log_filename);
    }

    /// Discard the artifacts of an aborted snapshot build, which may have
    /// died before reporting a result.
    pub(crate) async fn abort_compaction(&self) {
        let _ = self.pending_compaction.lock().unwrap().take();
        let _ = std::fs::remove_file(tmp_path(&self.snapshot_path));
        let _ = std::fs::remove_file(tmp_path(&self.log_path));
    }

    /// Get a readable handle to the current snapshot, along with its
    /// metadata. The whole image is buffered, which is also how the
    /// transmission path wants it.
    pub async fn get_current_snapshot(&self) -> Result<Option<Snapshot>> {
        let meta = match &*self.current_snapshot.read().await {
            Some(meta) => meta.clone(),
            None => return Ok(None),
        };
        let raw = std::fs::read(&self.snapshot_path)
            .with_context(|| format!("reading snapshot {:?}", self.snapshot_path))?;
        Ok(Some(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(raw)),
        }))
    }

    /// Create a blank buffer for receiving a snapshot stream from the
    /// leader.
    pub async fn begin_receiving_snapshot(&self) -> Result<Box<Cursor<Vec<u8>>>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    /// Install a snapshot which finished streaming from the leader:
    /// replace the dataset, persist the image, and truncate the log
    /// entries the snapshot covers.
    #[tracing::instrument(level = "debug", skip(self, meta, snapshot), fields(snapshot_id=%meta.snapshot_id))]
    pub async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<()> {
        let raw = snapshot.into_inner();
        let mut image: Dataset = serde_json::from_slice(&raw).context("snapshot image is undecodable")?;
        image.info.loaded = true;
        let boundary = meta.last_log_id;
        let dbid = image.info.dbid.clone();

        self.write_snapshot_image(&image)?;

        let mut logstate = self.log.write().await;
        let keep_suffix = match &logstate.file {
            Some(file) => file.dbid() == dbid && file.last_index() > boundary.index,
            None => false,
        };
        if keep_suffix {
            let file = logstate.file.as_mut().unwrap();
            while file.entry_count() > 0 && file.first_index() <= boundary.index {
                file.remove_head()?;
            }
            file.sync()?;
        } else {
            let hs = logstate.file.as_ref().map(|f| f.hard_state()).unwrap_or_default();
            let mut fresh = RaftLog::create(&self.log_path, &dbid, boundary)?;
            if hs != HardState::default() {
                fresh.set_term(hs.current_term, hs.voted_for)?;
            }
            logstate.file = Some(fresh);
            logstate.cache.clear();
        }
        let live = logstate.cache.split_off(&(boundary.index + 1));
        logstate.cache = live;

        *self.sm.write().await = image;
        *self.current_snapshot.write().await = Some(meta.clone());
        tracing::info!(boundary=%boundary, "snapshot installed");
        Ok(())
    }

    /// Flush and fsync the log. Part of shutdown.
    pub async fn sync_log(&self) -> Result<()> {
        let mut logstate = self.log.write().await;
        if let Some(file) = logstate.file.as_mut() {
            file.sync()?;
        }
        Ok(())
    }

    /// A copy of the dataset, for status reports and tests.
    pub async fn get_dataset(&self) -> Dataset {
        self.sm.read().await.clone()
    }

    fn write_snapshot_image(&self, image: &Dataset) -> Result<()> {
        let raw = serde_json::to_vec(image)?;
        let tmp = tmp_path(&self.snapshot_path);
        let mut f = std::fs::OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        f.write_all(&raw)?;
        f.sync_all()?;
        std::fs::rename(&tmp, &self.snapshot_path)?;
        Ok(())
    }

    fn next_snapshot_id(&self, last: LogId) -> String {
        let mut seq = self.snapshot_seq.lock().unwrap();
        *seq += 1;
        format!("{}-{}-{}", last.term, last.index, *seq)
    }
}

/// The most recent config entry in the log wins; the dataset's recorded
/// membership is the fallback.
fn membership_from(cache: &BTreeMap<u64, Entry>, sm: &Dataset) -> MembershipConfig {
    for entry in cache.values().rev() {
        if let EntryPayload::ConfigChange(m) = &entry.payload {
            return m.clone();
        }
    }
    sm.info.membership.clone()
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::NodeAddr;
    use crate::store::KvCommand;
    use crate::new_dbid;

    fn entry(term: u64, index: u64, key: &str, value: &str) -> Entry {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Normal(KvCommand::new(vec![
                b"SET".to_vec(),
                key.as_bytes().to_vec(),
                value.as_bytes().to_vec(),
            ])),
        }
    }

    #[tokio::test]
    async fn pristine_store_reports_no_dbid() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new_in_dir(1, dir.path());
        let state = store.get_initial_state().await.unwrap();
        assert_eq!(state.dbid, None);
        assert_eq!(state.last_log_id, LogId::default());
        assert_eq!(state.hard_state, HardState::default());
        assert!(state.membership.is_empty());
    }

    #[tokio::test]
    async fn initialize_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let dbid = new_dbid();
        let membership = MembershipConfig::new_initial(1, NodeAddr::new("localhost", 7001));
        {
            let store = KvStore::new_in_dir(1, dir.path());
            store.get_initial_state().await.unwrap();
            store.initialize(&dbid, membership.clone()).await.unwrap();
        }
        let store = KvStore::new_in_dir(1, dir.path());
        let state = store.get_initial_state().await.unwrap();
        assert_eq!(state.dbid, Some(dbid));
        assert_eq!(state.membership, membership);
    }

    #[tokio::test]
    async fn append_apply_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let dbid = new_dbid();
        let membership = MembershipConfig::new_initial(1, NodeAddr::new("localhost", 7001));
        {
            let store = KvStore::new_in_dir(1, dir.path());
            store.get_initial_state().await.unwrap();
            store.initialize(&dbid, membership).await.unwrap();
            let e1 = entry(1, 1, "k", "v1");
            let e2 = entry(1, 2, "k", "v2");
            store.append_to_log(&[&e1, &e2]).await.unwrap();
            store.apply_to_state_machine(&[&e1]).await.unwrap();
        }
        let store = KvStore::new_in_dir(1, dir.path());
        let state = store.get_initial_state().await.unwrap();
        // Both entries survive in the log; only the applied one is in the
        // dataset, whose image was not rewritten.
        assert_eq!(state.last_log_id, LogId::new(1, 2));
        assert_eq!(state.last_applied, LogId::default());
        let entries = store.get_log_entries(..).await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn delete_logs_from_truncates_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new_in_dir(1, dir.path());
        store.get_initial_state().await.unwrap();
        store.initialize(&new_dbid(), MembershipConfig::default()).await.unwrap();
        for i in 1..=5 {
            let e = entry(1, i, "k", "v");
            store.append_to_log(&[&e]).await.unwrap();
        }
        store.delete_logs_from(3).await.unwrap();
        let entries = store.get_log_entries(..).await.unwrap();
        assert_eq!(entries.last().unwrap().log_id.index, 2);
        let state = store.get_initial_state().await.unwrap();
        assert_eq!(state.last_log_id.index, 2);
    }

    #[tokio::test]
    async fn compaction_rewrites_log_and_preserves_uncovered_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new_in_dir(1, dir.path());
        store.get_initial_state().await.unwrap();
        store
            .initialize(&new_dbid(), MembershipConfig::new_initial(1, NodeAddr::new("localhost", 7001)))
            .await
            .unwrap();

        let mut entries = Vec::new();
        for i in 1..=10 {
            entries.push(entry(1, i, &format!("k{}", i), "v"));
        }
        for e in &entries {
            store.append_to_log(&[e]).await.unwrap();
        }
        // Apply the first seven; the snapshot must cover exactly those.
        let applied: Vec<&Entry> = entries[..7].iter().collect();
        store.apply_to_state_machine(&applied).await.unwrap();

        let job = store.begin_compaction().await.unwrap().expect("a job");
        assert_eq!(job.boundary, LogId::new(1, 7));
        assert_eq!(job.carried.len(), 3);
        let sr = snapshot::build_snapshot(job);
        assert!(sr.success, "{}", sr.err);
        assert_eq!(sr.magic, snapshot::SNAPSHOT_RESULT_MAGIC);
        let meta = store.finalize_compaction(&sr).await.unwrap();
        assert_eq!(meta.last_log_id, LogId::new(1, 7));

        assert_eq!(store.first_log_index().await, 8);
        let live = store.get_log_entries(..).await.unwrap();
        assert_eq!(live.len(), 3);

        // Recovery sees the compacted log plus the snapshot image.
        let reopened = KvStore::new_in_dir(1, dir.path());
        let state = reopened.get_initial_state().await.unwrap();
        assert_eq!(state.last_applied, LogId::new(1, 7));
        assert_eq!(state.last_log_id, LogId::new(1, 10));
        let ds = reopened.get_dataset().await;
        assert_eq!(ds.data.get("k7").map(|v| v.as_slice()), Some(b"v".as_ref()));
        assert_eq!(ds.data.get("k8"), None);
    }

    #[tokio::test]
    async fn failed_compaction_leaves_log_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new_in_dir(1, dir.path());
        store.get_initial_state().await.unwrap();
        store.initialize(&new_dbid(), MembershipConfig::default()).await.unwrap();
        let e = entry(1, 1, "k", "v");
        store.append_to_log(&[&e]).await.unwrap();
        store.apply_to_state_machine(&[&e]).await.unwrap();

        let job = store.begin_compaction().await.unwrap().expect("a job");
        let sr = SnapshotResult {
            magic: snapshot::SNAPSHOT_RESULT_MAGIC,
            success: false,
            num_entries: 0,
            rdb_filename: job.rdb_tmp.clone(),
            log_filename: job.log_tmp.clone(),
            err: "simulated".into(),
        };
        store.cancel_compaction(&sr).await;
        assert_eq!(store.get_log_entries(..).await.unwrap().len(), 1);
        // A new compaction can start afterwards.
        assert!(store.begin_compaction().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn snapshot_installation_replaces_dataset_and_log() {
        let dir_leader = tempfile::tempdir().unwrap();
        let leader = KvStore::new_in_dir(1, dir_leader.path());
        leader.get_initial_state().await.unwrap();
        leader
            .initialize(&new_dbid(), MembershipConfig::new_initial(1, NodeAddr::new("localhost", 7001)))
            .await
            .unwrap();
        let e = entry(1, 1, "k", "v");
        leader.append_to_log(&[&e]).await.unwrap();
        leader.apply_to_state_machine(&[&e]).await.unwrap();
        let job = leader.begin_compaction().await.unwrap().unwrap();
        let sr = snapshot::build_snapshot(job);
        leader.finalize_compaction(&sr).await.unwrap();
        let snap = leader.get_current_snapshot().await.unwrap().unwrap();

        let dir_follower = tempfile::tempdir().unwrap();
        let follower = KvStore::new_in_dir(2, dir_follower.path());
        follower.get_initial_state().await.unwrap();
        follower.finalize_snapshot_installation(&snap.meta, snap.snapshot).await.unwrap();

        let ds = follower.get_dataset().await;
        assert!(ds.info.loaded);
        assert_eq!(ds.data.get("k").map(|v| v.as_slice()), Some(b"v".as_ref()));
        assert_eq!(ds.info.last_applied, LogId::new(1, 1));

        // The follower restarts cleanly from the installed state.
        let reopened = KvStore::new_in_dir(2, dir_follower.path());
        let state = reopened.get_initial_state().await.unwrap();
        assert_eq!(state.last_applied, LogId::new(1, 1));
        assert_eq!(state.last_log_id, LogId::new(1, 1));
    }
}
