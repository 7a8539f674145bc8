//! The background snapshot worker.
//!
//! A snapshot produces two artifacts from a point-in-time image of the
//! dataset: the serialized dataset itself, and a fresh log file whose
//! header carries the snapshot boundary and whose body contains only the
//! entries not covered by the snapshot. Both are written to temporary
//! files; the consensus task adopts them atomically (or deletes them) when
//! it polls the worker's result.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::raft::Entry;
use crate::storage::log::RaftLog;
use crate::store::Dataset;
use crate::LogId;

/// "snap", tagging a result record as coming from a snapshot worker.
pub const SNAPSHOT_RESULT_MAGIC: u32 = 0x7061_6e73;

/// The record a snapshot worker reports back on completion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotResult {
    pub magic: u32,
    pub success: bool,
    /// The number of log entries carried over into the rewritten log.
    pub num_entries: u64,
    /// The temporary dataset image awaiting adoption.
    pub rdb_filename: PathBuf,
    /// The temporary rewritten log awaiting adoption.
    pub log_filename: PathBuf,
    /// The failure description when `success` is false.
    pub err: String,
}

/// Everything a snapshot worker needs, captured at initiation time.
///
/// `image` is the dataset as of `boundary` and `carried` are the log
/// entries with an index strictly greater than `boundary` at that moment.
/// Entries appended while the worker runs are re-appended by the consensus
/// task at adoption.
pub(crate) struct CompactionJob {
    pub image: Dataset,
    pub boundary: LogId,
    pub carried: Vec<Entry>,
    pub dbid: String,
    pub rdb_tmp: PathBuf,
    pub log_tmp: PathBuf,
}

/// Run a snapshot job to completion. Never panics; all failures are folded
/// into an unsuccessful `SnapshotResult` and the temp files are removed.
#[tracing::instrument(level="debug", skip(job), fields(boundary=%job.boundary))]
pub(crate) fn build_snapshot(job: CompactionJob) -> SnapshotResult {
    let rdb_tmp = job.rdb_tmp.clone();
    let log_tmp = job.log_tmp.clone();
    let num_entries = job.carried.len() as u64;

    match write_artifacts(job) {
        Ok(()) => SnapshotResult {
            magic: SNAPSHOT_RESULT_MAGIC,
            success: true,
            num_entries,
            rdb_filename: rdb_tmp,
            log_filename: log_tmp,
            err: String::new(),
        },
        Err(err) => {
            tracing::error!(error=%err, "snapshot worker failed");
            let _ = std::fs::remove_file(&rdb_tmp);
            let _ = std::fs::remove_file(&log_tmp);
            SnapshotResult {
                magic: SNAPSHOT_RESULT_MAGIC,
                success: false,
                num_entries: 0,
                rdb_filename: rdb_tmp,
                log_filename: log_tmp,
                err: err.to_string(),
            }
        }
    }
}

fn write_artifacts(job: CompactionJob) -> anyhow::Result<()> {
    let raw = serde_json::to_vec(&job.image)?;
    let mut rdb = OpenOptions::new().write(true).create(true).truncate(true).open(&job.rdb_tmp)?;
    rdb.write_all(&raw)?;
    rdb.sync_all()?;

    let mut log = RaftLog::create(&job.log_tmp, &job.dbid, job.boundary)?;
    for entry in &job.carried {
        log.append(entry)?;
    }
    log.sync()?;

    tracing::debug!(
        rdb_bytes = raw.len(),
        carried = job.carried.len(),
        "snapshot artifacts written"
    );
    Ok(())
}
