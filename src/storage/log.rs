//! The persistent Raft log file.
//!
//! The log is a single append-only file: a fixed header carrying the
//! format version, the cluster dbid and the snapshot boundary, followed by
//! a stream of records. Entries, entry removals and term/vote updates are
//! all records — nothing is ever modified in place, so a crash can only
//! ever cost an incomplete trailing record, which is discarded on open.
//!
//! Record stream layout, all integers little-endian:
//!
//! ```text
//! header:  magic u32 | version u32 | dbid [32] | snap_term u64 | snap_idx u64
//! entry:   0x01 | term u64 | index u64 | etype u8 | payload_len u32 | payload
//! rm-head: 0x02
//! rm-tail: 0x03
//! term:    0x04 | term u64 | vote_set u8 | vote u64
//! vote:    0x05 | vote_set u8 | vote u64
//! ```
//!
//! Durability is batched: `append` only buffers; callers must invoke
//! `sync` before reporting an entry as durable. Term and vote updates sync
//! before returning, a vote must never be re-granted after a crash.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;

use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::storage::HardState;
use crate::LogId;
use crate::NodeId;
use crate::DBID_LEN;

const LOG_MAGIC: u32 = 0x4c56_4b52; // "RKVL"
const LOG_VERSION: u32 = 1;
const HEADER_LEN: u64 = 4 + 4 + DBID_LEN as u64 + 8 + 8;

const REC_ENTRY: u8 = 0x01;
const REC_REMOVE_HEAD: u8 = 0x02;
const REC_REMOVE_TAIL: u8 = 0x03;
const REC_TERM: u8 = 0x04;
const REC_VOTE: u8 = 0x05;

/// A cap on a single entry payload; anything larger means corruption.
const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// An action observed while replaying the record stream.
#[derive(Debug)]
pub enum LogEntryAction {
    Append(Entry),
    RemoveHead,
    RemoveTail,
}

/// The parsed log file header.
#[derive(Debug, Clone)]
pub struct LogHeader {
    pub dbid: String,
    pub snapshot_last: LogId,
}

/// The outcome of opening a log file.
pub struct LogRecovery {
    /// The live entries, after folding removal records.
    pub entries: Vec<Entry>,
    /// True if a partial trailing record was discarded.
    pub truncated_tail: bool,
}

/// A handle to an open log file. Owned exclusively by the consensus task.
pub struct RaftLog {
    path: PathBuf,
    file: BufWriter<File>,
    dbid: String,
    snapshot_last: LogId,
    /// Index of the first live entry (`snapshot_last.index + 1` plus any
    /// removed head records).
    first_index: u64,
    /// The index the next appended entry must carry.
    next_index: u64,
    hard_state: HardState,
}

impl RaftLog {
    /// Create a fresh log file at `path` with the given snapshot boundary
    /// and zero entries, replacing any existing file. Synced before
    /// returning.
    pub fn create(path: impl Into<PathBuf>, dbid: &str, snapshot_last: LogId) -> anyhow::Result<Self> {
        let path = path.into();
        if dbid.len() != DBID_LEN {
            bail!("dbid must be exactly {} bytes, got {}", DBID_LEN, dbid.len());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("creating raft log {:?}", path))?;
        let mut w = BufWriter::new(file);
        w.write_all(&LOG_MAGIC.to_le_bytes())?;
        w.write_all(&LOG_VERSION.to_le_bytes())?;
        w.write_all(dbid.as_bytes())?;
        w.write_all(&snapshot_last.term.to_le_bytes())?;
        w.write_all(&snapshot_last.index.to_le_bytes())?;
        w.flush()?;
        w.get_ref().sync_data()?;
        Ok(Self {
            path,
            file: w,
            dbid: dbid.to_string(),
            snapshot_last,
            first_index: snapshot_last.index + 1,
            next_index: snapshot_last.index + 1,
            hard_state: HardState::default(),
        })
    }

    /// Open an existing log file, replaying its record stream.
    ///
    /// A partial trailing record is discarded (the file is truncated back
    /// to the last complete record) and reported via
    /// `LogRecovery::truncated_tail`.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<(Self, LogRecovery)> {
        let path = path.into();
        let file =
            OpenOptions::new().read(true).write(true).open(&path).with_context(|| format!("opening raft log {:?}", path))?;

        let mut entries: Vec<Entry> = Vec::new();
        let mut removed_head = 0u64;
        let mut hard_state = HardState::default();

        let mut reader = BufReader::new(file);
        let header = read_header(&mut reader)?;

        let mut good_offset = HEADER_LEN;
        let mut truncated_tail = false;
        loop {
            match read_record(&mut reader) {
                Ok(Some((action, len))) => {
                    match action {
                        RawRecord::Entry(entry) => entries.push(entry),
                        RawRecord::RemoveHead => {
                            if entries.is_empty() {
                                bail!("log {:?} removes the head of an empty log", path);
                            }
                            entries.remove(0);
                            removed_head += 1;
                        }
                        RawRecord::RemoveTail => {
                            if entries.pop().is_none() {
                                bail!("log {:?} removes the tail of an empty log", path);
                            }
                        }
                        RawRecord::Term { term, vote } => {
                            hard_state.current_term = term;
                            hard_state.voted_for = vote;
                        }
                        RawRecord::Vote { vote } => hard_state.voted_for = vote,
                    }
                    good_offset += len;
                }
                Ok(None) => break,
                Err(ReadError::TruncatedTail) => {
                    truncated_tail = true;
                    break;
                }
                Err(ReadError::Corrupt(msg)) => bail!("corrupt raft log {:?}: {}", path, msg),
                Err(ReadError::Io(err)) => return Err(err).context("reading raft log"),
            }
        }

        let mut file = reader.into_inner();
        if truncated_tail {
            tracing::warn!(?path, good_offset, "discarding partial trailing record in raft log");
            file.set_len(good_offset)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::End(0))?;

        let first_index = header.snapshot_last.index + 1 + removed_head;
        let next_index = first_index + entries.len() as u64;

        // Entries must line up contiguously behind the snapshot boundary.
        for (i, entry) in entries.iter().enumerate() {
            let want = first_index + i as u64;
            if entry.log_id.index != want {
                bail!(
                    "corrupt raft log {:?}: entry at position {} has index {}, want {}",
                    path,
                    i,
                    entry.log_id.index,
                    want
                );
            }
        }

        let log = Self {
            path,
            file: BufWriter::new(file),
            dbid: header.dbid,
            snapshot_last: header.snapshot_last,
            first_index,
            next_index,
            hard_state,
        };
        Ok((log, LogRecovery { entries, truncated_tail }))
    }

    /// Replay a log file's record stream through a callback, without
    /// constructing a handle. Used to feed entries into recovery.
    pub fn load_entries<F>(path: &Path, mut cb: F) -> anyhow::Result<LogHeader>
    where F: FnMut(LogEntryAction) {
        let file = File::open(path).with_context(|| format!("opening raft log {:?}", path))?;
        let mut reader = BufReader::new(file);
        let header = read_header(&mut reader)?;
        loop {
            match read_record(&mut reader) {
                Ok(Some((record, _))) => match record {
                    RawRecord::Entry(entry) => cb(LogEntryAction::Append(entry)),
                    RawRecord::RemoveHead => cb(LogEntryAction::RemoveHead),
                    RawRecord::RemoveTail => cb(LogEntryAction::RemoveTail),
                    RawRecord::Term { .. } | RawRecord::Vote { .. } => {}
                },
                Ok(None) | Err(ReadError::TruncatedTail) => break,
                Err(ReadError::Corrupt(msg)) => bail!("corrupt raft log {:?}: {}", path, msg),
                Err(ReadError::Io(err)) => return Err(err).context("reading raft log"),
            }
        }
        Ok(header)
    }

    /// Buffer an entry for appending. Not durable until `sync`.
    pub fn append(&mut self, entry: &Entry) -> anyhow::Result<()> {
        if entry.log_id.index != self.next_index {
            bail!(
                "non-contiguous append to raft log: entry index {}, want {}",
                entry.log_id.index,
                self.next_index
            );
        }
        let payload = serde_json::to_vec(&entry.payload)?;
        if payload.len() as u32 > MAX_PAYLOAD_LEN {
            bail!("entry payload of {} bytes exceeds the maximum", payload.len());
        }
        self.file.write_all(&[REC_ENTRY])?;
        self.file.write_all(&entry.log_id.term.to_le_bytes())?;
        self.file.write_all(&entry.log_id.index.to_le_bytes())?;
        self.file.write_all(&[payload_kind(&entry.payload)])?;
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&payload)?;
        self.next_index += 1;
        Ok(())
    }

    /// Flush buffered records and fsync. After this returns, every
    /// previously appended record is durable.
    pub fn sync(&mut self) -> anyhow::Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Pop the lowest live entry. Compaction only.
    pub fn remove_head(&mut self) -> anyhow::Result<()> {
        if self.entry_count() == 0 {
            bail!("remove_head on an empty raft log");
        }
        self.file.write_all(&[REC_REMOVE_HEAD])?;
        self.first_index += 1;
        Ok(())
    }

    /// Pop the highest live entry. Used when a conflicting uncommitted
    /// suffix must be truncated. Synced before returning.
    pub fn remove_tail(&mut self) -> anyhow::Result<()> {
        if self.entry_count() == 0 {
            bail!("remove_tail on an empty raft log");
        }
        self.file.write_all(&[REC_REMOVE_TAIL])?;
        self.next_index -= 1;
        self.sync()
    }

    /// Persist a new current term (resetting the vote). Synced.
    pub fn set_term(&mut self, term: u64, vote: Option<NodeId>) -> anyhow::Result<()> {
        self.file.write_all(&[REC_TERM])?;
        self.file.write_all(&term.to_le_bytes())?;
        write_vote(&mut self.file, vote)?;
        self.hard_state = HardState {
            current_term: term,
            voted_for: vote,
        };
        self.sync()
    }

    /// Persist a vote for the current term. Synced before the vote may be
    /// acknowledged.
    pub fn set_vote(&mut self, vote: Option<NodeId>) -> anyhow::Result<()> {
        self.file.write_all(&[REC_VOTE])?;
        write_vote(&mut self.file, vote)?;
        self.hard_state.voted_for = vote;
        self.sync()
    }

    /// Rename the backing file to `new_path`, replacing whatever is there.
    /// Used to atomically adopt a rewritten log produced by the snapshot
    /// worker.
    pub fn persist_to(&mut self, new_path: impl Into<PathBuf>) -> anyhow::Result<()> {
        let new_path = new_path.into();
        std::fs::rename(&self.path, &new_path)
            .with_context(|| format!("renaming raft log {:?} -> {:?}", self.path, new_path))?;
        self.path = new_path;
        Ok(())
    }

    pub fn hard_state(&self) -> HardState {
        self.hard_state.clone()
    }

    pub fn dbid(&self) -> &str {
        &self.dbid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot_last(&self) -> LogId {
        self.snapshot_last
    }

    /// The number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.next_index - self.first_index
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn last_index(&self) -> u64 {
        self.next_index - 1
    }
}

fn payload_kind(payload: &EntryPayload) -> u8 {
    match payload {
        EntryPayload::Blank => 0,
        EntryPayload::Normal(_) => 1,
        EntryPayload::ConfigChange(_) => 2,
    }
}

fn write_vote(w: &mut impl Write, vote: Option<NodeId>) -> std::io::Result<()> {
    match vote {
        Some(id) => {
            w.write_all(&[1])?;
            w.write_all(&id.to_le_bytes())
        }
        None => {
            w.write_all(&[0])?;
            w.write_all(&0u64.to_le_bytes())
        }
    }
}

enum RawRecord {
    Entry(Entry),
    RemoveHead,
    RemoveTail,
    Term { term: u64, vote: Option<NodeId> },
    Vote { vote: Option<NodeId> },
}

enum ReadError {
    /// Clean EOF in the middle of a record: a crash mid-append.
    TruncatedTail,
    Corrupt(String),
    Io(std::io::Error),
}

fn read_header(r: &mut impl Read) -> anyhow::Result<LogHeader> {
    let magic = read_u32(r).map_err(|_| anyhow::anyhow!("file too short for a log header"))?;
    if magic != LOG_MAGIC {
        bail!("bad log magic {:#x}", magic);
    }
    let version = read_u32(r)?;
    if version != LOG_VERSION {
        bail!("unsupported log version {}", version);
    }
    let mut dbid = [0u8; DBID_LEN];
    r.read_exact(&mut dbid)?;
    let dbid = String::from_utf8(dbid.to_vec()).context("log dbid is not valid utf-8")?;
    let term = read_u64(r)?;
    let index = read_u64(r)?;
    Ok(LogHeader {
        dbid,
        snapshot_last: LogId::new(term, index),
    })
}

/// Read one record. `Ok(None)` is a clean EOF at a record boundary; the
/// returned length is the record's total size in bytes.
fn read_record(r: &mut impl Read) -> Result<Option<(RawRecord, u64)>, ReadError> {
    let mut kind = [0u8; 1];
    match r.read_exact(&mut kind) {
        Ok(()) => {}
        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ReadError::Io(e)),
    }
    match kind[0] {
        REC_ENTRY => {
            let term = read_u64(r).map_err(truncated)?;
            let index = read_u64(r).map_err(truncated)?;
            let mut etype = [0u8; 1];
            r.read_exact(&mut etype).map_err(truncated)?;
            let len = read_u32(r).map_err(truncated)?;
            if len > MAX_PAYLOAD_LEN {
                return Err(ReadError::Corrupt(format!("payload length {} exceeds maximum", len)));
            }
            let mut payload = vec![0u8; len as usize];
            r.read_exact(&mut payload).map_err(truncated)?;
            let payload: EntryPayload = serde_json::from_slice(&payload)
                .map_err(|e| ReadError::Corrupt(format!("undecodable entry payload: {}", e)))?;
            if payload_kind(&payload) != etype[0] {
                return Err(ReadError::Corrupt(format!(
                    "entry type tag {} does not match payload",
                    etype[0]
                )));
            }
            let entry = Entry {
                log_id: LogId::new(term, index),
                payload,
            };
            Ok(Some((RawRecord::Entry(entry), 1 + 8 + 8 + 1 + 4 + len as u64)))
        }
        REC_REMOVE_HEAD => Ok(Some((RawRecord::RemoveHead, 1))),
        REC_REMOVE_TAIL => Ok(Some((RawRecord::RemoveTail, 1))),
        REC_TERM => {
            let term = read_u64(r).map_err(truncated)?;
            let vote = read_vote(r).map_err(truncated)?;
            Ok(Some((RawRecord::Term { term, vote }, 1 + 8 + 9)))
        }
        REC_VOTE => {
            let vote = read_vote(r).map_err(truncated)?;
            Ok(Some((RawRecord::Vote { vote }, 1 + 9)))
        }
        other => Err(ReadError::Corrupt(format!("unknown record kind {:#x}", other))),
    }
}

fn truncated(e: std::io::Error) -> ReadError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ReadError::TruncatedTail
    } else {
        ReadError::Io(e)
    }
}

fn read_vote(r: &mut impl Read) -> std::io::Result<Option<NodeId>> {
    let mut set = [0u8; 1];
    r.read_exact(&mut set)?;
    let id = read_u64(r)?;
    Ok(if set[0] == 1 { Some(id) } else { None })
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KvCommand;

    fn entry(term: u64, index: u64, key: &str) -> Entry {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Normal(KvCommand::new(vec![
                b"SET".to_vec(),
                key.as_bytes().to_vec(),
                b"v".to_vec(),
            ])),
        }
    }

    fn dbid() -> String {
        "d".repeat(DBID_LEN)
    }

    #[test]
    fn create_append_reopen_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let mut log = RaftLog::create(&path, &dbid(), LogId::default()).unwrap();
        log.append(&entry(1, 1, "a")).unwrap();
        log.append(&entry(1, 2, "b")).unwrap();
        log.set_term(1, Some(7)).unwrap();
        log.sync().unwrap();
        drop(log);

        let (log, recovery) = RaftLog::open(&path).unwrap();
        assert!(!recovery.truncated_tail);
        assert_eq!(recovery.entries.len(), 2);
        assert_eq!(recovery.entries[0], entry(1, 1, "a"));
        assert_eq!(recovery.entries[1], entry(1, 2, "b"));
        assert_eq!(log.dbid(), dbid());
        assert_eq!(log.entry_count(), 2);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.hard_state(), HardState {
            current_term: 1,
            voted_for: Some(7)
        });
    }

    #[test]
    fn snapshot_boundary_plus_entries_is_last_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let boundary = LogId::new(3, 10);
        let mut log = RaftLog::create(&path, &dbid(), boundary).unwrap();
        log.append(&entry(3, 11, "a")).unwrap();
        log.append(&entry(3, 12, "b")).unwrap();
        log.sync().unwrap();
        drop(log);

        let (log, recovery) = RaftLog::open(&path).unwrap();
        assert_eq!(log.snapshot_last(), boundary);
        assert_eq!(
            log.snapshot_last().index + recovery.entries.len() as u64,
            log.last_index()
        );
    }

    #[test]
    fn truncated_trailing_entry_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let mut log = RaftLog::create(&path, &dbid(), LogId::default()).unwrap();
        log.append(&entry(1, 1, "a")).unwrap();
        log.sync().unwrap();
        drop(log);

        // Simulate a crash mid-append: a record header with no payload.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[REC_ENTRY]).unwrap();
            f.write_all(&2u64.to_le_bytes()).unwrap();
            f.sync_data().unwrap();
        }

        let (log, recovery) = RaftLog::open(&path).unwrap();
        assert!(recovery.truncated_tail);
        assert_eq!(recovery.entries.len(), 1);
        assert_eq!(log.last_index(), 1);

        // Reopening again after the truncation is clean.
        drop(log);
        let (_, recovery) = RaftLog::open(&path).unwrap();
        assert!(!recovery.truncated_tail);
        assert_eq!(recovery.entries.len(), 1);
    }

    #[test]
    fn remove_tail_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let mut log = RaftLog::create(&path, &dbid(), LogId::default()).unwrap();
        log.append(&entry(1, 1, "a")).unwrap();
        log.append(&entry(1, 2, "b")).unwrap();
        log.append(&entry(2, 3, "c")).unwrap();
        log.sync().unwrap();
        log.remove_tail().unwrap();
        log.remove_tail().unwrap();
        assert_eq!(log.last_index(), 1);
        drop(log);

        let (log, recovery) = RaftLog::open(&path).unwrap();
        assert_eq!(recovery.entries.len(), 1);
        assert_eq!(recovery.entries[0].log_id, LogId::new(1, 1));
        assert_eq!(log.entry_count(), 1);
    }

    #[test]
    fn remove_head_advances_first_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let mut log = RaftLog::create(&path, &dbid(), LogId::default()).unwrap();
        log.append(&entry(1, 1, "a")).unwrap();
        log.append(&entry(1, 2, "b")).unwrap();
        log.remove_head().unwrap();
        log.sync().unwrap();
        assert_eq!(log.first_index(), 2);
        assert_eq!(log.entry_count(), 1);
        drop(log);

        let (log, recovery) = RaftLog::open(&path).unwrap();
        assert_eq!(recovery.entries.len(), 1);
        assert_eq!(recovery.entries[0].log_id, LogId::new(1, 2));
        assert_eq!(log.first_index(), 2);
    }

    #[test]
    fn vote_is_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let mut log = RaftLog::create(&path, &dbid(), LogId::default()).unwrap();
        log.set_term(4, None).unwrap();
        log.set_vote(Some(2)).unwrap();
        drop(log);

        let (log, _) = RaftLog::open(&path).unwrap();
        assert_eq!(log.hard_state(), HardState {
            current_term: 4,
            voted_for: Some(2)
        });
    }

    #[test]
    fn non_contiguous_append_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let mut log = RaftLog::create(&path, &dbid(), LogId::default()).unwrap();
        log.append(&entry(1, 1, "a")).unwrap();
        assert!(log.append(&entry(1, 5, "oops")).is_err());
    }

    #[test]
    fn load_entries_streams_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let mut log = RaftLog::create(&path, &dbid(), LogId::default()).unwrap();
        log.append(&entry(1, 1, "a")).unwrap();
        log.append(&entry(1, 2, "b")).unwrap();
        log.sync().unwrap();
        log.remove_tail().unwrap();
        drop(log);

        let mut seen = Vec::new();
        let header = RaftLog::load_entries(&path, |action| {
            seen.push(format!("{:?}", action).split('(').next().unwrap().trim_end().to_string());
        })
        .unwrap();
        assert_eq!(header.dbid, dbid());
        assert_eq!(seen, vec!["Append", "Append", "RemoveTail"]);
    }
}
