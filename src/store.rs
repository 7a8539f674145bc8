//! The replicated in-memory key-value dataset.
//!
//! Every committed log entry is applied here, in index order, on every
//! cluster member. Application is deterministic: the same sequence of
//! commands always yields the same dataset, which is what makes the
//! snapshot image interchangeable between nodes.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::raft::MembershipConfig;
use crate::LogId;
use crate::MessageSummary;

/// A client command to be replicated: an argv vector of byte strings.
///
/// Commands round-trip byte-for-byte through a log entry; interpretation
/// happens only at apply time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCommand {
    pub argv: Vec<Vec<u8>>,
}

impl KvCommand {
    pub fn new<I, A>(argv: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    /// The command name: the first argument, uppercased.
    fn name(&self) -> Option<String> {
        self.argv.first().map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
    }
}

impl MessageSummary for KvCommand {
    fn summary(&self) -> String {
        self.argv.iter().map(|a| String::from_utf8_lossy(a).into_owned()).collect::<Vec<_>>().join(" ")
    }
}

/// The reply produced by applying a command to the dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvResponse {
    Ok,
    Value(Option<Vec<u8>>),
    Integer(i64),
    Error(String),
}

/// Snapshot metadata embedded in the dataset.
///
/// There is a single instance per dataset. It is initialized at cluster
/// setup, its `last_applied` field advances with every applied entry, and
/// it is serialized into (and reloaded from) every snapshot image so that
/// a restarting or joining node can recover the cluster identity and
/// membership without replaying the whole history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// True once this info was loaded from a snapshot image.
    pub loaded: bool,
    /// The 32-character cluster identifier, fixed at cluster init.
    pub dbid: String,
    /// The id of the last entry applied to the dataset. Never decreases.
    pub last_applied: LogId,
    /// Cluster membership as of `last_applied`.
    pub membership: MembershipConfig,
}

/// The dataset proper: snapshot info plus the key space.
///
/// Keys are required to be valid UTF-8 (commands carrying non-UTF-8 keys
/// are answered with an error, deterministically); values are opaque
/// bytes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub info: SnapshotInfo,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Dataset {
    /// Apply a single command, returning its reply.
    ///
    /// Must remain deterministic: no clocks, no randomness, no I/O.
    pub fn apply(&mut self, cmd: &KvCommand) -> KvResponse {
        let name = match cmd.name() {
            Some(name) => name,
            None => return KvResponse::Error("empty command".into()),
        };

        match name.as_str() {
            "SET" => match cmd.argv.as_slice() {
                [_, key, value] => match std::str::from_utf8(key) {
                    Ok(key) => {
                        self.data.insert(key.to_owned(), value.clone());
                        KvResponse::Ok
                    }
                    Err(_) => KvResponse::Error("key is not valid utf-8".into()),
                },
                _ => KvResponse::Error("wrong number of arguments for SET".into()),
            },
            "GET" => match cmd.argv.as_slice() {
                [_, key] => match std::str::from_utf8(key) {
                    Ok(key) => KvResponse::Value(self.data.get(key).cloned()),
                    Err(_) => KvResponse::Error("key is not valid utf-8".into()),
                },
                _ => KvResponse::Error("wrong number of arguments for GET".into()),
            },
            "DEL" => {
                if cmd.argv.len() < 2 {
                    return KvResponse::Error("wrong number of arguments for DEL".into());
                }
                let mut removed = 0;
                for key in &cmd.argv[1..] {
                    if let Ok(key) = std::str::from_utf8(key) {
                        if self.data.remove(key).is_some() {
                            removed += 1;
                        }
                    }
                }
                KvResponse::Integer(removed)
            }
            "EXISTS" => match cmd.argv.as_slice() {
                [_, key] => {
                    let found = std::str::from_utf8(key).map(|k| self.data.contains_key(k)).unwrap_or(false);
                    KvResponse::Integer(found as i64)
                }
                _ => KvResponse::Error("wrong number of arguments for EXISTS".into()),
            },
            "INCR" => match cmd.argv.as_slice() {
                [_, key] => match std::str::from_utf8(key) {
                    Ok(key) => {
                        let current = match self.data.get(key) {
                            Some(raw) => match std::str::from_utf8(raw).ok().and_then(|s| s.parse::<i64>().ok()) {
                                Some(n) => n,
                                None => {
                                    return KvResponse::Error("value is not an integer".into());
                                }
                            },
                            None => 0,
                        };
                        let next = current + 1;
                        self.data.insert(key.to_owned(), next.to_string().into_bytes());
                        KvResponse::Integer(next)
                    }
                    Err(_) => KvResponse::Error("key is not valid utf-8".into()),
                },
                _ => KvResponse::Error("wrong number of arguments for INCR".into()),
            },
            other => KvResponse::Error(format!("unknown command {:?}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> KvCommand {
        KvCommand::new(parts.iter().map(|p| p.as_bytes().to_vec()))
    }

    #[test]
    fn set_then_get_returns_value() {
        let mut ds = Dataset::default();
        assert_eq!(ds.apply(&cmd(&["SET", "k", "v"])), KvResponse::Ok);
        assert_eq!(ds.apply(&cmd(&["GET", "k"])), KvResponse::Value(Some(b"v".to_vec())));
        assert_eq!(ds.apply(&cmd(&["GET", "missing"])), KvResponse::Value(None));
    }

    #[test]
    fn del_counts_removed_keys() {
        let mut ds = Dataset::default();
        ds.apply(&cmd(&["SET", "a", "1"]));
        ds.apply(&cmd(&["SET", "b", "2"]));
        assert_eq!(ds.apply(&cmd(&["DEL", "a", "b", "c"])), KvResponse::Integer(2));
        assert_eq!(ds.apply(&cmd(&["EXISTS", "a"])), KvResponse::Integer(0));
    }

    #[test]
    fn incr_starts_from_zero_and_rejects_non_integers() {
        let mut ds = Dataset::default();
        assert_eq!(ds.apply(&cmd(&["INCR", "n"])), KvResponse::Integer(1));
        assert_eq!(ds.apply(&cmd(&["INCR", "n"])), KvResponse::Integer(2));
        ds.apply(&cmd(&["SET", "s", "abc"]));
        assert!(matches!(ds.apply(&cmd(&["INCR", "s"])), KvResponse::Error(_)));
    }

    #[test]
    fn command_names_are_case_insensitive() {
        let mut ds = Dataset::default();
        assert_eq!(ds.apply(&cmd(&["set", "k", "v"])), KvResponse::Ok);
        assert_eq!(ds.apply(&cmd(&["get", "k"])), KvResponse::Value(Some(b"v".to_vec())));
    }

    #[test]
    fn unknown_and_empty_commands_error() {
        let mut ds = Dataset::default();
        assert!(matches!(ds.apply(&cmd(&["NOPE"])), KvResponse::Error(_)));
        assert!(matches!(ds.apply(&KvCommand { argv: vec![] }), KvResponse::Error(_)));
    }

    #[test]
    fn apply_is_deterministic_across_replicas() {
        let script = vec![
            cmd(&["SET", "x", "1"]),
            cmd(&["INCR", "x"]),
            cmd(&["SET", "y", "hello"]),
            cmd(&["DEL", "missing"]),
        ];
        let mut a = Dataset::default();
        let mut b = Dataset::default();
        let ra: Vec<_> = script.iter().map(|c| a.apply(c)).collect();
        let rb: Vec<_> = script.iter().map(|c| b.apply(c)).collect();
        assert_eq!(ra, rb);
        assert_eq!(a.data, b.data);
    }
}
