//! Runtime configuration for a replikv node.

use rand::thread_rng;
use rand::Rng;

use crate::error::ConfigError;

/// The runtime configuration for a node.
///
/// Durations are in milliseconds. The defaults follow the usual Raft
/// inequality `broadcastTime ≪ electionTimeout ≪ MTBF`: the tick interval
/// (which doubles as the heartbeat interval) must be well under the
/// election timeout, or healthy leaders will be deposed by their own
/// followers.
#[derive(Clone, Debug)]
pub struct Config {
    /// The application specific name of this cluster, used in logging.
    pub cluster_name: String,
    /// The interval at which the consensus task ticks: heartbeats are sent
    /// and snapshot progress is polled at this cadence.
    pub raft_interval: u64,
    /// The timeout applied to a single outbound peer RPC. Expired RPCs fail
    /// the in-flight call and are not retried; the next heartbeat retries.
    pub request_timeout: u64,
    /// The minimum election timeout.
    pub election_timeout_min: u64,
    /// The maximum election timeout.
    pub election_timeout_max: u64,
    /// The interval at which disconnected peers are re-resolved and
    /// reconnected.
    pub reconnect_interval: u64,
    /// The timeout for sending and installing a single snapshot segment.
    pub install_snapshot_timeout: u64,
    /// The number of log entries accumulated past the last snapshot which
    /// triggers a new snapshot.
    pub max_log_entries: u64,
    /// An artificial delay applied before the snapshot worker starts
    /// writing. Debug knob, normally 0.
    pub compact_delay: u64,
    /// The maximum number of entries per AppendEntries payload.
    pub max_payload_entries: u64,
    /// How far behind a follower must fall, in log entries, before it is
    /// considered lagging rather than at line rate.
    pub replication_lag_threshold: u64,
    /// The maximum chunk size when streaming a snapshot to a peer, in bytes.
    pub snapshot_max_chunk_size: u64,
}

impl Config {
    /// Start a builder process with the defaults for the given cluster name.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            config: Config {
                cluster_name,
                raft_interval: 100,
                request_timeout: 250,
                election_timeout_min: 500,
                election_timeout_max: 1000,
                reconnect_interval: 100,
                install_snapshot_timeout: 1000,
                max_log_entries: 10_000,
                compact_delay: 0,
                max_payload_entries: 300,
                replication_lag_threshold: 1000,
                snapshot_max_chunk_size: 3 * 1024 * 1024,
            },
        }
    }

    /// Generate a new random election timeout within the configured
    /// min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder; finish with [`ConfigBuilder::validate`].
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn raft_interval(mut self, ms: u64) -> Self {
        self.config.raft_interval = ms;
        self
    }

    pub fn request_timeout(mut self, ms: u64) -> Self {
        self.config.request_timeout = ms;
        self
    }

    pub fn election_timeout_min(mut self, ms: u64) -> Self {
        self.config.election_timeout_min = ms;
        self
    }

    pub fn election_timeout_max(mut self, ms: u64) -> Self {
        self.config.election_timeout_max = ms;
        self
    }

    pub fn reconnect_interval(mut self, ms: u64) -> Self {
        self.config.reconnect_interval = ms;
        self
    }

    pub fn install_snapshot_timeout(mut self, ms: u64) -> Self {
        self.config.install_snapshot_timeout = ms;
        self
    }

    pub fn max_log_entries(mut self, n: u64) -> Self {
        self.config.max_log_entries = n;
        self
    }

    pub fn compact_delay(mut self, ms: u64) -> Self {
        self.config.compact_delay = ms;
        self
    }

    pub fn max_payload_entries(mut self, n: u64) -> Self {
        self.config.max_payload_entries = n;
        self
    }

    pub fn replication_lag_threshold(mut self, n: u64) -> Self {
        self.config.replication_lag_threshold = n;
        self
    }

    pub fn snapshot_max_chunk_size(mut self, n: u64) -> Self {
        self.config.snapshot_max_chunk_size = n;
        self
    }

    /// Validate the state of this config and unwrap it.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let c = self.config;
        if c.election_timeout_min >= c.election_timeout_max {
            return Err(ConfigError::ElectionTimeout {
                min: c.election_timeout_min,
                max: c.election_timeout_max,
            });
        }
        if c.election_timeout_min <= c.raft_interval {
            return Err(ConfigError::ElectionTimeoutLTTick {
                election_timeout_min: c.election_timeout_min,
                raft_interval: c.raft_interval,
            });
        }
        if c.max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadIs0);
        }
        if c.max_log_entries == 0 {
            return Err(ConfigError::MaxLogEntriesIs0);
        }
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::build("test".into()).validate().unwrap();
        assert_eq!(config.raft_interval, 100);
        assert_eq!(config.request_timeout, 250);
        assert_eq!(config.max_log_entries, 10_000);
    }

    #[test]
    fn rand_election_timeout_is_within_bounds() {
        let config = Config::build("test".into()).validate().unwrap();
        for _ in 0..100 {
            let t = config.new_rand_election_timeout();
            assert!(t >= config.election_timeout_min);
            assert!(t < config.election_timeout_max);
        }
    }

    #[test]
    fn inverted_election_timeouts_are_rejected() {
        let res = Config::build("test".into()).election_timeout_min(1000).election_timeout_max(500).validate();
        assert_eq!(res.unwrap_err(), ConfigError::ElectionTimeout { min: 1000, max: 500 });
    }

    #[test]
    fn election_timeout_must_exceed_tick() {
        let res = Config::build("test".into()).raft_interval(600).validate();
        assert_eq!(res.unwrap_err(), ConfigError::ElectionTimeoutLTTick {
            election_timeout_min: 500,
            raft_interval: 600,
        });
    }
}
