//! Node configuration.
//!
//! Every field has a default so a JSON file only needs to name what differs.
//! The `node` binary layers command-line flags on top of the file.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entry::NodeId;
use crate::error::{KvError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This node's id; must be a key of `peers`.
    pub node_id: NodeId,
    /// Every cluster member, including this node.
    pub peers: BTreeMap<NodeId, SocketAddr>,
    /// Root directory for WAL files. Each node writes under `node-<id>/`.
    pub data_dir: PathBuf,
    /// Number of fixed, equal ranges the hash ring is cut into.
    pub shard_count: u32,
    /// Virtual nodes placed on the ring per physical node.
    pub vnodes_per_node: u32,
    /// Replicas per shard (N). Quorum is `N / 2 + 1`.
    pub replication_factor: usize,
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before ALIVE becomes SUSPECT (K).
    pub suspect_after: u32,
    /// Further missed heartbeats before SUSPECT becomes DEAD (M).
    pub dead_after: u32,
    pub rpc_timeout_ms: u64,
    pub replication_timeout_ms: u64,
    pub wal_timeout_ms: u64,
    pub election_interval_ms: u64,
    pub catchup_interval_ms: u64,
    /// Entries per catch-up response.
    pub catchup_batch: usize,
    /// How far ahead of the last applied sequence an entry may arrive and
    /// still be buffered. Entries further ahead wait for catch-up instead.
    pub gap_threshold: u64,
    /// Upper bound on a client write, including retries across failover.
    pub request_timeout_ms: u64,
    /// Entries kept per shard WAL after compaction. `None` disables compaction.
    pub wal_retention: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: BTreeMap::new(),
            data_dir: PathBuf::from("data"),
            shard_count: 16,
            vnodes_per_node: 128,
            replication_factor: 3,
            heartbeat_interval_ms: 1000,
            suspect_after: 3,
            dead_after: 5,
            rpc_timeout_ms: 500,
            replication_timeout_ms: 1000,
            wal_timeout_ms: 2000,
            election_interval_ms: 1000,
            catchup_interval_ms: 2000,
            catchup_batch: 256,
            gap_threshold: 64,
            request_timeout_ms: 5000,
            wal_retention: None,
        }
    }
}

impl Config {
    pub fn new(node_id: NodeId, peers: BTreeMap<NodeId, SocketAddr>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            peers,
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|err| KvError::InvalidConfig(format!("{}: {err}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(KvError::InvalidConfig(msg.to_string()));
        if !self.peers.contains_key(&self.node_id) {
            return Err(KvError::InvalidConfig(format!(
                "node id {} missing from peers map",
                self.node_id
            )));
        }
        if self.shard_count == 0 {
            return invalid("shard_count must be at least 1");
        }
        if self.vnodes_per_node == 0 {
            return invalid("vnodes_per_node must be at least 1");
        }
        if self.replication_factor == 0 {
            return invalid("replication_factor must be at least 1");
        }
        if self.suspect_after == 0 || self.dead_after == 0 {
            return invalid("suspect_after and dead_after must be at least 1");
        }
        if self.catchup_batch == 0 {
            return invalid("catchup_batch must be at least 1");
        }
        for (name, millis) in self.durations_ms() {
            if millis == 0 {
                return Err(KvError::InvalidConfig(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }

    /// Every interval and timeout setting, by field name. Tokio's `interval`
    /// panics on a zero period and a zero timeout fails every call.
    fn durations_ms(&self) -> [(&'static str, u64); 7] {
        [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("election_interval_ms", self.election_interval_ms),
            ("catchup_interval_ms", self.catchup_interval_ms),
            ("rpc_timeout_ms", self.rpc_timeout_ms),
            ("replication_timeout_ms", self.replication_timeout_ms),
            ("wal_timeout_ms", self.wal_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ]
    }

    pub fn quorum(&self) -> usize {
        crate::replication::quorum(self.replication_factor)
    }

    pub fn node_dir(&self) -> PathBuf {
        self.data_dir.join(format!("node-{}", self.node_id))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    pub fn wal_timeout(&self) -> Duration {
        Duration::from_millis(self.wal_timeout_ms)
    }

    pub fn election_interval(&self) -> Duration {
        Duration::from_millis(self.election_interval_ms)
    }

    pub fn catchup_interval(&self) -> Duration {
        Duration::from_millis(self.catchup_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(ids: &[NodeId]) -> BTreeMap<NodeId, SocketAddr> {
        ids.iter()
            .map(|&id| (id, format!("127.0.0.1:{}", 7100 + id).parse().unwrap()))
            .collect()
    }

    #[test]
    fn defaults_validate_when_node_is_a_peer() {
        let config = Config::new(2, peers(&[1, 2, 3]), "data");
        assert!(config.validate().is_ok());
        assert_eq!(config.quorum(), 2);
        assert_eq!(config.node_dir(), PathBuf::from("data/node-2"));
    }

    #[test]
    fn rejects_node_missing_from_peers() {
        let config = Config::new(9, peers(&[1, 2, 3]), "data");
        assert!(matches!(config.validate(), Err(KvError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_zero_replication_factor() {
        let mut config = Config::new(1, peers(&[1]), "data");
        config.replication_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_intervals_and_timeouts() {
        let base = Config::new(1, peers(&[1]), "data");
        for (name, _) in base.durations_ms() {
            let mut json = serde_json::to_value(&base).unwrap();
            json[name] = 0.into();
            let config: Config = serde_json::from_value(json).unwrap();
            match config.validate() {
                Err(KvError::InvalidConfig(msg)) => assert!(msg.starts_with(name), "{msg}"),
                other => panic!("zero {name} accepted: {other:?}"),
            }
        }
    }

    #[test]
    fn zero_interval_in_json_is_rejected() {
        let json = r#"{ "node_id": 1, "peers": { "1": "127.0.0.1:7101" }, "heartbeat_interval_ms": 0 }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        match config.validate() {
            Err(KvError::InvalidConfig(msg)) => assert!(msg.contains("heartbeat_interval_ms")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn partial_json_takes_defaults() {
        let json = r#"{ "node_id": 3, "peers": { "3": "127.0.0.1:7103" }, "shard_count": 4 }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.node_id, 3);
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.suspect_after, 3);
        assert!(config.validate().is_ok());
    }
}
